//! Cancelable timers driven by the event loop's ticks.
//!
//! Nothing here sleeps or spawns. Every timer is a deadline slot owned by the
//! session; the loop polls it with the current time and it fires at most once
//! per arming. Cancelling is clearing the slot.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SECOND: Duration = Duration::from_secs(1);

/// Source of the current time
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A single pending deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Returns true if a pending deadline was dropped
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fires once when `now` has reached the deadline, returning the deadline
    /// that elapsed so the caller can schedule relative to it.
    pub fn poll(&mut self, now: Instant) -> Option<Instant> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(deadline)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    Tick(u32),
    Expired,
}

/// Whole-second countdown backed by one timer
#[derive(Debug, Clone, Default)]
pub struct Countdown {
    timer: Timer,
    remaining: u32,
}

impl Countdown {
    pub fn start(&mut self, now: Instant, secs: u32) {
        self.remaining = secs;
        if secs > 0 {
            self.timer.arm(now + SECOND);
        }
    }

    /// One step per elapsed second. Call until it returns `None` to catch up
    /// after a late poll.
    pub fn tick(&mut self, now: Instant) -> Option<CountdownStep> {
        let fired = self.timer.poll(now)?;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            return Some(CountdownStep::Expired);
        }
        // re-arm from the deadline, not from `now`, so late polls don't drift
        self.timer.arm(fired + SECOND);
        Some(CountdownStep::Tick(self.remaining))
    }

    pub fn cancel(&mut self) -> bool {
        self.timer.cancel()
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStep {
    Show(usize),
    Finished,
}

/// Walks the operands of a round one dwell at a time.
///
/// `start` shows index 0 and arms the dwell timer; each time the timer fires
/// `advance` moves to the next index and re-arms, until the last operand's
/// dwell elapses and the sequencer reports `Finished`. Only one loop can run
/// at a time.
#[derive(Debug, Clone)]
pub struct DisplaySequencer {
    dwell: Duration,
    len: usize,
    index: Option<usize>,
    timer: Timer,
    running: bool,
}

impl DisplaySequencer {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            len: 0,
            index: None,
            timer: Timer::default(),
            running: false,
        }
    }

    /// Returns `Some(0)` when a new loop was started, `None` if one is already
    /// running or there is nothing to show.
    pub fn start(&mut self, now: Instant, len: usize) -> Option<usize> {
        if self.running || len == 0 {
            return None;
        }
        self.running = true;
        self.len = len;
        self.index = Some(0);
        self.timer.arm(now + self.dwell);
        Some(0)
    }

    pub fn poll(&mut self, now: Instant) -> Option<DisplayStep> {
        let fired = self.timer.poll(now)?;
        Some(self.advance(fired))
    }

    fn advance(&mut self, at: Instant) -> DisplayStep {
        let next = self.index.map_or(0, |i| i + 1);
        if next < self.len {
            self.index = Some(next);
            self.timer.arm(at + self.dwell);
            DisplayStep::Show(next)
        } else {
            self.running = false;
            DisplayStep::Finished
        }
    }

    pub fn cancel(&mut self) -> bool {
        self.running = false;
        self.timer.cancel()
    }

    pub fn reset(&mut self) {
        self.cancel();
        self.index = None;
        self.len = 0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }
}
