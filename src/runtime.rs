use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{self, Event as CtEvent, KeyEvent};

use crate::exercise::Completion;

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Unified event type consumed by the app runner
#[derive(Debug)]
pub enum AnzanEvent {
    Key(KeyEvent),
    Resize,
    Tick,
    /// A background job finished
    Job(Completion),
}

/// Source of loop events (keyboard, resize, finished jobs)
pub trait AnzanEventSource: Send + 'static {
    /// Block for up to `timeout` waiting for an event.
    /// Returns Ok(event) if an event arrives before the timeout, or Err(Timeout) if it expires.
    fn recv_timeout(&self, timeout: Duration) -> Result<AnzanEvent, RecvTimeoutError>;
}

/// Production event source using crossterm
pub struct CrosstermEventSource {
    tx: Sender<AnzanEvent>,
    rx: Receiver<AnzanEvent>,
}

impl CrosstermEventSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();

        let input_tx = tx.clone();
        std::thread::spawn(move || loop {
            match event::read() {
                Ok(CtEvent::Key(key)) => {
                    if input_tx.send(AnzanEvent::Key(key)).is_err() {
                        break;
                    }
                }
                Ok(CtEvent::Resize(_, _)) => {
                    if input_tx.send(AnzanEvent::Resize).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        });

        Self { tx, rx }
    }

    /// Sender for posting job completions into the same loop
    pub fn sender(&self) -> Sender<AnzanEvent> {
        self.tx.clone()
    }
}

impl Default for CrosstermEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AnzanEventSource for CrosstermEventSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<AnzanEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Configurable ticker interface
pub trait Ticker: Send + Sync + 'static {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Test event source for unit tests
pub struct TestEventSource {
    rx: Receiver<AnzanEvent>,
}

impl TestEventSource {
    pub fn new(rx: Receiver<AnzanEvent>) -> Self {
        Self { rx }
    }
}

impl AnzanEventSource for TestEventSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<AnzanEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Runner that advances the application one event/tick at a time
pub struct Runner<E: AnzanEventSource, T: Ticker> {
    event_source: E,
    ticker: T,
}

impl<E: AnzanEventSource, T: Ticker> Runner<E, T> {
    pub fn new(event_source: E, ticker: T) -> Self {
        Self {
            event_source,
            ticker,
        }
    }

    /// Blocks up to tick interval and returns the next event, or Tick on timeout
    pub fn step(&self) -> AnzanEvent {
        match self.event_source.recv_timeout(self.ticker.interval()) {
            Ok(ev) => ev,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => AnzanEvent::Tick,
        }
    }
}

/// Work that may block (network, disk) and must stay off the loop thread
pub type Job = Box<dyn FnOnce() -> Completion + Send + 'static>;

/// Runs background jobs on behalf of a session
pub trait Dispatch {
    fn dispatch(&self, job: Job);
}

/// Runs each job on its own thread and posts the result back to the loop
#[derive(Debug, Clone)]
pub struct ThreadDispatcher {
    tx: Sender<AnzanEvent>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight count when a job thread ends, even by panic
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ThreadDispatcher {
    pub fn new(tx: Sender<AnzanEvent>) -> Self {
        Self {
            tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Jobs dispatched whose threads have not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for every dispatched job to finish.
    /// Returns false if some are still running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(IDLE_POLL);
        }
        true
    }
}

impl Dispatch for ThreadDispatcher {
    fn dispatch(&self, job: Job) {
        let tx = self.tx.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));
        std::thread::spawn(move || {
            let _guard = guard;
            // the loop may already be gone; the result is dropped then
            let _ = tx.send(AnzanEvent::Job(job()));
        });
    }
}

/// Holds jobs until the driver runs them. Used by tests and headless drivers
/// to control exactly when each background call "returns".
#[derive(Clone, Default)]
pub struct QueueDispatcher {
    jobs: Rc<RefCell<VecDeque<Job>>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.jobs.borrow().len()
    }

    /// Runs the oldest queued job
    pub fn run_next(&self) -> Option<Completion> {
        let job = self.jobs.borrow_mut().pop_front()?;
        Some(job())
    }

    /// Runs every job queued right now, in order
    pub fn run_all(&self) -> Vec<Completion> {
        let jobs: Vec<Job> = self.jobs.borrow_mut().drain(..).collect();
        jobs.into_iter().map(|job| job()).collect()
    }
}

impl Dispatch for QueueDispatcher {
    fn dispatch(&self, job: Job) {
        self.jobs.borrow_mut().push_back(job);
    }
}
