use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anzan::exercise::{Backend, ExerciseSession, Phase};
use anzan::runtime::{AnzanEvent, FixedTicker, Runner, TestEventSource, ThreadDispatcher};
use anzan::session::{ExerciseKind, Feedback, SessionConfig};
use anzan::stats::StatsDb;

fn fixed_config(cards: usize, value: i64, speed: f64) -> SessionConfig {
    SessionConfig {
        card_count: cards,
        display_speed: speed,
        time_per_question: 2,
        min: Some(value),
        max: Some(value),
        ..SessionConfig::new("addition", "Addition")
    }
}

/// Feeds loop events into the session until `done` holds or the step budget runs out
fn drive<F>(session: &mut ExerciseSession, runner: &Runner<TestEventSource, FixedTicker>, done: F) -> bool
where
    F: Fn(&ExerciseSession) -> bool,
{
    for _ in 0..2000u32 {
        if done(session) {
            return true;
        }
        match runner.step() {
            AnzanEvent::Job(completion) => session.on_completion(completion),
            AnzanEvent::Key(_) | AnzanEvent::Resize | AnzanEvent::Tick => {}
        }
        session.on_tick();
    }
    done(session)
}

// Headless run of the real loop: worker threads post completions through the
// same channel the runner reads, and timers run on the system clock.
#[test]
fn headless_session_with_worker_threads() {
    let db = Arc::new(StatsDb::open_in_memory().unwrap());
    let (tx, rx) = mpsc::channel();
    let runner = Runner::new(
        TestEventSource::new(rx),
        FixedTicker::new(Duration::from_millis(5)),
    );

    let backend = Backend::local(db.clone(), ExerciseKind::Addition);
    let mut session = ExerciseSession::new(
        fixed_config(2, 3, 0.05),
        "headless",
        backend,
        ThreadDispatcher::new(tx),
    );

    assert!(session.start().unwrap());
    assert!(drive(&mut session, &runner, |s| s.phase() == Phase::AwaitingAnswer));

    session.set_answer("6");
    assert!(session.submit());
    assert!(drive(&mut session, &runner, |s| s.phase() == Phase::Feedback));
    assert_eq!(session.feedback(), Feedback::Correct);

    session.end_session();
    assert!(drive(&mut session, &runner, |s| !s.is_finalizing()));
    assert_eq!(
        session.achievements().current().map(|a| a.id.as_str()),
        Some("first_session")
    );

    let rows = db.recent_attempts("headless", 1).unwrap();
    assert_eq!(rows[0].total_attempts, 1);
    assert_eq!(rows[0].total_correct, 1);
    assert_eq!(rows[0].score, Some(100));
}

#[test]
fn headless_timeout_counts_as_incorrect() {
    let db = Arc::new(StatsDb::open_in_memory().unwrap());
    let (tx, rx) = mpsc::channel();
    let runner = Runner::new(
        TestEventSource::new(rx),
        FixedTicker::new(Duration::from_millis(10)),
    );
    let mut session = ExerciseSession::new(
        fixed_config(1, 4, 0.05),
        "headless",
        Backend::local(db.clone(), ExerciseKind::Addition),
        ThreadDispatcher::new(tx),
    );

    session.start().unwrap();
    assert!(drive(&mut session, &runner, |s| s.phase() == Phase::AwaitingAnswer));
    session.input_char('4');
    // no submit; the two second countdown runs out
    assert!(drive(&mut session, &runner, |s| s.phase() == Phase::Feedback));
    assert_eq!(session.feedback(), Feedback::Timeout);
    assert_eq!(session.total_attempts(), 1);
    assert_eq!(session.total_correct(), 0);
    assert!(!session.submit());

    drop(session);
    let rows = db.recent_attempts("headless", 1).unwrap();
    assert!(rows[0].completed_at.is_some());
    assert_eq!(rows[0].total_attempts, 1);
}
