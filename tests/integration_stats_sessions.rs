use std::sync::Arc;
use std::time::Duration;

use anzan::exercise::{Backend, ExerciseSession, Phase};
use anzan::runtime::QueueDispatcher;
use anzan::session::{ExerciseKind, Feedback, SessionConfig};
use anzan::stats::StatsDb;
use anzan::timer::ManualClock;
use assert_matches::assert_matches;

struct Driver {
    session: ExerciseSession,
    queue: QueueDispatcher,
    clock: ManualClock,
}

impl Driver {
    fn new(db: Arc<StatsDb>, speed: f64) -> Self {
        let config = SessionConfig {
            card_count: 3,
            display_speed: speed,
            min: Some(1),
            max: Some(1),
            ..SessionConfig::new("addition", "Addition")
        };
        let queue = QueueDispatcher::new();
        let clock = ManualClock::new();
        let session = ExerciseSession::new(
            config,
            "student-7",
            Backend::local(db, ExerciseKind::Addition),
            queue.clone(),
        )
        .with_clock(clock.clone());
        Self {
            session,
            queue,
            clock,
        }
    }

    fn pump(&mut self) {
        while let Some(completion) = self.queue.run_next() {
            self.session.on_completion(completion);
        }
    }

    fn tick_until(&mut self, phase: Phase) {
        for _ in 0..1000 {
            if self.session.phase() == phase {
                return;
            }
            self.clock.advance(Duration::from_millis(100));
            self.session.on_tick();
        }
        panic!("never reached {phase}, stuck in {}", self.session.phase());
    }

    /// Plays one round and answers with `answer`
    fn play(&mut self, answer: &str) -> Feedback {
        self.tick_until(Phase::AwaitingAnswer);
        assert!(self.session.set_answer(answer));
        assert!(self.session.submit());
        self.pump();
        self.session.feedback()
    }

    fn play_rounds(&mut self, answers: &[&str]) {
        self.session.start().unwrap();
        self.pump();
        for (i, answer) in answers.iter().enumerate() {
            if i > 0 {
                assert!(self.session.next_round());
                self.pump();
            }
            self.play(answer);
        }
    }

    fn finish(&mut self) -> Vec<String> {
        self.session.end_session();
        self.pump();
        let mut earned = Vec::new();
        while let Some(a) = self.session.achievements().current() {
            earned.push(a.id.clone());
            self.session.acknowledge_achievement();
        }
        earned
    }
}

#[test]
fn achievements_accumulate_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.db");

    {
        let db = Arc::new(StatsDb::open(&path).unwrap());
        let mut driver = Driver::new(db, 1.0);
        driver.play_rounds(&["3", "3", "3", "3", "3"]);
        assert_eq!(driver.session.total_correct(), 5);
        assert_eq!(driver.finish(), vec!["first_session", "flawless"]);
    }

    // reopen the file: earlier achievements are not announced again
    let db = Arc::new(StatsDb::open(&path).unwrap());
    let mut driver = Driver::new(db.clone(), 0.5);
    driver.play_rounds(&["3", "3", "3", "3", "3"]);
    assert_eq!(driver.finish(), vec!["ten_correct", "lightning"]);

    let rows = db.recent_attempts("student-7", 10).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.completed_at.is_some() && r.score == Some(100)));
}

#[test]
fn mixed_outcomes_score_and_persist() {
    let db = Arc::new(StatsDb::open_in_memory().unwrap());
    let mut driver = Driver::new(db.clone(), 1.0);
    driver.session.start().unwrap();
    driver.pump();

    assert_eq!(driver.play("3"), Feedback::Correct);
    driver.session.next_round();
    driver.pump();
    assert_eq!(driver.play("4"), Feedback::Incorrect);
    driver.session.next_round();
    driver.pump();
    driver.tick_until(Phase::AwaitingAnswer);
    driver.tick_until(Phase::Feedback);
    driver.pump();
    assert_eq!(driver.session.feedback(), Feedback::Timeout);

    // mid-session totals reach the store before the session ends
    let id: i64 = driver.session.attempt_id().unwrap().parse().unwrap();
    let row = db.attempt(id).unwrap().unwrap();
    assert_eq!((row.total_attempts, row.total_correct), (3, 1));
    assert_eq!(row.completed_at, None);

    assert_eq!(driver.finish(), vec!["first_session"]);
    let row = db.attempt(id).unwrap().unwrap();
    assert_eq!(row.score, Some(33));
    assert!(row.completed_at.is_some());
}

#[test]
fn answers_within_epsilon_are_correct() {
    let db = Arc::new(StatsDb::open_in_memory().unwrap());
    let mut driver = Driver::new(db, 1.0);
    driver.session.start().unwrap();
    driver.pump();
    assert_eq!(driver.play("3.0000001"), Feedback::Correct);
    driver.session.next_round();
    driver.pump();
    assert_eq!(driver.play("3,1"), Feedback::Incorrect);
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let db = Arc::new(StatsDb::open_in_memory().unwrap());
    let config = SessionConfig {
        display_speed: -1.0,
        ..SessionConfig::new("addition", "Addition")
    };
    let queue = QueueDispatcher::new();
    let mut session = ExerciseSession::new(
        config,
        "student-7",
        Backend::local(db.clone(), ExerciseKind::Addition),
        queue.clone(),
    );
    assert_matches!(session.start(), Err(anzan::SessionError::InvalidConfig(_)));
    assert_eq!(queue.pending(), 0);
    drop(session);
    assert!(db.recent_attempts("student-7", 1).unwrap().is_empty());
}
