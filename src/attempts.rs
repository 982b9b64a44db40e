//! Attempt bookkeeping: the recorder contract, achievement snapshots and the
//! one-shot final update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::error::ServiceResult;
use crate::session::SessionConfig;

/// Settings captured when the attempt is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSettings {
    pub exercise_type_id: String,
    pub exercise_type_name: String,
    pub card_count: usize,
    pub digit_length: u8,
    pub display_speed: f64,
    pub time_per_question: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

impl From<&SessionConfig> for AttemptSettings {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            exercise_type_id: cfg.exercise_type_id.clone(),
            exercise_type_name: cfg.exercise_type_name.clone(),
            card_count: cfg.card_count,
            digit_length: cfg.digit_length,
            display_speed: cfg.display_speed,
            time_per_question: cfg.time_per_question,
            min: cfg.min,
            max: cfg.max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAttempt {
    pub student_id: String,
    pub exercise_id: String,
    pub started_at: DateTime<Utc>,
    pub settings: AttemptSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_correct: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
}

impl AttemptUpdate {
    pub fn totals(total_attempts: u32, total_correct: u32) -> Self {
        Self {
            total_attempts: Some(total_attempts),
            total_correct: Some(total_correct),
            ..Self::default()
        }
    }

    pub fn completion(total_attempts: u32, total_correct: u32, completed_at: DateTime<Utc>) -> Self {
        Self {
            total_attempts: Some(total_attempts),
            total_correct: Some(total_correct),
            completed_at: Some(completed_at),
            score: Some(score(total_correct, total_attempts)),
        }
    }

    pub fn is_completion(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Persists attempt rows. The session is the only writer of a row until it
/// sets `completed_at`.
pub trait AttemptRecorder: Send + Sync {
    fn create(&self, attempt: &NewAttempt) -> ServiceResult<String>;

    fn update(&self, attempt_id: &str, update: &AttemptUpdate) -> ServiceResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Reports which achievements a student holds. The answer may lag behind a
/// just-finalized attempt.
pub trait AchievementSource: Send + Sync {
    fn achievements(&self, student_id: &str) -> ServiceResult<Vec<Achievement>>;
}

/// Percentage of correct answers, 0 for an attempt with no answers
pub fn score(total_correct: u32, total_attempts: u32) -> u32 {
    if total_attempts == 0 {
        return 0;
    }
    ((total_correct as f64 / total_attempts as f64) * 100.0).round() as u32
}

/// Achievements present in `after` but not in `before`, keeping `after`'s order
pub fn newly_earned(before: &[Achievement], after: &[Achievement]) -> Vec<Achievement> {
    let held: HashSet<&str> = before.iter().map(|a| a.id.as_str()).collect();
    after
        .iter()
        .filter(|a| !held.contains(a.id.as_str()))
        .cloned()
        .collect()
}

/// Sends the completion update, retrying once. Returns whether it landed.
pub fn finalize_with_retry(
    recorder: &dyn AttemptRecorder,
    attempt_id: &str,
    update: &AttemptUpdate,
) -> bool {
    for attempt in 1..=2 {
        match recorder.update(attempt_id, update) {
            Ok(()) => {
                tracing::info!("attempt {} finalized", attempt_id);
                return true;
            }
            Err(e) if attempt == 1 => {
                tracing::warn!("finalizing attempt {} failed, retrying: {}", attempt_id, e);
            }
            Err(e) => {
                tracing::error!(
                    "lost final update for attempt {} ({:?}): {}",
                    attempt_id,
                    update,
                    e
                );
            }
        }
    }
    false
}

/// Newly earned achievements, presented one at a time
#[derive(Debug, Clone, Default)]
pub struct AchievementQueue {
    pending: VecDeque<Achievement>,
}

impl AchievementQueue {
    pub fn new(earned: Vec<Achievement>) -> Self {
        Self {
            pending: earned.into(),
        }
    }

    pub fn current(&self) -> Option<&Achievement> {
        self.pending.front()
    }

    /// Dismisses the current achievement and returns the next one, if any
    pub fn acknowledge(&mut self) -> Option<&Achievement> {
        self.pending.pop_front();
        self.pending.front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use std::sync::Mutex;

    fn achievement(id: &str) -> Achievement {
        Achievement {
            id: id.into(),
            title: id.to_uppercase(),
            description: String::new(),
        }
    }

    struct FlakyRecorder {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl FlakyRecorder {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                calls: Mutex::new(0),
            }
        }
    }

    impl AttemptRecorder for FlakyRecorder {
        fn create(&self, _attempt: &NewAttempt) -> ServiceResult<String> {
            Ok("1".into())
        }

        fn update(&self, _attempt_id: &str, _update: &AttemptUpdate) -> ServiceResult<()> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ServiceError::Unavailable("flaky".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn score_rounds_percentage() {
        assert_eq!(score(0, 0), 0);
        assert_eq!(score(1, 3), 33);
        assert_eq!(score(2, 3), 67);
        assert_eq!(score(4, 4), 100);
    }

    #[test]
    fn diff_keeps_only_new_ids() {
        let before = vec![achievement("first_session")];
        let after = vec![
            achievement("first_session"),
            achievement("ten_correct"),
            achievement("flawless"),
        ];
        let earned = newly_earned(&before, &after);
        let ids: Vec<&str> = earned.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["ten_correct", "flawless"]);
        assert!(newly_earned(&after, &before).is_empty());
    }

    #[test]
    fn queue_advances_on_acknowledge() {
        let mut queue = AchievementQueue::new(vec![achievement("a"), achievement("b")]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.current().map(|a| a.id.as_str()), Some("a"));
        assert_eq!(queue.acknowledge().map(|a| a.id.as_str()), Some("b"));
        assert_eq!(queue.acknowledge(), None);
        assert!(queue.is_empty());
        assert_eq!(queue.acknowledge(), None);
    }

    #[test]
    fn finalize_retries_once() {
        let recorder = FlakyRecorder::new(1);
        let update = AttemptUpdate::completion(3, 2, Utc::now());
        assert!(finalize_with_retry(&recorder, "1", &update));
        assert_eq!(*recorder.calls.lock().unwrap(), 2);
    }

    #[test]
    fn finalize_gives_up_after_second_failure() {
        let recorder = FlakyRecorder::new(5);
        let update = AttemptUpdate::completion(3, 2, Utc::now());
        assert!(!finalize_with_retry(&recorder, "1", &update));
        assert_eq!(*recorder.calls.lock().unwrap(), 2);
    }

    #[test]
    fn update_omits_missing_fields() {
        let json = serde_json::to_value(AttemptUpdate::totals(2, 1)).unwrap();
        assert_eq!(json["totalAttempts"], 2);
        assert_eq!(json["totalCorrect"], 1);
        assert!(json.get("completedAt").is_none());
        assert!(json.get("score").is_none());
    }

    #[test]
    fn completion_carries_score() {
        let update = AttemptUpdate::completion(4, 3, Utc::now());
        assert!(update.is_completion());
        assert_eq!(update.score, Some(75));
    }
}
