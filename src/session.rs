use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SessionError;

pub const DEFAULT_CARD_COUNT: usize = 5;
pub const DEFAULT_DIGIT_LENGTH: u8 = 1;
pub const DEFAULT_DISPLAY_SPEED: f64 = 1.0;
pub const DEFAULT_TIME_PER_QUESTION: u32 = 10;
pub const MAX_DIGIT_LENGTH: u8 = 4;
pub const MAX_CARD_COUNT: usize = 100;
/// Longest an operand may stay on screen, in seconds
pub const MAX_DISPLAY_SPEED: f64 = 60.0;
pub const MAX_TIME_PER_QUESTION: u32 = 3600;
/// Largest operand magnitude a range may ask for
pub const MAX_OPERAND: i64 = 1_000_000_000;

/// How operands are combined in a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ExerciseKind {
    /// Every operand is added
    Addition,
    /// Operands may be negative; the running total never drops below zero
    Mixed,
}

impl ExerciseKind {
    pub fn from_type_id(type_id: &str) -> Self {
        match type_id.to_lowercase().as_str() {
            "mixed" | "plus-minus" | "addition-subtraction" => ExerciseKind::Mixed,
            _ => ExerciseKind::Addition,
        }
    }
}

fn default_card_count() -> usize {
    DEFAULT_CARD_COUNT
}

fn default_digit_length() -> u8 {
    DEFAULT_DIGIT_LENGTH
}

fn default_display_speed() -> f64 {
    DEFAULT_DISPLAY_SPEED
}

fn default_time_per_question() -> u32 {
    DEFAULT_TIME_PER_QUESTION
}

/// Caller-supplied settings for one session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub exercise_type_id: String,
    pub exercise_type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_id: Option<String>,
    #[serde(default = "default_card_count")]
    pub card_count: usize,
    #[serde(default = "default_digit_length")]
    pub digit_length: u8,
    /// Seconds each operand stays on screen
    #[serde(default = "default_display_speed")]
    pub display_speed: f64,
    /// Seconds allowed to answer
    #[serde(default = "default_time_per_question")]
    pub time_per_question: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

impl SessionConfig {
    pub fn new(exercise_type_id: impl Into<String>, exercise_type_name: impl Into<String>) -> Self {
        Self {
            exercise_type_id: exercise_type_id.into(),
            exercise_type_name: exercise_type_name.into(),
            exercise_id: None,
            card_count: DEFAULT_CARD_COUNT,
            digit_length: DEFAULT_DIGIT_LENGTH,
            display_speed: DEFAULT_DISPLAY_SPEED,
            time_per_question: DEFAULT_TIME_PER_QUESTION,
            min: None,
            max: None,
        }
    }

    pub fn kind(&self) -> ExerciseKind {
        ExerciseKind::from_type_id(&self.exercise_type_id)
    }

    /// Display time per operand. Zero for a speed `validate` would reject.
    pub fn dwell(&self) -> Duration {
        Duration::try_from_secs_f64(self.display_speed).unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.card_count < 1 || self.card_count > MAX_CARD_COUNT {
            return Err(SessionError::InvalidConfig(format!(
                "card count must be between 1 and {}",
                MAX_CARD_COUNT
            )));
        }
        if self.digit_length < 1 || self.digit_length > MAX_DIGIT_LENGTH {
            return Err(SessionError::InvalidConfig(format!(
                "digit length must be between 1 and {}",
                MAX_DIGIT_LENGTH
            )));
        }
        if !self.display_speed.is_finite()
            || self.display_speed <= 0.0
            || self.display_speed > MAX_DISPLAY_SPEED
        {
            return Err(SessionError::InvalidConfig(format!(
                "display speed must be more than 0 and at most {} seconds",
                MAX_DISPLAY_SPEED
            )));
        }
        if self.time_per_question == 0 || self.time_per_question > MAX_TIME_PER_QUESTION {
            return Err(SessionError::InvalidConfig(format!(
                "time per question must be between 1 and {} seconds",
                MAX_TIME_PER_QUESTION
            )));
        }
        for bound in [self.min, self.max].into_iter().flatten() {
            if bound.abs() > MAX_OPERAND {
                return Err(SessionError::InvalidConfig(format!(
                    "range bound {} is outside -{max}..={max}",
                    bound,
                    max = MAX_OPERAND
                )));
            }
        }
        if self.kind() == ExerciseKind::Addition {
            if let Some(min) = self.min.filter(|&m| m < 1) {
                return Err(SessionError::InvalidConfig(format!(
                    "addition operands are positive, range minimum {} is not",
                    min
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(SessionError::InvalidConfig(format!(
                    "range minimum {} exceeds maximum {}",
                    min, max
                )));
            }
        }
        Ok(())
    }

    pub fn number_request(&self, exercise_id: &str) -> NumberRequest {
        NumberRequest {
            exercise_id: exercise_id.to_string(),
            card_count: self.card_count,
            digit_length: self.digit_length,
            min: self.min,
            max: self.max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberRequest {
    pub exercise_id: String,
    pub card_count: usize,
    pub digit_length: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

/// Sum of `numbers`, widened so no operand list can overflow
pub fn total(numbers: &[i64]) -> f64 {
    numbers.iter().map(|&n| i128::from(n)).sum::<i128>() as f64
}

/// The operands of one round plus the answer they add up to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberSequence {
    pub numbers: Vec<i64>,
    pub expected_answer: f64,
}

impl NumberSequence {
    pub fn from_numbers(numbers: Vec<i64>) -> Self {
        let expected_answer = total(&numbers);
        Self {
            numbers,
            expected_answer,
        }
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }

    /// A sequence is only shown when there is something to show and a usable answer
    pub fn is_playable(&self) -> bool {
        !self.numbers.is_empty() && self.expected_answer.is_finite()
    }
}

/// Outcome of the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum Feedback {
    #[default]
    None,
    Correct,
    Incorrect,
    Timeout,
}

impl Feedback {
    pub fn is_correct(&self) -> bool {
        matches!(self, Feedback::Correct)
    }
}

/// One finished round, kept for the results screen and the final score
#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub numbers: Vec<i64>,
    pub expected_answer: f64,
    pub answer: Option<f64>,
    pub feedback: Feedback,
    pub response_time: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn config() -> SessionConfig {
        SessionConfig::new("addition", "Addition")
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = config();
        assert_eq!(cfg.card_count, 5);
        assert_eq!(cfg.digit_length, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_cards() {
        let cfg = SessionConfig {
            card_count: 0,
            ..config()
        };
        assert_matches!(cfg.validate(), Err(SessionError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_bad_digit_length() {
        for digits in [0, 5] {
            let cfg = SessionConfig {
                digit_length: digits,
                ..config()
            };
            assert_matches!(cfg.validate(), Err(SessionError::InvalidConfig(_)));
        }
    }

    #[test]
    fn rejects_non_positive_speed_and_time() {
        let slow = SessionConfig {
            display_speed: 0.0,
            ..config()
        };
        assert!(slow.validate().is_err());
        let nan = SessionConfig {
            display_speed: f64::NAN,
            ..config()
        };
        assert!(nan.validate().is_err());
        let no_time = SessionConfig {
            time_per_question: 0,
            ..config()
        };
        assert!(no_time.validate().is_err());
    }

    #[test]
    fn rejects_values_too_large_to_run() {
        let endless = SessionConfig {
            display_speed: 1e20,
            ..config()
        };
        assert_matches!(endless.validate(), Err(SessionError::InvalidConfig(_)));
        // building the timer from it must not panic either
        assert_eq!(endless.dwell(), Duration::ZERO);

        let huge = SessionConfig {
            min: Some(i64::MAX - 10),
            max: Some(i64::MAX),
            card_count: 3,
            ..config()
        };
        assert_matches!(huge.validate(), Err(SessionError::InvalidConfig(_)));

        let many = SessionConfig {
            card_count: MAX_CARD_COUNT + 1,
            ..config()
        };
        assert!(many.validate().is_err());
        let long = SessionConfig {
            time_per_question: MAX_TIME_PER_QUESTION + 1,
            ..config()
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn addition_range_must_be_positive() {
        let negative = SessionConfig {
            min: Some(-5),
            max: Some(5),
            ..config()
        };
        assert_matches!(negative.validate(), Err(SessionError::InvalidConfig(_)));

        let mixed = SessionConfig {
            exercise_type_id: "mixed".into(),
            ..negative
        };
        assert!(mixed.validate().is_ok());
    }

    #[test]
    fn total_does_not_overflow() {
        assert_eq!(total(&[i64::MAX, i64::MAX]), 2.0 * i64::MAX as f64);
    }

    #[test]
    fn rejects_inverted_range() {
        let cfg = SessionConfig {
            min: Some(10),
            max: Some(5),
            ..config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_caller_input_with_defaults() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"exerciseTypeId":"mixed","exerciseTypeName":"Plus/Minus","cardCount":3}"#,
        )
        .unwrap();
        assert_eq!(cfg.card_count, 3);
        assert_eq!(cfg.digit_length, DEFAULT_DIGIT_LENGTH);
        assert_eq!(cfg.time_per_question, DEFAULT_TIME_PER_QUESTION);
        assert_eq!(cfg.exercise_id, None);
        assert_eq!(cfg.kind(), ExerciseKind::Mixed);
    }

    #[test]
    fn sequence_sums_numbers() {
        let seq = NumberSequence::from_numbers(vec![3, 4]);
        assert_eq!(seq.expected_answer, 7.0);
        assert!(seq.is_playable());
        assert!(!NumberSequence::from_numbers(vec![]).is_playable());
    }

    #[test]
    fn number_request_copies_config() {
        let cfg = SessionConfig {
            card_count: 2,
            min: Some(1),
            max: Some(9),
            ..config()
        };
        let req = cfg.number_request("ex-1");
        assert_eq!(req.exercise_id, "ex-1");
        assert_eq!(req.card_count, 2);
        assert_eq!(req.min, Some(1));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["cardCount"], 2);
        assert_eq!(json["digitLength"], 1);
    }
}
