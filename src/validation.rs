use serde::{Deserialize, Serialize};

use crate::error::ServiceResult;
use crate::session::total;

/// Absolute tolerance when comparing a submitted answer to the expected one.
/// Covers floating point noise only; distinct integers never match.
pub const ANSWER_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub exercise_id: String,
    pub numbers: Vec<i64>,
    pub student_answer: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub is_correct: bool,
    pub expected_answer: f64,
    pub student_answer: f64,
    pub difference: f64,
}

/// Checks a numeric answer. Implementations must be idempotent and free of
/// side effects; the session may call them from a worker thread.
pub trait AnswerValidator: Send + Sync {
    fn validate(&self, req: &ValidationRequest) -> ServiceResult<ValidationResponse>;
}

/// Validates against the sum of the displayed numbers
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalValidator;

impl AnswerValidator for LocalValidator {
    fn validate(&self, req: &ValidationRequest) -> ServiceResult<ValidationResponse> {
        let expected = total(&req.numbers);
        Ok(check(expected, req.student_answer))
    }
}

/// Builds the response the validator would give for a known expected answer
pub fn check(expected: f64, answer: f64) -> ValidationResponse {
    ValidationResponse {
        is_correct: answers_match(expected, answer),
        expected_answer: expected,
        student_answer: answer,
        difference: answer - expected,
    }
}

pub fn answers_match(expected: f64, answer: f64) -> bool {
    (expected - answer).abs() < ANSWER_EPSILON
}

/// Parses what the student typed. Accepts a leading minus and either `.` or
/// `,` as the decimal separator; returns `None` for anything else.
pub fn parse_answer(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed.replace(',', ".");
    let valid = normalized
        .char_indices()
        .all(|(i, c)| c.is_ascii_digit() || c == '.' || (c == '-' && i == 0));
    if !valid {
        return None;
    }
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}
