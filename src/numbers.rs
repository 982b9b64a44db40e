use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

use crate::error::{ServiceError, ServiceResult};
use crate::session::{ExerciseKind, NumberRequest, NumberSequence, SessionConfig, MAX_OPERAND};

/// Where round operands come from
pub trait NumberSource: Send + Sync {
    /// Materializes an exercise for a config that has no exercise id yet
    fn create_exercise(&self, config: &SessionConfig) -> ServiceResult<String>;

    fn generate(&self, req: &NumberRequest) -> ServiceResult<NumberSequence>;
}

/// Generates operands in-process
#[derive(Debug)]
pub struct LocalGenerator {
    kind: ExerciseKind,
    rng: Mutex<StdRng>,
}

impl LocalGenerator {
    pub fn new(kind: ExerciseKind) -> Self {
        Self {
            kind,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(kind: ExerciseKind, seed: u64) -> Self {
        Self {
            kind,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// `bounds` narrowed to what this kind may emit: addition operands are
    /// positive, and no operand exceeds `MAX_OPERAND` in magnitude.
    fn operand_range(&self, req: &NumberRequest) -> (i64, i64) {
        let (lo, hi) = bounds(req);
        let floor = match self.kind {
            ExerciseKind::Addition => 1,
            ExerciseKind::Mixed => -MAX_OPERAND,
        };
        let lo = lo.clamp(floor, MAX_OPERAND);
        (lo, hi.clamp(lo, MAX_OPERAND))
    }

    fn generate_with<R: Rng>(&self, rng: &mut R, req: &NumberRequest) -> Vec<i64> {
        let (lo, hi) = self.operand_range(req);
        let mut numbers: Vec<i64> = Vec::with_capacity(req.card_count);
        let mut running = 0i64;

        for i in 0..req.card_count {
            let mut value = rng.gen_range(lo..=hi);
            // avoid showing the same card twice in a row when the range allows it
            let mut tries = 0;
            while hi > lo && tries < 8 && numbers.last().map(|p| p.abs()) == Some(value.abs()) {
                value = rng.gen_range(lo..=hi);
                tries += 1;
            }

            if self.kind == ExerciseKind::Mixed
                && i > 0
                && value > 0
                && running.saturating_sub(value) >= 0
                && rng.gen_bool(0.5)
            {
                value = -value;
            }

            running = running.saturating_add(value);
            numbers.push(value);
        }
        numbers
    }
}

impl Default for LocalGenerator {
    fn default() -> Self {
        Self::new(ExerciseKind::Addition)
    }
}

/// Inclusive operand range for a request; an explicit min/max wins over the
/// digit length.
pub fn bounds(req: &NumberRequest) -> (i64, i64) {
    let digits = req.digit_length.clamp(1, 18) as u32;
    let digit_lo = if digits == 1 { 1 } else { 10i64.pow(digits - 1) };
    let digit_hi = 10i64.pow(digits) - 1;
    let lo = req.min.unwrap_or(digit_lo);
    let hi = req.max.unwrap_or(digit_hi).max(lo);
    (lo, hi)
}

impl NumberSource for LocalGenerator {
    fn create_exercise(&self, config: &SessionConfig) -> ServiceResult<String> {
        Ok(format!(
            "local-{}-{}x{}",
            config.exercise_type_id, config.card_count, config.digit_length
        ))
    }

    fn generate(&self, req: &NumberRequest) -> ServiceResult<NumberSequence> {
        if req.card_count == 0 {
            return Err(ServiceError::Unavailable(
                "cannot generate an empty sequence".into(),
            ));
        }
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ServiceError::Unavailable("generator lock poisoned".into()))?;
        let numbers = self.generate_with(&mut *rng, req);
        Ok(NumberSequence::from_numbers(numbers))
    }
}
