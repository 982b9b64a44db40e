use std::time::Duration;

use crate::session::RoundResult;

pub fn mean(data: &[f64]) -> Option<f64> {
    let sum = data.iter().sum::<f64>();
    let count = data.len();

    match count {
        positive if positive > 0 => Some(sum / count as f64),
        _ => None,
    }
}

/// Average time to answer over the rounds that got an answer
pub fn mean_response_time(rounds: &[RoundResult]) -> Option<Duration> {
    let secs: Vec<f64> = rounds
        .iter()
        .filter(|r| r.answer.is_some())
        .map(|r| r.response_time.as_secs_f64())
        .collect();
    mean(&secs).map(Duration::from_secs_f64)
}

/// Whole numbers print without a fractional part
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Feedback;

    fn round(answer: Option<f64>, millis: u64) -> RoundResult {
        RoundResult {
            numbers: vec![1, 2],
            expected_answer: 3.0,
            answer,
            feedback: Feedback::Correct,
            response_time: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[10., 20., 30., 15., 22.]), Some(19.4));
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[-10.0, 0.0, 10.0]), Some(0.0));
    }

    #[test]
    fn timeouts_do_not_count_towards_response_time() {
        let rounds = vec![round(Some(3.0), 1000), round(None, 10_000), round(Some(3.0), 3000)];
        assert_eq!(mean_response_time(&rounds), Some(Duration::from_secs(2)));
        assert_eq!(mean_response_time(&[round(None, 10_000)]), None);
    }

    #[test]
    fn formats_whole_and_fractional_numbers() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-12.0), "-12");
        assert_eq!(format_number(2.5), "2.5");
    }
}
