// =============================================================================
// Scoring Engine — credit/debit composite scores, shared math primitives only
// =============================================================================
//
// Grounded on the teacher's `signals/weighted_score.rs` structural shape
// (a `SignalInput`/weighted-sum composite returning a `ScoringResult`), but
// with entirely new weights/filters per the spread-scoring math. Credit and
// debit scoring are kept as independent functions — they share only these
// math primitives, never a weight table or threshold, matching the design
// note that the two families evolve independently.
// =============================================================================

pub mod credit;
pub mod debit;

use serde::{Deserialize, Serialize};

pub fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

pub fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Normalizes a percentage-looking value: anything above 1.0 is assumed to
/// be on a 0–100 scale and divided down.
pub fn normalize_pct(x: f64) -> f64 {
    if x > 1.0 {
        x / 100.0
    } else {
        x
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub components: Vec<(String, f64, f64)>, // (name, value, weight)
    pub composite: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScoreResult {
    Accepted(ScoreComponents),
    Rejected { reason: String },
}

impl ScoreResult {
    pub fn composite(&self) -> Option<f64> {
        match self {
            ScoreResult::Accepted(c) => Some(c.composite),
            ScoreResult::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_bounds() {
        assert_eq!(clamp(5.0, 0.0, 1.0), 1.0);
        assert_eq!(clamp(-5.0, 0.0, 1.0), 0.0);
        assert_eq!(clamp(0.5, 0.0, 1.0), 0.5);
    }

    #[test]
    fn normalize_pct_handles_both_scales() {
        assert!((normalize_pct(65.0) - 0.65).abs() < 1e-9);
        assert!((normalize_pct(0.65) - 0.65).abs() < 1e-9);
    }
}
