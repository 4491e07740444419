// =============================================================================
// Debit-spread scoring
// =============================================================================

use super::{clamp, normalize_pct, ScoreComponents, ScoreResult};
use crate::types::TradingMode;

/// Hard-coded engine-level composite-score floor for debit spreads (§9
/// dual-threshold decision): enforced here regardless of any admin-configured
/// `min_score`, which can only raise the bar, never lower it below this.
pub const COMPOSITE_SCORE_FLOOR: f64 = 0.85;

#[derive(Debug, Clone, Copy)]
pub struct DebitCandidate {
    pub ivr: f64,
    pub delta_long: Option<f64>,
    pub delta_short: f64,
    pub debit: f64,
    pub width: f64,
    pub short_pct_spread: f64,
    pub long_pct_spread: f64,
    /// Slope-of-SMA trend signal, already clamped to [0, 1] by the caller
    /// via [`trend_component`].
    pub trend: f64,
}

pub fn score(c: &DebitCandidate, mode: TradingMode) -> ScoreResult {
    let ivr = normalize_pct(c.ivr);
    let is_sandbox = matches!(mode, TradingMode::SandboxPaper);

    if !is_sandbox && !(0.10..=0.70).contains(&ivr) {
        return reject("IVR_OUT_OF_RANGE");
    }

    let (delta, used_fallback) = match c.delta_long {
        Some(d) => (d, false),
        None => (c.delta_short, true),
    };
    let abs_delta = delta.abs();
    if !(0.40..=0.55).contains(&abs_delta) {
        return reject("DELTA_OUT_OF_RANGE");
    }
    if used_fallback {
        tracing::warn!("debit candidate missing delta_long, falling back to delta_short");
    }

    if !(0.80..=2.50).contains(&c.debit) {
        return reject("DEBIT_OUT_OF_RANGE");
    }

    let reward_risk = (c.width - c.debit) / c.debit;
    if reward_risk < 1.0 {
        return reject("REWARD_RISK_TOO_LOW");
    }

    let trend_component = clamp(c.trend, 0.0, 1.0);
    let delta_component = clamp(1.0 - (abs_delta - 0.475).abs() / 0.075, 0.0, 1.0);
    let reward_risk_component = if reward_risk >= 1.2 {
        1.0
    } else {
        clamp(0.5 + (reward_risk - 1.0) * 2.5, 0.0, 1.0)
    };
    let ivr_component = ivr_debit_preference(ivr);
    let liquidity = clamp(
        1.0 - 12.0 * (c.short_pct_spread + c.long_pct_spread),
        0.0,
        1.0,
    );

    let weights = [
        ("trend", trend_component, 0.30),
        ("delta", delta_component, 0.25),
        ("reward_risk", reward_risk_component, 0.25),
        ("ivr", ivr_component, 0.10),
        ("liquidity", liquidity, 0.10),
    ];

    let composite: f64 = weights.iter().map(|(_, v, w)| v * w).sum();

    if composite < COMPOSITE_SCORE_FLOOR {
        return reject("COMPOSITE_BELOW_ENGINE_FLOOR");
    }

    ScoreResult::Accepted(ScoreComponents {
        components: weights
            .iter()
            .map(|(name, v, w)| (name.to_string(), *v, *w))
            .collect(),
        composite,
    })
}

/// Full credit for IVR in [0.20, 0.50], soft floor of 0.6 outside that band.
fn ivr_debit_preference(ivr: f64) -> f64 {
    if (0.20..=0.50).contains(&ivr) {
        1.0
    } else {
        0.6
    }
}

/// Trend signal for debit scoring (§4.2.3): slope of a simple moving
/// average over daily closes, clamped to [0, 1]. `period` mirrors the
/// teacher's EMA look-back convention but uses a plain SMA since only the
/// direction of drift matters here, not responsiveness to recent closes.
pub fn trend_component(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 0.5;
    }

    let sma = |slice: &[f64]| -> f64 { slice.iter().sum::<f64>() / slice.len() as f64 };

    let recent = sma(&closes[closes.len() - period..]);
    let prior = sma(&closes[closes.len() - period - 1..closes.len() - 1]);

    if prior == 0.0 || !recent.is_finite() || !prior.is_finite() {
        return 0.5;
    }

    let slope = (recent - prior) / prior;
    // A 2% move over the window maps to the top of the scale; anything
    // beyond that still clamps to 1.0 rather than rewarding it further.
    clamp(0.5 + slope * 25.0, 0.0, 1.0)
}

fn reject(reason: &str) -> ScoreResult {
    ScoreResult::Rejected {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_candidate() -> DebitCandidate {
        DebitCandidate {
            ivr: 0.30,
            delta_long: Some(0.48),
            delta_short: 0.20,
            debit: 1.00,
            width: 5.0,
            short_pct_spread: 0.01,
            long_pct_spread: 0.01,
            trend: 0.7,
        }
    }

    #[test]
    fn reward_risk_below_one_rejects() {
        let mut c = base_candidate();
        c.debit = 3.0; // (5-3)/3 = 0.67 < 1.0
        assert!(matches!(
            score(&c, TradingMode::Live),
            ScoreResult::Rejected { reason } if reason == "REWARD_RISK_TOO_LOW"
        ));
    }

    #[test]
    fn delta_long_fallback_when_missing() {
        let mut c = base_candidate();
        c.delta_long = None;
        c.delta_short = 0.475;
        c.trend = 1.0;
        assert!(score(&c, TradingMode::Live).composite().is_some());
    }

    #[test]
    fn composite_below_engine_floor_is_rejected_even_when_every_hard_filter_passes() {
        // Every individual gate clears (ivr/delta/debit/reward_risk all in
        // range), but a neutral trend and edge-of-range delta/ivr keep the
        // composite under the 0.85 engine floor.
        let c = DebitCandidate {
            ivr: 0.60,
            delta_long: Some(0.40),
            delta_short: 0.40,
            debit: 2.0,
            width: 5.0,
            short_pct_spread: 0.02,
            long_pct_spread: 0.02,
            trend: 0.5,
        };
        assert!(matches!(
            score(&c, TradingMode::Live),
            ScoreResult::Rejected { reason } if reason == "COMPOSITE_BELOW_ENGINE_FLOOR"
        ));
    }

    #[test]
    fn trend_component_flat_series_is_neutral() {
        let closes = vec![100.0; 10];
        assert!((trend_component(&closes, 5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn trend_component_uptrend_scores_above_neutral() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64 * 2.0).collect();
        assert!(trend_component(&closes, 5) > 0.5);
    }
}
