// =============================================================================
// Credit-spread scoring
// =============================================================================

use super::{clamp, logistic, normalize_pct, ScoreComponents, ScoreResult};
use crate::types::TradingMode;

/// Minimum credit as a fraction of spread width; below this the spread
/// doesn't pay enough for the risk taken regardless of score.
pub const MIN_CREDIT_FRACTION: f64 = 0.16;

/// Hard-coded engine-level composite-score floor for credit spreads (§9
/// dual-threshold decision): enforced here regardless of any admin-configured
/// `min_score`, which can only raise the bar, never lower it below this.
pub const COMPOSITE_SCORE_FLOOR: f64 = 0.70;

#[derive(Debug, Clone, Copy)]
pub struct CreditCandidate {
    pub pop: f64,
    pub delta_short: f64,
    pub ivr: f64,
    pub skew: f64,
    pub credit: f64,
    pub width: f64,
    pub short_pct_spread: f64,
    pub long_pct_spread: f64,
}

pub fn score(c: &CreditCandidate, mode: TradingMode, min_credit_fraction: f64) -> ScoreResult {
    let pop = normalize_pct(c.pop);
    let ivr = normalize_pct(c.ivr);
    let is_sandbox = matches!(mode, TradingMode::SandboxPaper);

    if pop < 0.65 {
        return reject("POP_TOO_LOW");
    }

    let delta_range = if is_sandbox { (0.15, 0.35) } else { (0.18, 0.28) };
    let abs_delta = c.delta_short.abs();
    if abs_delta < delta_range.0 || abs_delta > delta_range.1 {
        return reject("DELTA_OUT_OF_RANGE");
    }

    if !is_sandbox && !(0.15..=0.70).contains(&ivr) {
        return reject("IVR_OUT_OF_RANGE");
    }

    if !c.skew.is_finite() || c.skew.abs() > 2.0 {
        return reject("SKEW_INVALID");
    }

    if c.credit < c.width * min_credit_fraction {
        return reject("CREDIT_TOO_LOW");
    }

    let pop_component = clamp((clamp(pop, 0.5, 0.9) - 0.5) / 0.4, 0.0, 1.0);
    let credit_quality = logistic(15.0 * (c.credit / c.width - 0.22));
    let ivr_component = clamp(1.0 - 7.5 * (ivr - 0.45).abs(), 0.0, 1.0);
    let delta_component = clamp(1.0 - (abs_delta - 0.25).abs() / 0.07, 0.0, 1.0);
    let liquidity = clamp(
        1.0 - 12.0 * (c.short_pct_spread + c.long_pct_spread),
        0.0,
        1.0,
    );
    let skew_component = skew_soft_score(c.skew);

    let mut weights = [
        ("pop", pop_component, 0.40),
        ("credit_quality", credit_quality, 0.25),
        ("ivr", ivr_component, 0.20),
        ("delta", delta_component, 0.08),
        ("liquidity", liquidity, 0.04),
        ("skew", skew_component, 0.03),
    ];

    if is_sandbox {
        // IVR weight is zeroed in SANDBOX_PAPER and the remainder renormalized.
        let ivr_weight = weights[2].2;
        weights[2].2 = 0.0;
        let remaining: f64 = weights.iter().map(|(_, _, w)| *w).sum();
        let scale = (remaining + ivr_weight) / remaining;
        for (_, _, w) in weights.iter_mut() {
            *w *= scale;
        }
    }

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

fn skew_soft_score(skew: f64) -> f64 {
    let abs_skew = skew.abs();
    if abs_skew <= 0.10 {
        1.0
    } else {
        clamp(1.0 - (abs_skew - 0.10) / 0.40, 0.0, 1.0)
    }
}

fn reject(reason: &str) -> ScoreResult {
    ScoreResult::Rejected {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_candidate() -> CreditCandidate {
        CreditCandidate {
            pop: 0.90,
            delta_short: -0.25,
            ivr: 0.45,
            skew: 0.05,
            credit: 1.50,
            width: 5.0,
            short_pct_spread: 0.01,
            long_pct_spread: 0.01,
        }
    }

    #[test]
    fn credit_quality_rewards_higher_credit_ratio() {
        // ratio=0.17 -> spec value 0.321; ratio=0.30 -> spec value 0.768.
        let low = logistic(15.0 * (0.17 - 0.22));
        let high = logistic(15.0 * (0.30 - 0.22));
        assert!((low - 0.321).abs() < 1e-3);
        assert!((high - 0.768).abs() < 1e-3);
        assert!(high > low);
    }

    #[test]
    fn credit_too_low_rejects_below_min_fraction() {
        let mut c = base_candidate();
        c.credit = 0.50;
        c.width = 5.0; // credit/width = 0.10 < 0.16
        assert!(matches!(
            score(&c, TradingMode::Live, 0.16),
            ScoreResult::Rejected { reason } if reason == "CREDIT_TOO_LOW"
        ));

        c.credit = 0.76; // credit/width = 0.152, still < 0.16
        assert!(matches!(
            score(&c, TradingMode::Live, 0.16),
            ScoreResult::Rejected { reason } if reason == "CREDIT_TOO_LOW"
        ));
    }

    #[test]
    fn credit_too_low_uses_configured_fraction_not_the_constant() {
        let mut c = base_candidate();
        c.credit = 1.0;
        c.width = 5.0; // credit/width = 0.20, clears the 0.16 constant...
        assert!(matches!(
            score(&c, TradingMode::Live, 0.25), // ...but not an operator-configured 0.25 floor
            ScoreResult::Rejected { reason } if reason == "CREDIT_TOO_LOW"
        ));
    }

    #[test]
    fn credit_spread_that_clears_min_fraction_is_scored() {
        let mut c = base_candidate();
        c.credit = 1.50; // credit/width = 0.30 >= 0.16
        c.width = 5.0;
        let result = score(&c, TradingMode::Live, 0.16);
        assert!(result.composite().is_some());
    }

    #[test]
    fn composite_below_engine_floor_is_rejected_even_when_every_hard_filter_passes() {
        // Every individual gate clears, but mediocre pop/delta/ivr/credit
        // values keep the composite under the 0.70 engine floor.
        let c = CreditCandidate {
            pop: 0.66,
            delta_short: -0.22,
            ivr: 0.40,
            skew: 0.05,
            credit: 0.85,
            width: 5.0,
            short_pct_spread: 0.01,
            long_pct_spread: 0.01,
        };
        assert!(matches!(
            score(&c, TradingMode::Live, 0.16),
            ScoreResult::Rejected { reason } if reason == "COMPOSITE_BELOW_ENGINE_FLOOR"
        ));
    }

    #[test]
    fn sandbox_mode_ignores_ivr_filter() {
        let mut c = base_candidate();
        c.ivr = 5.0; // wildly out of range, ignored in sandbox
        assert!(score(&c, TradingMode::SandboxPaper, 0.16).composite().is_some());
    }
}
