// =============================================================================
// Exit Rule Ladder — ordered, first-match-wins evaluation
// =============================================================================
//
// Grounded structurally on the teacher's `exit/triple_barrier.rs`
// `BarrierState::evaluate`: a single ordered pass over independent
// triggers, returning the first that matches, with `max_seen_profit_fraction`
// tightened monotonically exactly like the teacher's SL-tightening rules.
// The concrete rules replace the teacher's single-leg SL/TP/time ladder
// entirely, per spec.md §4.5.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::clock;
use crate::types::ExitReason;

#[derive(Debug, Clone, Copy)]
pub struct ExitInputs {
    pub mark: f64,
    pub pnl_fraction: f64,
    pub loss_fraction: f64,
    pub dte: i64,
    pub iv_now: f64,
    pub iv_entry: f64,
    pub max_seen_profit_fraction: f64,
    pub quote_integrity_ok: bool,
    pub structural_break: bool,
    pub low_value_floor: f64,
    pub now: DateTime<Utc>,
}

pub struct RuleThresholds {
    pub time_exit_dte: i64,
    pub time_exit_cutoff: String,
    pub stop_loss_fraction: f64,
    pub trail_arm_profit_fraction: f64,
    pub trail_giveback_fraction: f64,
    pub profit_target_fraction: f64,
    pub iv_crush_threshold: f64,
    pub iv_crush_min_pnl: f64,
}

/// Evaluates the eight-rule ladder in order, first match wins. Returns the
/// updated `max_seen_profit_fraction` alongside the verdict — tightening is
/// monotonic, so callers must persist the returned value even when `NONE`
/// fires.
pub fn evaluate(inputs: &ExitInputs, t: &RuleThresholds) -> (ExitReason, f64) {
    let max_seen = inputs.max_seen_profit_fraction.max(inputs.pnl_fraction);

    // Rule 1: STRUCTURAL_BREAK / EMERGENCY — fires even when quote
    // integrity has failed, since it doesn't depend on a trustworthy mark.
    if inputs.structural_break {
        return (ExitReason::StructuralBreak, max_seen);
    }
    if !inputs.quote_integrity_ok {
        // Quote integrity failure alone only escalates to EMERGENCY when
        // the mark is materially adverse; otherwise every other rule is
        // withheld until a trustworthy mark returns.
        if inputs.loss_fraction >= t.stop_loss_fraction {
            return (ExitReason::StructuralBreak, max_seen);
        }
        return (ExitReason::Unknown, max_seen);
    }

    // Rule 2: TIME_EXIT.
    if inputs.dte <= t.time_exit_dte && clock::is_past_et_cutoff(inputs.now, &t.time_exit_cutoff) {
        return (ExitReason::TimeExit, max_seen);
    }

    // Rule 3: STOP_LOSS.
    if inputs.loss_fraction >= t.stop_loss_fraction {
        return (ExitReason::StopLoss, max_seen);
    }

    // Rule 4: TRAIL_PROFIT.
    if max_seen >= t.trail_arm_profit_fraction
        && inputs.pnl_fraction <= max_seen - t.trail_giveback_fraction
    {
        return (ExitReason::TrailProfit, max_seen);
    }

    // Rule 5: PROFIT_TARGET.
    if inputs.pnl_fraction >= t.profit_target_fraction {
        return (ExitReason::ProfitTarget, max_seen);
    }

    // Rule 6: IV_CRUSH_EXIT.
    if inputs.iv_now <= inputs.iv_entry * t.iv_crush_threshold && inputs.pnl_fraction >= t.iv_crush_min_pnl {
        return (ExitReason::IvCrushExit, max_seen);
    }

    // Rule 7: LOW_VALUE_CLOSE.
    if inputs.mark <= inputs.low_value_floor {
        return (ExitReason::LowValueClose, max_seen);
    }

    // Rule 8: NONE.
    (ExitReason::NormalExit, max_seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thresholds() -> RuleThresholds {
        RuleThresholds {
            time_exit_dte: 1,
            time_exit_cutoff: "15:45".to_string(),
            stop_loss_fraction: 1.00,
            trail_arm_profit_fraction: 0.25,
            trail_giveback_fraction: 0.10,
            profit_target_fraction: 0.50,
            iv_crush_threshold: 0.85,
            iv_crush_min_pnl: 0.15,
        }
    }

    fn base_inputs() -> ExitInputs {
        ExitInputs {
            mark: 0.60,
            pnl_fraction: 0.10,
            loss_fraction: 0.0,
            dte: 20,
            iv_now: 0.35,
            iv_entry: 0.40,
            max_seen_profit_fraction: 0.0,
            quote_integrity_ok: true,
            structural_break: false,
            low_value_floor: 0.05,
            now: Utc.with_ymd_and_hms(2026, 8, 3, 18, 0, 0).unwrap(),
        }
    }

    #[test]
    fn structural_break_wins_regardless_of_other_state() {
        let mut inputs = base_inputs();
        inputs.structural_break = true;
        inputs.pnl_fraction = 0.90;
        let (reason, _) = evaluate(&inputs, &thresholds());
        assert_eq!(reason, ExitReason::StructuralBreak);
    }

    #[test]
    fn iv_crush_scenario_from_literal_fixture() {
        // entry_price=0.80, mark=0.60 -> pnl_fraction=0.25; iv_entry=0.40,
        // iv_now=0.30 <= 0.40*0.85=0.34
        let mut inputs = base_inputs();
        inputs.pnl_fraction = 0.25;
        inputs.iv_now = 0.30;
        inputs.iv_entry = 0.40;
        let (reason, _) = evaluate(&inputs, &thresholds());
        assert_eq!(reason, ExitReason::IvCrushExit);
    }

    #[test]
    fn trailing_stop_arm_and_giveback_scenario() {
        // arm at pnl_fraction=0.30 (>= 0.25), then rebound to 0.18;
        // giveback 0.30-0.18=0.12 >= 0.10 -> TRAIL_PROFIT
        let mut inputs = base_inputs();
        inputs.pnl_fraction = 0.30;
        let (reason, max_seen) = evaluate(&inputs, &thresholds());
        assert_eq!(reason, ExitReason::NormalExit);
        assert!((max_seen - 0.30).abs() < 1e-9);

        inputs.pnl_fraction = 0.18;
        inputs.max_seen_profit_fraction = max_seen;
        let (reason, _) = evaluate(&inputs, &thresholds());
        assert_eq!(reason, ExitReason::TrailProfit);
    }

    #[test]
    fn max_seen_profit_fraction_is_monotonic() {
        let mut inputs = base_inputs();
        inputs.pnl_fraction = 0.40;
        let (_, max_seen) = evaluate(&inputs, &thresholds());
        inputs.pnl_fraction = 0.20;
        inputs.max_seen_profit_fraction = max_seen;
        let (_, max_seen2) = evaluate(&inputs, &thresholds());
        assert!(max_seen2 >= max_seen);
    }
}
