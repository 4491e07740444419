// =============================================================================
// Trade entity — strike/strategy invariants and quantity-drift scaling
// =============================================================================
//
// Generalizes the teacher's `position_engine.rs` `Position` (single-leg
// long/short) to a two-leg spread row. The persisted shape lives in
// `store::TradeRow`; this module holds the pure invariant checks and
// derived math that used to live inline on `Position` (PnL, price
// tracking) but now operate on a `&TradeRow` instead of a mutable struct,
// since the Lifecycle Controller is the sole writer of trade state.
// =============================================================================

use crate::store::TradeRow;
use crate::types::Strategy;

/// Width used for every spread in v1 (§3 Data Model).
pub const DEFAULT_WIDTH: f64 = 5.0;

/// Whether a credit-put/debit-call strategy (`long = short - width`) or a
/// debit-put/credit-call strategy (`long = short + width`).
pub fn long_is_below_short(strategy: Strategy) -> bool {
    use Strategy::*;
    matches!(strategy, BullPutCredit | BullCallDebit | IronCondor)
}

/// Validates the strike relationship named in §3: `long = short ∓ width`
/// depending on strategy family.
pub fn strikes_consistent(strategy: Strategy, short_strike: f64, long_strike: f64, width: f64) -> bool {
    let expected = if long_is_below_short(strategy) {
        short_strike - width
    } else {
        short_strike + width
    };
    (long_strike - expected).abs() < 1e-6
}

/// `realized_pnl = (entry - exit) * qty` for credit spreads, `(exit -
/// entry) * qty` for debit spreads — both legs' premiums rolled into a
/// single entry/exit pair per contract, times 100 for the per-contract
/// multiplier.
pub fn realized_pnl(strategy: Strategy, entry_price: f64, exit_price: f64, quantity: i64) -> f64 {
    let per_contract = if strategy.is_credit() {
        entry_price - exit_price
    } else {
        exit_price - entry_price
    };
    per_contract * quantity as f64 * 100.0
}

/// Scales `max_profit`/`max_loss` proportionally when `quantity` is
/// resynced from the broker-held leg quantity (§9 "Trade quantity
/// drift"). Keeps the per-contract economics constant across a quantity
/// correction rather than leaving stale totals computed against the old
/// count.
pub fn rescale_for_quantity(max_profit: f64, max_loss: f64, old_quantity: i64, new_quantity: i64) -> (f64, f64) {
    if old_quantity <= 0 || old_quantity == new_quantity {
        return (max_profit, max_loss);
    }
    let ratio = new_quantity as f64 / old_quantity as f64;
    (max_profit * ratio, max_loss * ratio)
}

/// `|short leg qty| ∧ |long leg qty|` — the smaller-magnitude side of the
/// mirror, per §9: the broker-held quantity a trade can actually act on is
/// bounded by whichever leg has less available, since a spread can't be
/// closed past its thinner leg.
pub fn available_quantity(short_leg_qty: i64, long_leg_qty: i64) -> i64 {
    short_leg_qty.abs().min(long_leg_qty.abs())
}

/// Entry price must always be persisted as a positive per-contract
/// magnitude (§9 "Price normalization invariant"), regardless of whether
/// the broker reports credit fills as negative numbers.
pub fn normalize_entry_price(raw: f64) -> f64 {
    raw.abs()
}

/// Structural invariant for an `OPEN` trade (§3, §4.10): both legs present
/// in the mirror, short negative, long positive, magnitudes equal and at
/// least `trade.quantity`.
pub fn structure_valid(trade: &TradeRow, short_leg_qty: Option<i64>, long_leg_qty: Option<i64>) -> bool {
    match (short_leg_qty, long_leg_qty) {
        (Some(short), Some(long)) => {
            short < 0 && long > 0 && short.abs() == long && long >= trade.quantity
        }
        _ => false,
    }
}

/// Spread mark per the GLOSSARY ("midpoint of the spread's current
/// bid/ask"): midpoint-of-midpoints across both legs, signed the same way
/// as the entry credit/debit. Returns `None` if either strike has dropped
/// out of the chain. The second element reports whether both legs still
/// carry a two-sided (positive bid and ask) quote.
pub fn spread_mark_from_chain(
    chain: &[crate::broker::ChainLeg],
    option_type: crate::types::OptionType,
    short_strike: f64,
    long_strike: f64,
    is_credit: bool,
) -> Option<(f64, bool)> {
    let short_leg = chain
        .iter()
        .find(|l| l.option_type == option_type && (l.strike - short_strike).abs() < 1e-6)?;
    let long_leg = chain
        .iter()
        .find(|l| l.option_type == option_type && (l.strike - long_strike).abs() < 1e-6)?;

    let short_mid = (short_leg.bid + short_leg.ask) / 2.0;
    let long_mid = (long_leg.bid + long_leg.ask) / 2.0;
    let mark = if is_credit { short_mid - long_mid } else { long_mid - short_mid };
    let quote_integrity_ok =
        short_leg.bid > 0.0 && short_leg.ask > 0.0 && long_leg.bid > 0.0 && long_leg.ask > 0.0;
    Some((mark, quote_integrity_ok))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Strategy;

    #[test]
    fn credit_put_strikes_long_below_short() {
        assert!(strikes_consistent(Strategy::BullPutCredit, 485.0, 480.0, 5.0));
        assert!(!strikes_consistent(Strategy::BullPutCredit, 485.0, 490.0, 5.0));
    }

    #[test]
    fn debit_call_matches_credit_put_direction() {
        assert!(strikes_consistent(Strategy::BullCallDebit, 485.0, 480.0, 5.0));
    }

    #[test]
    fn credit_realized_pnl_is_entry_minus_exit() {
        let pnl = realized_pnl(Strategy::BullPutCredit, 0.80, 0.60, 1);
        assert!((pnl - 20.0).abs() < 1e-9);
    }

    #[test]
    fn debit_realized_pnl_is_exit_minus_entry() {
        let pnl = realized_pnl(Strategy::BullCallDebit, 1.00, 1.50, 2);
        assert!((pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn available_quantity_is_the_thinner_leg() {
        assert_eq!(available_quantity(-3, 2), 2);
    }

    #[test]
    fn rescale_keeps_per_contract_economics() {
        let (mp, ml) = rescale_for_quantity(100.0, 400.0, 1, 67);
        assert!((mp - 6700.0).abs() < 1e-6);
        assert!((ml - 26800.0).abs() < 1e-6);
    }

    fn leg(strike: f64, bid: f64, ask: f64) -> crate::broker::ChainLeg {
        crate::broker::ChainLeg {
            symbol: format!("TEST{strike}"),
            strike,
            option_type: crate::types::OptionType::Put,
            bid,
            ask,
            delta: None,
            iv: None,
        }
    }

    #[test]
    fn spread_mark_credit_is_short_mid_minus_long_mid() {
        let chain = vec![leg(480.0, 0.20, 0.24), leg(485.0, 0.78, 0.82)];
        let (mark, ok) =
            spread_mark_from_chain(&chain, crate::types::OptionType::Put, 485.0, 480.0, true).unwrap();
        assert!((mark - (0.80 - 0.22)).abs() < 1e-9);
        assert!(ok);
    }

    #[test]
    fn spread_mark_missing_leg_returns_none() {
        let chain = vec![leg(480.0, 0.20, 0.24)];
        assert!(spread_mark_from_chain(&chain, crate::types::OptionType::Put, 485.0, 480.0, true).is_none());
    }
}
