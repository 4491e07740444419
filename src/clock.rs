// =============================================================================
// Time/Market Clock — ET conversion, DTE, market-hours gating
// =============================================================================
//
// No teacher counterpart: the source engine trades crypto around the clock
// and never needs a notion of a trading session. Built fresh in the
// teacher's plain free-function module style (see `indicators/atr.rs` for
// the header-comment-documents-the-formula convention this follows).
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;

/// Regular session: 09:30–15:50 ET. The last ten minutes of the official
/// 09:30–16:00 session are reserved so the Time Exit rule always has room
/// to fire before the close.
const MARKET_OPEN: (u32, u32) = (9, 30);
const MARKET_CLOSE: (u32, u32) = (15, 50);

/// Fixed-date NYSE holidays. A full holiday calendar (including floating
/// holidays like Thanksgiving) belongs in a maintained table; this is the
/// minimal fixed set needed to avoid trading on the obvious closures.
fn is_holiday(d: NaiveDate) -> bool {
    matches!((d.month(), d.day()), (1, 1) | (6, 19) | (7, 4) | (12, 25))
}

/// Convert a UTC timestamp to US/Eastern wall-clock time.
pub fn to_eastern(utc: DateTime<Utc>) -> DateTime<chrono_tz::Tz> {
    utc.with_timezone(&New_York)
}

/// Whether `utc` falls within the regular trading session (weekday,
/// non-holiday, 09:30–15:50 ET).
pub fn is_market_hours(utc: DateTime<Utc>) -> bool {
    let et = to_eastern(utc);
    if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    if is_holiday(et.date_naive()) {
        return false;
    }
    let open = NaiveTime::from_hms_opt(MARKET_OPEN.0, MARKET_OPEN.1, 0).unwrap();
    let close = NaiveTime::from_hms_opt(MARKET_CLOSE.0, MARKET_CLOSE.1, 0).unwrap();
    let t = et.time();
    t >= open && t <= close
}

/// True once ET wall-clock time is at or past `cutoff` ("HH:MM").
pub fn is_past_et_cutoff(utc: DateTime<Utc>, cutoff: &str) -> bool {
    let Some((h, m)) = parse_hhmm(cutoff) else {
        return false;
    };
    let et = to_eastern(utc);
    let cutoff_time = NaiveTime::from_hms_opt(h, m, 0).unwrap();
    et.time() >= cutoff_time
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

/// Calendar days to expiration, counting the expiration date itself as a
/// valid trading day (an option expiring "today" has DTE = 0).
pub fn dte(now: DateTime<Utc>, expiration: NaiveDate) -> i64 {
    let today = to_eastern(now).date_naive();
    (expiration - today).num_days()
}

/// Build a UTC instant for `expiration` at standard options expiration
/// (market close ET), used when a chain's quote set needs a reference
/// instant rather than a bare date.
pub fn expiration_close_utc(expiration: NaiveDate) -> DateTime<Utc> {
    let naive = expiration.and_hms_opt(16, 0, 0).unwrap();
    New_York
        .from_local_datetime(&naive)
        .single()
        .unwrap_or_else(|| New_York.from_utc_datetime(&naive))
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn market_hours_weekday_midday() {
        // 2026-08-03 is a Monday.
        let t = Utc.with_ymd_and_hms(2026, 8, 3, 15, 0, 0).unwrap(); // 11:00 ET
        assert!(is_market_hours(t));
    }

    #[test]
    fn market_hours_weekend_rejected() {
        let t = Utc.with_ymd_and_hms(2026, 8, 1, 15, 0, 0).unwrap(); // Saturday
        assert!(!is_market_hours(t));
    }

    #[test]
    fn market_hours_after_close_rejected() {
        let t = Utc.with_ymd_and_hms(2026, 8, 3, 20, 30, 0).unwrap(); // 16:30 ET
        assert!(!is_market_hours(t));
    }

    #[test]
    fn dte_counts_calendar_days() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 15, 0, 0).unwrap();
        let exp = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        assert_eq!(dte(now, exp), 32);
    }
}
