// =============================================================================
// Broker call audit — in-process counters plus the persisted audit row
// =============================================================================
//
// Grounded on the teacher's `rate_limit.rs`: lock-free atomic counters
// tracking recent call volume, queried by any task without contention.
// Unlike the teacher, this crate has no header-driven weight budget to
// enforce — the counters exist purely for the `AppState` health snapshot —
// so every completed call is persisted as a `broker_events` row regardless
// of the in-process counts.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use crate::store::{new_id, BrokerEventRow, Store};

#[derive(Default)]
pub struct AuditCounters {
    calls_total: AtomicU64,
    calls_failed: AtomicU64,
}

impl AuditCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn calls_failed(&self) -> u64 {
        self.calls_failed.load(Ordering::Relaxed)
    }

    fn record(&self, ok: bool) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One audit row per broker call. `error_text` is truncated to keep the
/// persisted row bounded — the full error still reaches `tracing`.
#[allow(clippy::too_many_arguments)]
pub async fn record_call(
    store: &Store,
    counters: &AuditCounters,
    operation: &str,
    symbol: Option<&str>,
    order_id: Option<&str>,
    status_code: Option<i64>,
    ok: bool,
    duration_ms: i64,
    mode: &str,
    strategy: Option<&str>,
    error_text: Option<&str>,
) {
    counters.record(ok);

    let row = BrokerEventRow {
        id: new_id(),
        operation: operation.to_string(),
        symbol: symbol.map(str::to_string),
        order_id: order_id.map(str::to_string),
        status_code,
        ok,
        duration_ms,
        mode: mode.to_string(),
        strategy: strategy.map(str::to_string),
        error_text: error_text.map(|e| e.chars().take(500).collect()),
        created_at: chrono::Utc::now(),
    };

    if let Err(e) = store.record_broker_event(&row).await {
        tracing::warn!(error = %e, operation, "failed to persist broker audit row");
    }
}
