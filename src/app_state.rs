// =============================================================================
// Central Application State — composition root
// =============================================================================
//
// The single place every cycle and engine is constructed from and shared
// through. Generalizes the teacher's `AppState`: kept is the monotonic
// version counter and the ring-buffered recent-error/recent-event logs;
// dropped is the dashboard snapshot/REST surface (`build_snapshot` and its
// ~10 serializable DTOs), since this crate ships no admin API of its own.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::BrokerClient;
use crate::notify::{NotificationSink, NotifyEvent};
use crate::risk::RiskEngine;
use crate::store::Store;

const MAX_RECENT_ERRORS: usize = 50;
const MAX_RECENT_EVENTS: usize = 100;

/// A recorded error for operator-facing logs.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation (a trade opened, closed, or a cycle's error logged).
    pub state_version: AtomicU64,

    pub store: Store,
    pub broker: BrokerClient,
    pub risk: Arc<RiskEngine>,
    pub sink: Arc<dyn NotificationSink>,

    recent_errors: RwLock<VecDeque<ErrorRecord>>,
    recent_events: RwLock<VecDeque<String>>,

    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(store: Store, broker: BrokerClient, risk: Arc<RiskEngine>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            state_version: AtomicU64::new(0),
            store,
            broker,
            risk,
            sink,
            recent_errors: RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
            recent_events: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
            start_time: Utc::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        if errors.len() == MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord { message: message.into(), at: Utc::now() });
        self.increment_version();
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }

    fn push_event(&self, summary: String) {
        let mut events = self.recent_events.write();
        if events.len() == MAX_RECENT_EVENTS {
            events.pop_front();
        }
        events.push_back(summary);
        self.increment_version();
    }

    pub fn recent_events(&self) -> Vec<String> {
        self.recent_events.read().iter().cloned().collect()
    }

    /// Dispatches a lifecycle event to the configured sink and mirrors a
    /// short summary into the in-process ring buffer so a future admin
    /// surface (out of scope here) has something to read without
    /// round-tripping through `system_logs`.
    pub async fn notify(&self, event: NotifyEvent) {
        self.push_event(format!("{event:?}"));
        self.sink.notify(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_errors_ring_buffer_drops_oldest() {
        let errors: RwLock<VecDeque<ErrorRecord>> = RwLock::new(VecDeque::with_capacity(2));
        {
            let mut e = errors.write();
            for i in 0..MAX_RECENT_ERRORS + 5 {
                if e.len() == MAX_RECENT_ERRORS {
                    e.pop_front();
                }
                e.push_back(ErrorRecord { message: format!("err{i}"), at: Utc::now() });
            }
        }
        let e = errors.read();
        assert_eq!(e.len(), MAX_RECENT_ERRORS);
        assert_eq!(e.front().unwrap().message, "err5");
    }
}
