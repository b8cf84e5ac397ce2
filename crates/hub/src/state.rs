use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedEvents = Arc<RwLock<EventLog>>;

pub fn new_shared_events() -> SharedEvents {
    Arc::new(RwLock::new(EventLog::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Operator-facing record of things worth a human look: telemetry that
/// doesn't match any configured device, failed pushes, fired alerts.
pub struct EventLog {
    pub started_at: Instant,
    pub events: VecDeque<OperatorEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Inconsistency,
    Delivery,
    Alert,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub events: Vec<OperatorEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl EventLog {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// A measurement is reporting but nothing in the registry claims it.
    pub fn record_unmatched_measurement(&mut self, measurement: &str) {
        self.push_event(
            EventKind::Inconsistency,
            format!("measurement '{measurement}' has readings but no device config"),
        );
    }

    pub fn record_delivery_failure(&mut self, subscription_id: &str, error: &str) {
        self.push_event(
            EventKind::Delivery,
            format!("push to '{subscription_id}' failed: {error}"),
        );
    }

    pub fn record_alert(&mut self, device_id: &str, detail: String) {
        self.push_event(EventKind::Alert, format!("{device_id}: {detail}"));
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Newest first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(OperatorEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
