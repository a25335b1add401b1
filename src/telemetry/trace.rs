//! Request-scoped correlation context.

use chrono::Utc;
use uuid::Uuid;

use super::events::{TraceEvent, TraceEventKind};

/// Correlation ids for one frontend request, passed explicitly through the
/// call path rather than stored in process-wide state.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub request_id: String,
    pub session_id: Option<String>,
}

impl TraceContext {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            request_id: Uuid::new_v4().to_string(),
            session_id,
        }
    }

    /// Context for work not tied to a frontend request (startup, supervision).
    pub fn background() -> Self {
        Self::new(None)
    }

    /// Stamp an event payload with this context and the current time.
    pub fn event(&self, kind: TraceEventKind) -> TraceEvent {
        TraceEvent {
            trace_id: self.trace_id.clone(),
            request_id: self.request_id.clone(),
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            kind,
        }
    }
}
