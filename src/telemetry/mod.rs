//! Telemetry: request correlation and structured trace events.
//!
//! Every significant step in the request path emits a [`TraceEvent`] through
//! the [`EventBus`]. Events are the only interface observability tooling may
//! rely on; log lines are a rendering of them.

mod bus;
mod events;
mod trace;

pub use bus::{spawn_event_worker, EventBus};
pub use events::{TraceEvent, TraceEventKind};
pub use trace::TraceContext;
