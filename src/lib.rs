//! Context-aware MCP gateway.
//!
//! To the client this process is one MCP server over stdio; to the
//! configured downstream servers it is an MCP client over child-process
//! transports. Every `tools/list` is answered with the small subset of the
//! discovered catalog predicted relevant to the conversation; every
//! `tools/call` is proxied to the owning server with retry and failure
//! isolation.
//!
//! ## Subsystems
//!
//! - [`gateway`]: the frontend MCP surface
//! - [`router`]: hybrid retrieval, re-ranking, confidence fallback
//! - [`zoo`]: the tool catalog with lexical and vector indexes
//! - [`pool`]: downstream child-process connections and their state machine
//! - [`session`]: per-conversation history, usage, and co-occurrence state
//! - [`telemetry`]: request correlation and structured trace events

pub mod blocking;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod zoo;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::GatewayServer;
pub use pool::{ConnectionPool, ServerState};
pub use router::{Router, RoutingDecision};
pub use session::SessionStore;
pub use telemetry::{spawn_event_worker, EventBus, TraceContext, TraceEventKind};
pub use zoo::{provider_from_config, SearchMode, ToolDescriptor, ToolZoo};
