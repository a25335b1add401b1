//! Trace event schema.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One structured trace record. The correlation fields tie an event back to
/// the frontend request that caused it; `kind` carries the event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum TraceEventKind {
    ToolListRequest {},

    ToolListDecision {
        candidates: BTreeSet<String>,
        scores: BTreeMap<String, f32>,
        selected: Vec<String>,
        confidence: f32,
        triggered_fallback: bool,
        query_used: String,
    },

    ToolCallProxyStart {
        qualified_name: String,
    },

    ToolCallProxyEnd {
        qualified_name: String,
        success: bool,
        latency_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },

    DownstreamStateChange {
        server: String,
        from: String,
        to: String,
    },

    RouterFallback {
        reason: String,
        confidence: f32,
    },

    /// Warning: a tool was called that was not part of the session's most
    /// recent `tools/list` response.
    ToolInjectionMiss {
        qualified_name: String,
    },

    /// Warning: the embedding provider is unavailable; search degraded to
    /// lexical-only mode.
    EmbeddingDegraded {
        reason: String,
    },
}

impl TraceEventKind {
    /// Stable tag string, mirroring the serde `kind` tag.
    pub fn name(&self) -> &'static str {
        match self {
            TraceEventKind::ToolListRequest {} => "ToolListRequest",
            TraceEventKind::ToolListDecision { .. } => "ToolListDecision",
            TraceEventKind::ToolCallProxyStart { .. } => "ToolCallProxyStart",
            TraceEventKind::ToolCallProxyEnd { .. } => "ToolCallProxyEnd",
            TraceEventKind::DownstreamStateChange { .. } => "DownstreamStateChange",
            TraceEventKind::RouterFallback { .. } => "RouterFallback",
            TraceEventKind::ToolInjectionMiss { .. } => "ToolInjectionMiss",
            TraceEventKind::EmbeddingDegraded { .. } => "EmbeddingDegraded",
        }
    }
}
