//! Gateway error types.
//!
//! Every error that can surface to the MCP client carries a stable string
//! code in the JSON-RPC `error.data.code` field, so observability tooling
//! and clients can match on codes instead of messages.

use rmcp::model::{ErrorCode, ErrorData};
use serde_json::json;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool not in last injected set: {0}")]
    ToolNotInjected(String),

    #[error("Server unavailable: {server}: {reason}")]
    ServerUnavailable { server: String, reason: String },

    #[error("Tool call timed out after {attempts} attempt(s): {qualified_name}")]
    ToolExecutionTimeout {
        qualified_name: String,
        attempts: u32,
    },

    #[error("Tool execution failed: {qualified_name}: {message}")]
    ToolExecutionError {
        qualified_name: String,
        message: String,
        /// Original downstream error body, preserved verbatim.
        downstream: Option<serde_json::Value>,
    },

    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Stable wire code carried in `error.data.code`.
    pub fn wire_code(&self) -> &'static str {
        match self {
            GatewayError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            GatewayError::ToolNotInjected(_) => "TOOL_NOT_INJECTED",
            GatewayError::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            GatewayError::ToolExecutionTimeout { .. } => "TOOL_EXECUTION_TIMEOUT",
            GatewayError::ToolExecutionError { .. } => "TOOL_EXECUTION_ERROR",
            GatewayError::InvalidToolName(_) => "INVALID_TOOL_NAME",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::ConnectionFailed(_) => "CONNECTION_FAILED",
            GatewayError::Transport(_) => "TRANSPORT_ERROR",
            GatewayError::Embedding(_) => "EMBEDDING_ERROR",
            GatewayError::Persistence(_) => "PERSISTENCE_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }

    /// JSON-RPC numeric code. Gateway-specific errors live in the
    /// -32000..-32099 range reserved by the protocol for servers.
    fn json_rpc_code(&self) -> i32 {
        match self {
            GatewayError::ToolNotFound(_) => -32000,
            GatewayError::ToolNotInjected(_) => -32001,
            GatewayError::ServerUnavailable { .. } => -32002,
            GatewayError::ToolExecutionTimeout { .. } => -32003,
            GatewayError::ToolExecutionError { .. } => -32004,
            GatewayError::InvalidToolName(_) => -32602,
            _ => -32010,
        }
    }

    /// Convert into an MCP error envelope. Downstream error bodies are
    /// preserved once under `data.downstream` and never re-wrapped.
    pub fn to_error_data(&self) -> ErrorData {
        let mut data = json!({
            "code": self.wire_code(),
            "details": { "message": self.to_string() },
        });
        if let GatewayError::ToolExecutionError {
            downstream: Some(body),
            ..
        } = self
        {
            data["downstream"] = body.clone();
        }
        ErrorData::new(ErrorCode(self.json_rpc_code()), self.to_string(), Some(data))
    }
}

impl From<GatewayError> for ErrorData {
    fn from(err: GatewayError) -> Self {
        err.to_error_data()
    }
}
