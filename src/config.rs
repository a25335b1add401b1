//! Gateway configuration types and loading.
//!
//! The whole configuration surface is one YAML document. Every knob has a
//! serde default so a minimal file only needs `downstream_servers`.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tool_zoo: ToolZooConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Downstream MCP servers spawned at startup.
    #[serde(default)]
    pub downstream_servers: Vec<DownstreamServerConfig>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Frontend transport. Only stdio is supported.
    #[serde(default)]
    pub transport: FrontendTransport,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrontendTransport {
    #[default]
    Stdio,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolZooConfig {
    /// Model name sent to the embeddings endpoint.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// OpenAI-compatible embeddings endpoint. Absent endpoint disables
    /// semantic search; the zoo degrades to lexical-only mode.
    #[serde(default)]
    pub embedding_endpoint: Option<String>,

    /// Environment variable holding the API key for the endpoint.
    #[serde(default = "default_embedding_api_key_env")]
    pub embedding_api_key_env: String,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    /// Candidate cap used by zoo searches when the caller does not supply one.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum hybrid score a search result must reach.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Weight of the lexical component in hybrid scoring; the semantic
    /// component gets the remainder.
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,

    /// Directory for the tool index snapshot. Absent means in-memory only.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub mode: RouterMode,

    /// Upper bound on the number of tools returned per `tools/list`.
    #[serde(default = "default_max_tools")]
    pub max_tools: usize,

    /// Per-server cap applied by the diversity filter.
    #[serde(default = "default_max_per_server")]
    pub max_per_server: usize,

    /// Below this confidence the fallback set replaces the selection.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Ordered qualified names returned when confidence is too low.
    #[serde(default)]
    pub fallback_tools: Vec<String>,

    #[serde(default = "default_domain_boost")]
    pub domain_boost: f32,

    #[serde(default = "default_usage_boost")]
    pub usage_boost: f32,

    #[serde(default = "default_cooccurrence_boost")]
    pub cooccurrence_boost: f32,

    /// Usage count at which the usage boost saturates.
    #[serde(default = "default_saturation")]
    pub saturation: u64,

    /// How many trailing session messages feed the routing query.
    #[serde(default = "default_query_messages")]
    pub query_messages: usize,

    /// Character budget for the routing query.
    #[serde(default = "default_query_char_budget")]
    pub query_char_budget: usize,

    #[serde(default = "default_true")]
    pub enable_learning: bool,

    /// When true, calling a tool outside the last injected set is an error
    /// instead of a warning.
    #[serde(default)]
    pub strict_injection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Directory for per-session append-only logs. Absent means in-memory only.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,

    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownstreamServerConfig {
    pub name: String,

    #[serde(default)]
    pub transport: DownstreamTransport,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Merged over the gateway's own environment for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Domain hints attached to every tool this server exposes.
    #[serde(default)]
    pub tags: Vec<String>,

    /// When true, startup fails if this server cannot reach Ready.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamTransport {
    #[default]
    Stdio,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive transport failures tolerated before a server is Dead.
    #[serde(default = "default_failure_budget")]
    pub failure_budget: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// How long a Dead server stays down before a respawn may be attempted.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// How long a single spawn attempt keeps retrying transient failures
    /// before the server is declared Dead.
    #[serde(default = "default_spawn_retry_window_secs")]
    pub spawn_retry_window_secs: u64,

    #[serde(default = "default_list_tools_timeout_secs")]
    pub list_tools_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Bounded event queue capacity; overflow drops the oldest event.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Optional JSONL file sink for trace events.
    #[serde(default)]
    pub file_sink: Option<PathBuf>,
}

/// Gated feature flags. All default off; enabling one without the matching
/// build is a configuration error surfaced at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AdvancedConfig {
    #[serde(default)]
    pub enable_dashboard: bool,

    #[serde(default)]
    pub enable_graph_viz: bool,

    #[serde(default)]
    pub enable_raft_export: bool,
}

impl GatewayConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: &std::path::Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("read {}: {}", path.display(), e))
        })?;
        let config: GatewayConfig = serde_yaml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.downstream_servers {
            if !is_valid_server_name(&server.name) {
                return Err(GatewayError::Config(format!(
                    "invalid server name '{}': must match ^[A-Za-z0-9_-]+$",
                    server.name
                )));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            if server.command.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "server '{}' has an empty command",
                    server.name
                )));
            }
        }
        if self.router.max_tools == 0 {
            return Err(GatewayError::Config("router.max_tools must be > 0".into()));
        }
        if self.router.max_per_server == 0 {
            return Err(GatewayError::Config(
                "router.max_per_server must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.router.min_confidence) {
            return Err(GatewayError::Config(
                "router.min_confidence must be within [0,1]".into(),
            ));
        }
        for name in &self.router.fallback_tools {
            let Some((server, _)) = name.split_once('.') else {
                return Err(GatewayError::Config(format!(
                    "fallback tool '{}' is not a qualified name (<server>.<tool>)",
                    name
                )));
            };
            if !self.downstream_servers.iter().any(|s| s.name == server) {
                return Err(GatewayError::Config(format!(
                    "fallback tool '{}' references unknown server '{}'",
                    name, server
                )));
            }
        }
        if self.advanced.enable_dashboard
            || self.advanced.enable_graph_viz
            || self.advanced.enable_raft_export
        {
            return Err(GatewayError::Config(
                "advanced features are not compiled into this build".into(),
            ));
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn spawn_retry_window(&self) -> Duration {
        Duration::from_secs(self.spawn_retry_window_secs)
    }

    pub fn list_tools_timeout(&self) -> Duration {
        Duration::from_secs(self.list_tools_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Server names share a character set with MCP tool names; the dot is
/// reserved as the qualified-name delimiter.
pub fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn default_server_name() -> String {
    "toolgate".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_embedding_dimensions() -> usize {
    1536
}

fn default_top_k() -> usize {
    20
}

fn default_similarity_threshold() -> f32 {
    0.35
}

fn default_lexical_weight() -> f32 {
    0.4
}

fn default_max_tools() -> usize {
    5
}

fn default_max_per_server() -> usize {
    10
}

fn default_min_confidence() -> f32 {
    0.3
}

fn default_domain_boost() -> f32 {
    0.15
}

fn default_usage_boost() -> f32 {
    0.05
}

fn default_cooccurrence_boost() -> f32 {
    0.05
}

fn default_saturation() -> u64 {
    10
}

fn default_query_messages() -> usize {
    5
}

fn default_query_char_budget() -> usize {
    2000
}

fn default_true() -> bool {
    true
}

fn default_max_history() -> usize {
    100
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_failure_budget() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_spawn_retry_window_secs() -> u64 {
    10
}

fn default_list_tools_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            transport: FrontendTransport::Stdio,
            log_level: default_log_level(),
        }
    }
}

impl Default for ToolZooConfig {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            embedding_endpoint: None,
            embedding_api_key_env: default_embedding_api_key_env(),
            embedding_dimensions: default_embedding_dimensions(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            lexical_weight: default_lexical_weight(),
            persist_dir: None,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::Hybrid,
            max_tools: default_max_tools(),
            max_per_server: default_max_per_server(),
            min_confidence: default_min_confidence(),
            fallback_tools: Vec::new(),
            domain_boost: default_domain_boost(),
            usage_boost: default_usage_boost(),
            cooccurrence_boost: default_cooccurrence_boost(),
            saturation: default_saturation(),
            query_messages: default_query_messages(),
            query_char_budget: default_query_char_budget(),
            enable_learning: true,
            strict_injection: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            failure_budget: default_failure_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            cooldown_secs: default_cooldown_secs(),
            spawn_retry_window_secs: default_spawn_retry_window_secs(),
            list_tools_timeout_secs: default_list_tools_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            file_sink: None,
        }
    }
}
