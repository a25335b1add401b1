//! Per-server runtime state.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    service::RunningService,
    RoleClient, ServiceError,
};
use tokio::sync::Notify;

use crate::{
    config::DownstreamServerConfig,
    telemetry::{EventBus, TraceContext, TraceEventKind},
};

pub(crate) type McpClient = RunningService<RoleClient, ()>;

/// The one downstream operation the call path needs from a transport.
/// Production uses the live rmcp client; tests inject fakes to drive the
/// retry loop without child processes.
#[async_trait]
pub(crate) trait ToolCaller: Send + Sync {
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, ServiceError>;
}

#[async_trait]
impl ToolCaller for McpClient {
    async fn call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, ServiceError> {
        self.peer().call_tool(request).await
    }
}

/// What a handle's client slot holds.
enum ClientSlot {
    Live(Arc<McpClient>),
    #[cfg(test)]
    Fake(Arc<dyn ToolCaller>),
}

impl ClientSlot {
    fn caller(&self) -> Arc<dyn ToolCaller> {
        match self {
            ClientSlot::Live(client) => Arc::clone(client) as Arc<dyn ToolCaller>,
            #[cfg(test)]
            ClientSlot::Fake(caller) => Arc::clone(caller),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Starting,
    Ready,
    Failing,
    Dead,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Disconnected => "Disconnected",
            ServerState::Starting => "Starting",
            ServerState::Ready => "Ready",
            ServerState::Failing => "Failing",
            ServerState::Dead => "Dead",
        };
        write!(f, "{}", name)
    }
}

/// Child process spawn instructions.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the gateway's own environment.
    pub env: HashMap<String, String>,
}

struct HandleState {
    state: ServerState,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

/// Runtime record for one downstream server. State transitions go through
/// the methods here so every change emits a `DownstreamStateChange` event.
pub struct ServerHandle {
    pub name: String,
    pub spawn_spec: SpawnSpec,
    pub tags: Vec<String>,
    pub required: bool,
    state: Mutex<HandleState>,
    client: Mutex<Option<ClientSlot>>,
    /// Qualified names this server currently owns in the zoo.
    tools: Mutex<BTreeSet<String>>,
    /// Serializes spawn attempts; concurrent callers wait instead of racing.
    pub(crate) init_lock: tokio::sync::Mutex<()>,
    /// Wakes tasks awaiting readiness.
    pub(crate) ready: Notify,
    events: EventBus,
}

impl ServerHandle {
    pub fn new(config: &DownstreamServerConfig, events: EventBus) -> Self {
        Self {
            name: config.name.clone(),
            spawn_spec: SpawnSpec {
                command: config.command.clone(),
                args: config.args.clone(),
                env: config.env.clone(),
            },
            tags: config.tags.clone(),
            required: config.required,
            state: Mutex::new(HandleState {
                state: ServerState::Disconnected,
                consecutive_failures: 0,
                cooldown_until: None,
            }),
            client: Mutex::new(None),
            tools: Mutex::new(BTreeSet::new()),
            init_lock: tokio::sync::Mutex::new(()),
            ready: Notify::new(),
            events,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub(crate) fn client(&self) -> Option<Arc<dyn ToolCaller>> {
        self.client.lock().as_ref().map(ClientSlot::caller)
    }

    pub(crate) fn set_client(&self, client: Option<Arc<McpClient>>) {
        *self.client.lock() = client.map(ClientSlot::Live);
    }

    /// The live service, if any; fakes are dropped in place since they have
    /// no child process to stop.
    pub(crate) fn take_client(&self) -> Option<Arc<McpClient>> {
        match self.client.lock().take() {
            Some(ClientSlot::Live(client)) => Some(client),
            _ => None,
        }
    }

    /// Install a fake transport and leave the state machine to the test.
    #[cfg(test)]
    pub(crate) fn set_fake_client(&self, caller: Arc<dyn ToolCaller>) {
        *self.client.lock() = Some(ClientSlot::Fake(caller));
    }

    pub fn tools(&self) -> BTreeSet<String> {
        self.tools.lock().clone()
    }

    pub(crate) fn set_tools(&self, tools: BTreeSet<String>) {
        *self.tools.lock() = tools;
    }

    /// Direct transition to Dead with a cooldown window; used when the
    /// handshake itself fails.
    pub(crate) fn mark_dead(&self, cooldown: Duration, ctx: &TraceContext) {
        {
            let mut guard = self.state.lock();
            guard.cooldown_until = Some(Instant::now() + cooldown);
        }
        self.transition(ServerState::Dead, ctx);
    }

    /// Transition to `to`, emitting a state-change event. No-op when the
    /// state is unchanged.
    pub(crate) fn transition(&self, to: ServerState, ctx: &TraceContext) {
        let from = {
            let mut guard = self.state.lock();
            let from = guard.state;
            if from == to {
                return;
            }
            guard.state = to;
            from
        };
        self.events.emit(ctx.event(TraceEventKind::DownstreamStateChange {
            server: self.name.clone(),
            from: from.to_string(),
            to: to.to_string(),
        }));
        if to == ServerState::Ready {
            self.ready.notify_waiters();
        }
    }

    /// Count a transport-level failure. Moves Ready -> Failing, and past the
    /// budget Failing -> Dead with a cooldown window. Returns the new state.
    pub(crate) fn record_failure(
        &self,
        budget: u32,
        cooldown: Duration,
        ctx: &TraceContext,
    ) -> ServerState {
        let (to, from) = {
            let mut guard = self.state.lock();
            let from = guard.state;
            guard.consecutive_failures += 1;
            let to = if guard.consecutive_failures > budget {
                guard.cooldown_until = Some(Instant::now() + cooldown);
                ServerState::Dead
            } else {
                ServerState::Failing
            };
            guard.state = to;
            (to, from)
        };
        if from != to {
            self.events.emit(ctx.event(TraceEventKind::DownstreamStateChange {
                server: self.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            }));
        }
        to
    }

    pub(crate) fn reset_failures(&self) {
        let mut guard = self.state.lock();
        guard.consecutive_failures = 0;
        guard.cooldown_until = None;
    }

    /// True when a Dead server's cooldown window has passed.
    pub(crate) fn cooldown_elapsed(&self) -> bool {
        let guard = self.state.lock();
        match guard.cooldown_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Force a cooldown window; test seam for Dead-state behavior.
    #[cfg(test)]
    pub(crate) fn force_dead(&self, cooldown: Duration) {
        let mut guard = self.state.lock();
        guard.state = ServerState::Dead;
        guard.cooldown_until = Some(Instant::now() + cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::DownstreamTransport;

    fn handle() -> (ServerHandle, EventBus) {
        let events = EventBus::new(64);
        let config = DownstreamServerConfig {
            name: "fs".to_string(),
            transport: DownstreamTransport::Stdio,
            command: "mcp-server-filesystem".to_string(),
            args: vec!["/tmp".to_string()],
            env: HashMap::from([("RUST_LOG".to_string(), "warn".to_string())]),
            tags: vec!["files".to_string()],
            required: false,
        };
        (ServerHandle::new(&config, events.clone()), events)
    }

    fn ctx() -> TraceContext {
        TraceContext::background()
    }

    #[test]
    fn test_initial_state() {
        let (handle, _) = handle();
        assert_eq!(handle.state(), ServerState::Disconnected);
        assert_eq!(handle.consecutive_failures(), 0);
        assert!(handle.client().is_none());
        assert_eq!(handle.spawn_spec.env["RUST_LOG"], "warn");
    }

    #[test]
    fn test_transition_emits_event() {
        let (handle, events) = handle();
        handle.transition(ServerState::Starting, &ctx());
        handle.transition(ServerState::Starting, &ctx());
        let drained = events.drain();
        assert_eq!(drained.len(), 1, "same-state transition must not emit");
        match &drained[0].kind {
            crate::telemetry::TraceEventKind::DownstreamStateChange { server, from, to } => {
                assert_eq!(server, "fs");
                assert_eq!(from, "Disconnected");
                assert_eq!(to, "Starting");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_failure_budget_leads_to_dead() {
        let (handle, _) = handle();
        handle.transition(ServerState::Ready, &ctx());

        let budget = 2;
        let cooldown = Duration::from_secs(60);
        assert_eq!(
            handle.record_failure(budget, cooldown, &ctx()),
            ServerState::Failing
        );
        assert_eq!(
            handle.record_failure(budget, cooldown, &ctx()),
            ServerState::Failing
        );
        assert_eq!(
            handle.record_failure(budget, cooldown, &ctx()),
            ServerState::Dead
        );
        assert_eq!(handle.consecutive_failures(), 3);
        assert!(!handle.cooldown_elapsed());
    }

    #[test]
    fn test_reset_clears_cooldown() {
        let (handle, _) = handle();
        handle.record_failure(0, Duration::from_secs(60), &ctx());
        assert_eq!(handle.state(), ServerState::Dead);
        handle.reset_failures();
        assert_eq!(handle.consecutive_failures(), 0);
        assert!(handle.cooldown_elapsed());
    }

    #[test]
    fn test_cooldown_elapses() {
        let (handle, _) = handle();
        handle.force_dead(Duration::from_millis(0));
        assert!(handle.cooldown_elapsed());
        handle.force_dead(Duration::from_secs(60));
        assert!(!handle.cooldown_elapsed());
    }

    #[test]
    fn test_state_machine_sequence_ready_failing_dead() {
        let (handle, events) = handle();
        handle.transition(ServerState::Starting, &ctx());
        handle.transition(ServerState::Ready, &ctx());
        handle.record_failure(0, Duration::from_secs(1), &ctx());

        let states: Vec<(String, String)> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e.kind {
                crate::telemetry::TraceEventKind::DownstreamStateChange { from, to, .. } => {
                    Some((from, to))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ("Disconnected".to_string(), "Starting".to_string()),
                ("Starting".to_string(), "Ready".to_string()),
                ("Ready".to_string(), "Dead".to_string()),
            ]
        );
    }
}
