//! Downstream connection pool.
//!
//! Owns one child-process MCP client per configured server, discovers their
//! tools into the zoo, routes calls to the right transport, and isolates
//! failures behind a per-server state machine.

mod backoff;
mod handle;

pub use backoff::RetrySchedule;
pub use handle::{ServerHandle, ServerState, SpawnSpec};

pub(crate) use handle::ToolCaller;

use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Instant};

use rmcp::{
    model::{CallToolRequestParam, CallToolResult},
    transport::{ConfigureCommandExt, TokioChildProcess},
    ServiceError, ServiceExt,
};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{
    config::{DownstreamServerConfig, PoolConfig},
    error::{GatewayError, GatewayResult},
    telemetry::{EventBus, TraceContext, TraceEventKind},
    zoo::{split_qualified, ToolDescriptor, ToolZoo},
};

use handle::McpClient;

pub struct ConnectionPool {
    handles: HashMap<String, Arc<ServerHandle>>,
    zoo: Arc<ToolZoo>,
    events: EventBus,
    config: PoolConfig,
    schedule: RetrySchedule,
}

impl ConnectionPool {
    pub fn new(
        servers: &[DownstreamServerConfig],
        zoo: Arc<ToolZoo>,
        events: EventBus,
        config: PoolConfig,
    ) -> Self {
        let handles = servers
            .iter()
            .map(|server| {
                (
                    server.name.clone(),
                    Arc::new(ServerHandle::new(server, events.clone())),
                )
            })
            .collect();
        let schedule = RetrySchedule::new(config.backoff_base(), config.backoff_cap());
        Self {
            handles,
            zoo,
            events,
            config,
            schedule,
        }
    }

    /// Spawn every configured server concurrently and discover its tools.
    /// Returns once each server is Ready or Dead. Fails only when a server
    /// marked `required` could not reach Ready.
    pub async fn start_all(&self) -> GatewayResult<()> {
        let ctx = TraceContext::background();
        let mut join_set = JoinSet::new();
        for handle in self.handles.values() {
            let handle = Arc::clone(handle);
            let pool = self.clone_refs();
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let result = pool.spawn_and_discover(&handle, &ctx).await;
                (handle, result)
            });
        }

        let mut failed_required = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((handle, result)) = joined else {
                continue;
            };
            if let Err(e) = result {
                error!("failed to start server '{}': {}", handle.name, e);
                if handle.required {
                    failed_required.push(handle.name.clone());
                }
            }
        }

        if !failed_required.is_empty() {
            return Err(GatewayError::ConnectionFailed(format!(
                "required servers failed to start: {}",
                failed_required.join(", ")
            )));
        }
        Ok(())
    }

    /// Pure lookup: which server owns this qualified name.
    pub fn get_tool(&self, qualified_name: &str) -> Option<Arc<ServerHandle>> {
        let (server, _) = split_qualified(qualified_name)?;
        let handle = self.handles.get(server)?;
        if handle.tools().contains(qualified_name) {
            Some(Arc::clone(handle))
        } else {
            None
        }
    }

    pub fn handle(&self, server: &str) -> Option<Arc<ServerHandle>> {
        self.handles.get(server).cloned()
    }

    pub fn server_states(&self) -> Vec<(String, ServerState)> {
        let mut states: Vec<(String, ServerState)> = self
            .handles
            .values()
            .map(|h| (h.name.clone(), h.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Proxy one tool call with per-attempt timeout and retry.
    ///
    /// Timeouts and transport errors count toward the server's failure
    /// budget and are retried with exponential backoff; an error reported by
    /// the downstream server itself returns immediately.
    pub async fn call(
        &self,
        ctx: &TraceContext,
        qualified_name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> GatewayResult<CallToolResult> {
        let (server, local_name) = split_qualified(qualified_name)
            .ok_or_else(|| GatewayError::InvalidToolName(qualified_name.to_string()))?;
        let handle = self
            .handles
            .get(server)
            .ok_or_else(|| GatewayError::ToolNotFound(qualified_name.to_string()))?;

        let timeout = self.config.call_timeout();
        let mut timed_out_last = false;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.schedule.delay(attempt)).await;
            }

            let client = match tokio::time::timeout(timeout, self.ensure_ready(handle, ctx))
                .await
            {
                Ok(Ok(client)) => client,
                Ok(Err(e)) => {
                    // A Dead server inside its cooldown will not recover
                    // within this request; fail fast.
                    if handle.state() == ServerState::Dead && !handle.cooldown_elapsed() {
                        return Err(match e {
                            unavailable @ GatewayError::ServerUnavailable { .. } => unavailable,
                            other => GatewayError::ServerUnavailable {
                                server: server.to_string(),
                                reason: other.to_string(),
                            },
                        });
                    }
                    timed_out_last = false;
                    continue;
                }
                Err(_) => {
                    return Err(GatewayError::ServerUnavailable {
                        server: server.to_string(),
                        reason: "not ready within call timeout".to_string(),
                    });
                }
            };

            self.events.emit(ctx.event(TraceEventKind::ToolCallProxyStart {
                qualified_name: qualified_name.to_string(),
            }));
            let started = Instant::now();

            let request = CallToolRequestParam {
                name: Cow::Owned(local_name.to_string()),
                arguments: arguments.clone(),
            };

            match tokio::time::timeout(timeout, client.call_tool(request)).await {
                Ok(Ok(result)) => {
                    let success = !result.is_error.unwrap_or(false);
                    self.emit_proxy_end(ctx, qualified_name, success, started, None);
                    // The transport answered: earlier failures this call no
                    // longer count, and a Failing server is working again.
                    handle.reset_failures();
                    handle.transition(ServerState::Ready, ctx);
                    return Ok(result);
                }
                // The downstream server answered with a JSON-RPC error:
                // not a transport problem, never retried.
                Ok(Err(ServiceError::McpError(data))) => {
                    self.emit_proxy_end(
                        ctx,
                        qualified_name,
                        false,
                        started,
                        Some("TOOL_EXECUTION_ERROR"),
                    );
                    let message = data.message.to_string();
                    let downstream = serde_json::to_value(&data).ok();
                    return Err(GatewayError::ToolExecutionError {
                        qualified_name: qualified_name.to_string(),
                        message,
                        downstream,
                    });
                }
                Ok(Err(transport_error)) => {
                    warn!(
                        "transport error calling {} (attempt {}): {}",
                        qualified_name, attempt, transport_error
                    );
                    self.emit_proxy_end(
                        ctx,
                        qualified_name,
                        false,
                        started,
                        Some("TRANSPORT_ERROR"),
                    );
                    timed_out_last = false;
                    self.note_transport_failure(handle, ctx);
                }
                Err(_elapsed) => {
                    // The outstanding downstream call is dropped; a late
                    // reply is discarded by request-id mismatch.
                    warn!(
                        "timeout calling {} after {:?} (attempt {})",
                        qualified_name, timeout, attempt
                    );
                    self.emit_proxy_end(
                        ctx,
                        qualified_name,
                        false,
                        started,
                        Some("TOOL_EXECUTION_TIMEOUT"),
                    );
                    timed_out_last = true;
                    self.note_transport_failure(handle, ctx);
                }
            }
        }

        if timed_out_last {
            Err(GatewayError::ToolExecutionTimeout {
                qualified_name: qualified_name.to_string(),
                attempts: self.config.max_retries + 1,
            })
        } else {
            Err(GatewayError::ServerUnavailable {
                server: server.to_string(),
                reason: "retry budget exhausted".to_string(),
            })
        }
    }

    /// Graceful shutdown: cancel each client within the grace period. The
    /// transport terminates the child process when the service stops.
    pub async fn shutdown(&self) {
        let ctx = TraceContext::background();
        for handle in self.handles.values() {
            let Some(client) = handle.take_client() else {
                continue;
            };
            handle.transition(ServerState::Disconnected, &ctx);
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    match tokio::time::timeout(self.config.shutdown_grace(), client.cancel())
                        .await
                    {
                        Ok(Ok(_)) => info!("server '{}' shut down", handle.name),
                        Ok(Err(e)) => {
                            warn!("error shutting down server '{}': {}", handle.name, e)
                        }
                        Err(_) => warn!(
                            "server '{}' did not shut down within grace period",
                            handle.name
                        ),
                    }
                }
                Err(_) => warn!(
                    "server '{}' still has in-flight calls at shutdown",
                    handle.name
                ),
            }
        }
    }

    fn clone_refs(&self) -> Self {
        Self {
            handles: self.handles.clone(),
            zoo: Arc::clone(&self.zoo),
            events: self.events.clone(),
            config: self.config.clone(),
            schedule: self.schedule,
        }
    }

    /// Return a usable transport, spawning or respawning the server if its
    /// state machine allows it. A live transport survives Failing (retries
    /// reuse it); only Dead tears it down.
    async fn ensure_ready(
        &self,
        handle: &Arc<ServerHandle>,
        ctx: &TraceContext,
    ) -> GatewayResult<Arc<dyn ToolCaller>> {
        if let Some(client) = handle.client() {
            return Ok(client);
        }
        self.spawn_and_discover(handle, ctx).await?;
        handle
            .client()
            .ok_or_else(|| GatewayError::ServerUnavailable {
                server: handle.name.clone(),
                reason: "no transport after spawn".to_string(),
            })
    }

    /// Spawn the child, run the MCP handshake, and index the discovered
    /// tools. Serialized per server; a concurrent caller waits and then
    /// observes the outcome.
    async fn spawn_and_discover(
        &self,
        handle: &Arc<ServerHandle>,
        ctx: &TraceContext,
    ) -> GatewayResult<()> {
        let _init = handle.init_lock.lock().await;

        match handle.state() {
            ServerState::Ready => return Ok(()),
            ServerState::Dead if !handle.cooldown_elapsed() => {
                return Err(GatewayError::ServerUnavailable {
                    server: handle.name.clone(),
                    reason: "dead, cooling down".to_string(),
                });
            }
            ServerState::Dead => {
                // Cooldown elapsed: the machine re-enters through
                // Disconnected before the next spawn attempt.
                handle.transition(ServerState::Disconnected, ctx);
            }
            _ => {}
        }

        handle.transition(ServerState::Starting, ctx);

        let client = match self.connect_with_retry(&handle.spawn_spec, &handle.name).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                handle.mark_dead(self.config.cooldown(), ctx);
                return Err(e);
            }
        };

        match tokio::time::timeout(
            self.config.list_tools_timeout(),
            client.peer().list_all_tools(),
        )
        .await
        {
            Ok(Ok(tools)) => {
                info!("discovered {} tools from '{}'", tools.len(), handle.name);
                let mut owned = std::collections::BTreeSet::new();
                for tool in tools {
                    match ToolDescriptor::from_mcp_tool(&handle.name, &tool, &handle.tags) {
                        Ok(descriptor) => {
                            owned.insert(descriptor.qualified_name.clone());
                            if let Err(e) = self.zoo.index(descriptor).await {
                                warn!(
                                    "failed to index tool '{}' from '{}': {}",
                                    tool.name, handle.name, e
                                );
                            }
                        }
                        Err(e) => warn!(
                            "skipping invalid tool '{}' from '{}': {}",
                            tool.name, handle.name, e
                        ),
                    }
                }
                handle.set_tools(owned);
            }
            Ok(Err(e)) => {
                handle.mark_dead(self.config.cooldown(), ctx);
                return Err(GatewayError::ConnectionFailed(format!(
                    "tools/list on '{}' failed: {}",
                    handle.name, e
                )));
            }
            Err(_) => {
                handle.mark_dead(self.config.cooldown(), ctx);
                return Err(GatewayError::ConnectionFailed(format!(
                    "tools/list on '{}' timed out",
                    handle.name
                )));
            }
        }

        handle.set_client(Some(client));
        handle.reset_failures();
        handle.transition(ServerState::Ready, ctx);
        Ok(())
    }

    /// Spawn the child process and complete the MCP handshake, retrying
    /// transient failures briefly before giving up.
    async fn connect_with_retry(&self, spec: &SpawnSpec, name: &str) -> GatewayResult<McpClient> {
        let policy = ::backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(std::time::Duration::from_millis(250))
            .with_max_interval(std::time::Duration::from_secs(2))
            .with_max_elapsed_time(Some(self.config.spawn_retry_window()))
            .build();

        ::backoff::future::retry(policy, || async {
            match Self::connect_child(spec).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    warn!("failed to connect to '{}', retrying: {}", name, e);
                    Err(::backoff::Error::transient(e))
                }
            }
        })
        .await
    }

    async fn connect_child(spec: &SpawnSpec) -> GatewayResult<McpClient> {
        let transport = TokioChildProcess::new(
            tokio::process::Command::new(&spec.command).configure(|cmd| {
                cmd.args(&spec.args)
                    .envs(spec.env.iter())
                    .stderr(std::process::Stdio::inherit());
            }),
        )
        .map_err(|e| GatewayError::Transport(format!("spawn child: {}", e)))?;

        ().serve(transport)
            .await
            .map_err(|e| GatewayError::ConnectionFailed(format!("initialize: {}", e)))
    }

    /// Count a transport failure; a server that exhausts its budget goes
    /// Dead and its tools leave the zoo until a successful respawn.
    fn note_transport_failure(&self, handle: &Arc<ServerHandle>, ctx: &TraceContext) {
        let state = handle.record_failure(
            self.config.failure_budget,
            self.config.cooldown(),
            ctx,
        );
        if state == ServerState::Dead {
            warn!(
                "server '{}' exceeded failure budget; removing its tools",
                handle.name
            );
            // The zoo stops offering the tools; the handle keeps its
            // ownership record so calls resolve to SERVER_UNAVAILABLE
            // rather than TOOL_NOT_FOUND.
            handle.set_client(None);
            self.zoo.remove_server(&handle.name);
        }
    }

    fn emit_proxy_end(
        &self,
        ctx: &TraceContext,
        qualified_name: &str,
        success: bool,
        started: Instant,
        error_code: Option<&str>,
    ) {
        self.events.emit(ctx.event(TraceEventKind::ToolCallProxyEnd {
            qualified_name: qualified_name.to_string(),
            success,
            latency_ms: started.elapsed().as_millis() as u64,
            error_code: error_code.map(str::to_string),
        }));
    }
}
