//! The frontend: one MCP server surface over stdio.
//!
//! `tools/list` is answered by the router with a context-dependent subset of
//! the catalog; `tools/call` is proxied to the owning downstream server.

use std::{borrow::Cow, sync::Arc, time::Instant};

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::{RequestContext, RoleServer},
    ErrorData, ServerHandler, ServiceExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    pool::ConnectionPool,
    router::Router,
    session::{MessageRole, SessionStore},
    telemetry::{EventBus, TraceContext, TraceEventKind},
    zoo::{split_qualified, ToolDescriptor, ToolZoo},
};

pub struct GatewayServer {
    server_name: String,
    router: Router,
    zoo: Arc<ToolZoo>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionStore>,
    events: EventBus,
    /// The one implicit session bound to this stdio connection.
    bound_session: String,
    strict_injection: bool,
    enable_learning: bool,
}

impl GatewayServer {
    pub fn new(
        config: &GatewayConfig,
        zoo: Arc<ToolZoo>,
        pool: Arc<ConnectionPool>,
        sessions: Arc<SessionStore>,
        events: EventBus,
    ) -> Self {
        let bound_session = Uuid::new_v4().to_string();
        sessions.get_or_create(&bound_session);
        info!(session_id = %bound_session, "bound stdio client session");
        Self {
            server_name: config.server.name.clone(),
            router: Router::new(
                config.router.clone(),
                config.tool_zoo.similarity_threshold,
            ),
            zoo,
            pool,
            sessions,
            events,
            bound_session,
            strict_injection: config.router.strict_injection,
            enable_learning: config.router.enable_learning,
        }
    }

    pub fn bound_session(&self) -> &str {
        &self.bound_session
    }

    /// Serve MCP over stdio until the client disconnects.
    pub async fn serve_stdio(self) -> GatewayResult<()> {
        let service = self
            .serve(rmcp::transport::io::stdio())
            .await
            .map_err(|e| GatewayError::Transport(format!("initialize frontend: {}", e)))?;
        service
            .waiting()
            .await
            .map_err(|e| GatewayError::Transport(format!("frontend terminated: {}", e)))?;
        Ok(())
    }

    async fn handle_list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
    ) -> Result<ListToolsResult, ErrorData> {
        let ctx = TraceContext::new(Some(self.bound_session.clone()));
        self.events
            .emit(ctx.event(TraceEventKind::ToolListRequest {}));

        // The pagination cursor doubles as the opaque context token: a
        // client that sends one is handing us fresh conversation context.
        if let Some(token) = request.and_then(|r| r.cursor) {
            if !token.trim().is_empty() {
                if let Err(e) = self
                    .sessions
                    .append_message(&self.bound_session, MessageRole::User, token)
                    .await
                {
                    warn!("failed to record context token: {}", e);
                }
            }
        }

        let session = self.sessions.snapshot(&self.bound_session).await;
        let decision = self.router.route(&session, &self.zoo).await;

        self.events.emit(ctx.event(TraceEventKind::ToolListDecision {
            candidates: decision.candidates.clone(),
            scores: decision.scores.clone(),
            selected: decision.selected.clone(),
            confidence: decision.confidence,
            triggered_fallback: decision.triggered_fallback,
            query_used: decision.query_used.clone(),
        }));
        if decision.triggered_fallback {
            self.events.emit(ctx.event(TraceEventKind::RouterFallback {
                reason: decision.reasoning.clone(),
                confidence: decision.confidence,
            }));
        }

        debug!(
            selected = decision.selected.len(),
            confidence = decision.confidence,
            fallback = decision.triggered_fallback,
            "routing decision: {}",
            decision.reasoning
        );

        let tools: Vec<Tool> = decision
            .selected
            .iter()
            .filter_map(|name| self.zoo.get(name))
            .map(|descriptor| to_mcp_tool(&descriptor))
            .collect();

        self.sessions
            .set_last_routing(&self.bound_session, decision)
            .await;

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn handle_call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, ErrorData> {
        let ctx = TraceContext::new(Some(self.bound_session.clone()));
        let qualified_name = request.name.to_string();

        if split_qualified(&qualified_name).is_none() {
            return Err(GatewayError::ToolNotFound(qualified_name).into());
        }
        // A tool stays resolvable while its server is down (the zoo no
        // longer offers it, but the handle remembers ownership), so a dead
        // server surfaces as SERVER_UNAVAILABLE rather than TOOL_NOT_FOUND.
        let known = self.zoo.get(&qualified_name).is_some()
            || self.pool.get_tool(&qualified_name).is_some();
        if !known {
            return Err(GatewayError::ToolNotFound(qualified_name).into());
        }

        // Injection policy: calling outside the most recent tools/list is a
        // soft miss unless strict mode makes it an error.
        let injected = self
            .sessions
            .last_routing(&self.bound_session)
            .await
            .map(|d| d.selected.contains(&qualified_name))
            .unwrap_or(false);
        if !injected {
            if self.strict_injection {
                return Err(GatewayError::ToolNotInjected(qualified_name).into());
            }
            self.events.emit(ctx.event(TraceEventKind::ToolInjectionMiss {
                qualified_name: qualified_name.clone(),
            }));
        }

        let started = Instant::now();
        let outcome = self
            .pool
            .call(&ctx, &qualified_name, request.arguments)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let success = !result.is_error.unwrap_or(false);
                self.record_outcome(&qualified_name, success, latency_ms).await;
                if success && self.enable_learning {
                    self.sessions
                        .record_co_selection(&self.bound_session, &qualified_name)
                        .await;
                }
                Ok(result)
            }
            Err(e) => {
                self.record_outcome(&qualified_name, false, latency_ms).await;
                Err(e.into())
            }
        }
    }

    async fn record_outcome(&self, qualified_name: &str, success: bool, latency_ms: u64) {
        if let Err(e) = self
            .sessions
            .record_tool_outcome(&self.bound_session, qualified_name, success, latency_ms)
            .await
        {
            warn!("failed to record tool outcome: {}", e);
        }
        let note = format!(
            "{} -> {}",
            qualified_name,
            if success { "ok" } else { "error" }
        );
        if let Err(e) = self
            .sessions
            .append_message(&self.bound_session, MessageRole::Tool, note)
            .await
        {
            warn!("failed to record tool message: {}", e);
        }
    }
}

fn to_mcp_tool(descriptor: &ToolDescriptor) -> Tool {
    Tool {
        name: Cow::Owned(descriptor.qualified_name.clone()),
        title: None,
        description: Some(Cow::Owned(descriptor.client_description())),
        input_schema: Arc::new(descriptor.input_schema.clone()),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info.name = self.server_name.clone();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.instructions = Some(
            "Gateway to downstream MCP tool servers. The tool list adapts to the \
             conversation; re-list tools when the topic changes."
                .to_string(),
        );
        info
    }

    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        self.handle_list_tools(request).await
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.handle_call_tool(request).await
    }
}
