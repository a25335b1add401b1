use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate::{
    provider_from_config, spawn_event_worker, ConnectionPool, EventBus, GatewayConfig,
    GatewayServer, SessionStore, ToolZoo,
};

#[derive(Parser)]
#[command(name = "toolgate", version, about = "Context-aware MCP gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', env = "TOOLGATE_CONFIG", default_value = "toolgate.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdio (the default).
    Serve,
    /// Parse and validate the configuration, then exit.
    CheckConfig,
    /// Start the downstream servers, print the discovered catalog, and exit.
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&cli.config).await,
        Commands::CheckConfig => check_config(&cli.config),
        Commands::Tools => print_tools(&cli.config).await,
    }
}

/// Logs go to stderr: stdout belongs to the MCP stream.
fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

struct Runtime {
    events: EventBus,
    zoo: Arc<ToolZoo>,
    sessions: Arc<SessionStore>,
    pool: Arc<ConnectionPool>,
    cancel: CancellationToken,
    worker: tokio::task::JoinHandle<()>,
}

async fn start_runtime(config: &GatewayConfig) -> Result<Runtime> {
    let events = EventBus::new(config.telemetry.queue_capacity);
    let cancel = CancellationToken::new();
    let worker = spawn_event_worker(
        events.clone(),
        config.telemetry.file_sink.clone(),
        cancel.clone(),
    );

    let embedder = provider_from_config(&config.tool_zoo);
    let zoo = Arc::new(ToolZoo::new(
        &config.tool_zoo,
        embedder,
        Some(events.clone()),
    ));
    let sessions =
        Arc::new(SessionStore::open(&config.session).context("open session store")?);
    let pool = Arc::new(ConnectionPool::new(
        &config.downstream_servers,
        Arc::clone(&zoo),
        events.clone(),
        config.pool.clone(),
    ));

    pool.start_all().await.context("start downstream servers")?;

    let stats = zoo.stats();
    info!(
        total = stats.total,
        embedded = stats.embedded_count,
        servers = stats.per_server.len(),
        "tool catalog ready"
    );
    for (server, count) in &stats.per_server {
        info!("  {}: {} tools", server, count);
    }
    zoo.persist().await.context("persist tool index")?;

    Ok(Runtime {
        events,
        zoo,
        sessions,
        pool,
        cancel,
        worker,
    })
}

async fn stop_runtime(runtime: Runtime) {
    runtime.pool.shutdown().await;
    if let Err(e) = runtime.zoo.persist().await {
        tracing::warn!("failed to persist tool index: {}", e);
    }
    runtime.cancel.cancel();
    let _ = runtime.worker.await;
}

async fn serve(config_path: &PathBuf) -> Result<()> {
    let config = GatewayConfig::load(config_path)?;
    init_tracing(&config.server.log_level);

    let runtime = start_runtime(&config).await?;
    let gateway = GatewayServer::new(
        &config,
        Arc::clone(&runtime.zoo),
        Arc::clone(&runtime.pool),
        Arc::clone(&runtime.sessions),
        runtime.events.clone(),
    );

    info!(name = %config.server.name, "serving MCP over stdio");
    let served = gateway.serve_stdio().await;

    stop_runtime(runtime).await;
    served.context("frontend transport")?;
    Ok(())
}

fn check_config(config_path: &PathBuf) -> Result<()> {
    let config = GatewayConfig::load(config_path)?;
    println!("configuration ok: {}", config_path.display());
    println!("  downstream servers: {}", config.downstream_servers.len());
    for server in &config.downstream_servers {
        println!(
            "    {} -> {} {}{}",
            server.name,
            server.command,
            server.args.join(" "),
            if server.required { " (required)" } else { "" }
        );
    }
    println!(
        "  router: mode={:?} max_tools={} max_per_server={} min_confidence={}",
        config.router.mode,
        config.router.max_tools,
        config.router.max_per_server,
        config.router.min_confidence
    );
    if config.tool_zoo.embedding_endpoint.is_none() {
        println!("  semantic search: disabled (no embedding_endpoint)");
    }
    Ok(())
}

async fn print_tools(config_path: &PathBuf) -> Result<()> {
    let config = GatewayConfig::load(config_path)?;
    init_tracing("warn");

    let runtime = start_runtime(&config).await?;
    for descriptor in runtime.zoo.list() {
        println!("{}", descriptor.qualified_name);
        if !descriptor.affordance_hint.is_empty() {
            println!("    {}", descriptor.affordance_hint);
        }
    }
    for (server, state) in runtime.pool.server_states() {
        eprintln!("server {}: {}", server, state);
    }
    stop_runtime(runtime).await;
    Ok(())
}
