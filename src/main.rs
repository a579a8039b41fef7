//! kpf - Kubernetes port-forward session manager
//!
//! ## Modes
//!
//! **MCP** (`kpf mcp`, also the default): serves the `start_port_forward`,
//! `stop_port_forward` and `list_port_forwards` tools over stdio.
//!
//! **Forward** (`kpf forward <target> <ports>`): starts a single session and
//! keeps it open until Ctrl-C.

use clap::{Parser as ClapParser, Subcommand};
use kpf::{
    cluster::{kubernetes::ConnectError, KubeCluster},
    config::{self, ConfigError, KpfConfig},
    forward::{ForwardError, ForwardManager, StartRequest},
    mcp::KpfMcpServer,
    target::ParseError,
};
use rmcp::ServiceExt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// kpf - Kubernetes port-forward session manager
///
/// Forwards local TCP ports to pods and services, either as MCP tools for
/// AI hosts or directly from the command line.
#[derive(ClapParser, Debug)]
#[command(name = "kpf", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// kubeconfig context to use instead of the current one
    #[arg(long, global = true, env = "KPF_CONTEXT")]
    context: Option<String>,

    /// Default namespace for targets
    #[arg(short = 'n', long, global = true, env = "KPF_NAMESPACE")]
    namespace: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the port-forward tools over MCP stdio (for AI hosts)
    Mcp,

    /// Forward one local port until interrupted
    Forward {
        /// pod/<name>, service/<name> or svc/<name>
        target: String,

        /// PORT or LOCAL:REMOTE
        ports: String,
    },
}

#[derive(Error, Debug)]
pub enum KpfError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("cluster connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Forward(#[from] ForwardError),

    #[error("mcp error: {0}")]
    Mcp(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), KpfError> {
    let cli = Cli::parse();

    // MCP mode: tracing must use stderr since stdout is for MCP protocol
    let is_mcp = !matches!(cli.command, Some(Commands::Forward { .. }));
    if is_mcp {
        init_tracing_stderr();
    } else {
        init_tracing();
    }

    // Reject malformed arguments before touching the cluster.
    let forward = match &cli.command {
        Some(Commands::Forward { target, ports }) => Some(StartRequest::parse(target, ports, None)?),
        _ => None,
    };

    let config = load_config(&cli)?;
    let context = cli.context.clone().or_else(|| config.context.clone());
    let namespace = cli.namespace.clone().or_else(|| config.namespace.clone());

    let cluster = KubeCluster::connect(context.as_deref(), namespace.as_deref()).await?;
    let manager = ForwardManager::new(Arc::new(cluster), config.forward_options());

    match forward {
        Some(request) => run_forward(manager, request).await,
        None => run_mcp(manager).await,
    }
}

/// Initialize tracing with the default stdout writer.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kpf=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize tracing with stderr output.
///
/// MCP mode uses stdout for the JSON-RPC protocol, so all tracing MUST go
/// to stderr to avoid corrupting the protocol stream.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kpf=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// An explicit `--config` must exist; the default path is optional.
fn load_config(cli: &Cli) -> Result<KpfConfig, KpfError> {
    match &cli.config {
        Some(path) => match KpfConfig::load(path)? {
            Some(config) => Ok(config),
            None => Err(KpfError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            ))),
        },
        None => match config::default_config_path() {
            Some(path) => Ok(KpfConfig::load_or_default(&path)?),
            None => Ok(KpfConfig::default()),
        },
    }
}

// ── MCP stdio mode ─────────────────────────────────────────────────

async fn run_mcp(manager: ForwardManager) -> Result<(), KpfError> {
    tracing::info!("kpf mcp server starting");

    let server = KpfMcpServer::new(manager.clone());
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .map_err(|e| KpfError::Mcp(e.to_string()))?;
    let reason = service
        .waiting()
        .await
        .map_err(|e| KpfError::Mcp(e.to_string()))?;
    tracing::debug!(?reason, "mcp session ended");

    manager.shutdown().await;
    tracing::info!("kpf mcp server exiting");
    Ok(())
}

// ── Forward mode ───────────────────────────────────────────────────

async fn run_forward(manager: ForwardManager, request: StartRequest) -> Result<(), KpfError> {
    let session = manager.start(request).await?;

    eprintln!(
        "kpf: forwarding {}:{} -> {}/{}:{} ({})",
        manager.options().bind_address,
        session.local_port,
        session.namespace,
        session.pod_name,
        session.pod_port,
        session.id,
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, stopping port-forward");
    manager.shutdown().await;
    Ok(())
}
