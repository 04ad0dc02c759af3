//! relayd: the relaygrid daemon.
//!
//! Single binary that assembles the relay:
//! - Job registry + cursor store (redb)
//! - Rate limiter shared by every worker
//! - Supervisor and its forwarding workers
//! - REST API
//!
//! # Usage
//!
//! ```text
//! relayd run --config relay.toml --port 5000 --data-dir /var/lib/relaygrid
//! relayd config --config relay.toml
//! ```

mod logging;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use relay_core::RelayConfig;
use relaygrid_api::{ApiState, build_router};
use relaygrid_forwarder::{DiscordWebhook, TelegramPreview, WorkerSettings};
use relaygrid_metrics::ForwardMetrics;
use relaygrid_ratelimit::RateLimiter;
use relaygrid_state::{JobManager, StateStore};
use relaygrid_supervisor::{Supervisor, SupervisorDeps, SupervisorSettings};

/// Environment variable that overrides `[auth] token`.
const TOKEN_ENV: &str = "RELAY_AUTH_TOKEN";
/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "relay.toml";

#[derive(Parser)]
#[command(name = "relayd", about = "relaygrid daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay: API server, supervisor and workers.
    Run {
        /// Path to relay.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides [server] port).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the database and log file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit console logs as JSON.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the effective configuration and exit.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env_token = std::env::var(TOKEN_ENV).ok();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_json,
        } => {
            let config = load_config(config.as_deref(), port, data_dir, env_token)?;
            run(config, log_json).await
        }
        Command::Config { config } => {
            let mut config = load_config(config.as_deref(), None, None, env_token)?;
            if config.auth.token.is_some() {
                config.auth.token = Some("<redacted>".to_string());
            }
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Resolve the effective configuration: file (explicit or `relay.toml`
/// in the working directory), then CLI flags, then the token variable.
fn load_config(
    path: Option<&Path>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    env_token: Option<String>,
) -> anyhow::Result<RelayConfig> {
    let default_path = Path::new(DEFAULT_CONFIG);
    let path = path.or_else(|| default_path.exists().then_some(default_path));

    let mut config = match path {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
        config.auth.token = Some(token.trim().to_string());
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: RelayConfig, log_json: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let _log_guard = logging::init(&config.log_path(), log_json)?;
    info!(data_dir = %config.data_dir.display(), "relayd starting");

    let token = config
        .auth
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .with_context(|| format!("no API token configured: set [auth] token or {TOKEN_ENV}"))?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&config.db_path())?;
    info!(path = %config.db_path().display(), "state store opened");
    let jobs = JobManager::new(store);

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.global_per_second));
    let timeout = config.worker.request_timeout();
    let source = Arc::new(TelegramPreview::new(timeout)?);
    let sink = Arc::new(DiscordWebhook::new(
        timeout,
        config.worker.default_embed_color(),
    )?);

    let supervisor = Arc::new(Supervisor::new(
        jobs,
        SupervisorDeps {
            source,
            sink,
            limiter,
            metrics: ForwardMetrics::new(),
            worker: WorkerSettings::from_config(&config.worker),
            settings: SupervisorSettings::from_config(&config),
        },
    ));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor_handle = tokio::spawn(supervisor.clone().run(shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        supervisor,
        auth_token: Arc::from(token),
        log_path: config.log_path(),
    });
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.bind, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    match supervisor_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "supervisor exited with error"),
        Err(e) => error!(error = %e, "supervisor task failed"),
    }
    info!("relayd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
