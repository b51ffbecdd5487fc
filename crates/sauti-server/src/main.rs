//! Sauti gateway server - WebSocket back-end for voice-interactive AI chat clients.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod devices;
mod session;
mod state;

use sauti_core::config::Config;
use sauti_core::pool::PoolManager;
use sauti_core::providers::registry::{register_builtin_providers, ProviderRegistry};
use sauti_core::task::TaskManager;
use sauti_core::tools::{TimeTool, ToolRegistry};

use auth::TokenVerifier;
use devices::MemoryDeviceStore;
use state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "sauti-server",
    about = "WebSocket gateway for voice-interactive AI chat clients",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path (default: SAUTI_CONFIG or ./config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    let (mut config, config_path) = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Keep the non-blocking writer guard alive for the process lifetime.
    let _log_guard = init_logging(&config);
    info!("starting sauti gateway, config: {}", config_path.display());

    let mut registry = ProviderRegistry::new();
    register_builtin_providers(&mut registry);

    // Initial pool construction below minimum is an irrecoverable startup
    // failure, like a failed bind.
    let pools = Arc::new(PoolManager::new(&registry, &config).await?);
    info!("provider pools initialised");

    let tasks = TaskManager::new(config.tasks.clone());
    tasks.start();

    let mut tools = ToolRegistry::new();
    tools.register(TimeTool);

    let shutdown = CancellationToken::new();
    let state = AppState {
        verifier: Arc::new(TokenVerifier::new(&config.auth)),
        config: Arc::new(config),
        pools,
        tasks,
        tools: Arc::new(tools),
        sessions: Arc::new(RwLock::new(HashMap::new())),
        devices: Arc::new(MemoryDeviceStore::new()),
        shutdown: shutdown.clone(),
    };

    let app = api::create_router(state.clone());

    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on ws://{addr}/ws");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_sequence(&state, shutdown).await;
    info!("gateway stopped");
    Ok(())
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = &config.log.level;
    let default_filter = format!("sauti_server={level},sauti_core={level},tower_http=warn");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let (file_layer, guard) = match &config.log.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sauti-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}

/// Ordered teardown: new connections are already refused once
/// `axum::serve` returns. Fire every session scope, give sessions a
/// bounded grace period to drain, then close the pools and stop the task
/// manager. Any step exceeding its deadline proceeds forcibly.
async fn shutdown_sequence(state: &AppState, shutdown: CancellationToken) {
    shutdown.cancel();
    state.cancel_all_sessions().await;

    let grace = state.config.server.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        loop {
            if state.session_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = state.session_count().await,
            "session drain exceeded grace period, proceeding"
        );
    }

    state.pools.close().await;
    state.tasks.stop().await;
}
