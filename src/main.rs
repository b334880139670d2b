use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stormon::app::AppContext;
use stormon::config::{self, AppConfig};
use stormon::db::WarehouseClient;
use stormon::metrics::AppMetrics;
use stormon::state::SharedState;
use stormon::{http, poller};

#[derive(Debug, Parser)]
#[command(author, version, about = "Warehouse storage growth monitor")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env STORMON_CONFIG or built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Render the dashboard once, print it as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    let metrics = AppMetrics::new()?;
    let state = SharedState::new();

    if cli.once {
        let client = Arc::new(WarehouseClient::connect(&config).await?);
        return run_once(config, client, metrics, state).await;
    }

    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let client = Arc::new(WarehouseClient::connect(&config).await?);
    let ctx = AppContext::new(config, client.clone(), metrics, state);

    let poller_handles = poller::spawn_all(ctx.clone());
    let router = http::create_router(ctx.clone());

    info!("stormon listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    shutdown_pollers(poller_handles).await;
    client.close().await;

    Ok(())
}

async fn run_once(
    config: AppConfig,
    client: Arc<WarehouseClient>,
    metrics: AppMetrics,
    state: SharedState,
) -> anyhow::Result<()> {
    let ctx = AppContext::new(config, client.clone(), metrics, state);
    let outcome = poller::refresh_now(&ctx).await;
    client.close().await;
    outcome?;

    let snapshot = ctx
        .state
        .dashboard()
        .await
        .context("refresh completed without publishing a dashboard")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stormon=info,axum::rejection=trace"));
    // Logs go to stderr so `--once` output stays clean JSON.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

async fn shutdown_pollers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
        // Wait for the task to unwind so no statement is submitted after close.
        let _ = handle.await;
    }
}
