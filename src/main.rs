use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratekeeper::admission::{ip_key_fn, HttpServer, RateLimitLayer};
use ratekeeper::backend::{MemoryBackend, RedisBackend};
use ratekeeper::config::{BackendKind, RatekeeperConfig};
use ratekeeper::ratelimit::{ExceptionRules, ExclFn, NoopStore, SharedStore, Store};

/// Fixed-window request admission control.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = RatekeeperConfig::load(args.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.limiter.backend,
        enabled = config.limiter.enabled,
        "Configuration loaded"
    );

    let exceptions = match &config.limiter.exceptions_path {
        Some(path) => {
            let rules = ExceptionRules::from_file(path)?;
            info!(count = rules.exceptions.len(), "Exception rules loaded");
            Some(rules.into_excl_fn())
        }
        None => None,
    };

    if !config.limiter.enabled {
        info!("Rate limiting disabled, admitting every request");
        return run(&config, NoopStore::new(), exceptions).await;
    }

    let store_config = config.limiter.to_store_config();
    match config.limiter.backend {
        BackendKind::Memory => {
            let backend = MemoryBackend::new();
            let sweep = Duration::from_millis(config.limiter.sweep_interval_ms.max(1));
            backend.spawn_sweeper(sweep);
            let store = SharedStore::new(backend, store_config)?;
            run(&config, store, exceptions).await
        }
        BackendKind::Redis => {
            let backend = RedisBackend::connect(&config.limiter.redis_url).await?;
            info!(url = %config.limiter.redis_url, "Connected to Redis");
            let store = SharedStore::new(backend, store_config)?;
            run(&config, store, exceptions).await
        }
    }
}

/// Serve HTTP with `store` until a shutdown signal arrives.
async fn run<St: Store + 'static>(
    config: &RatekeeperConfig,
    store: St,
    exceptions: Option<Arc<ExclFn>>,
) -> anyhow::Result<()> {
    let mut layer = RateLimitLayer::new(store)
        .key_fn(ip_key_fn(config.middleware.ip_headers.clone()))
        .date_format(config.middleware.date_format.clone())?;
    if let Some(excl) = exceptions {
        layer = layer.exceptions(excl);
    }

    HttpServer::new(config.server.http_addr, layer)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Ratekeeper stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
