use std::path::PathBuf;

use axum::{routing::get, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sonde_ingester::config::{Config, QueueBackend, SeriesBackend};
use sonde_ingester::{Ingester, IngesterSettings};
use sonde_store::{
    MemoryQueue, MemorySeriesStore, MongoSeriesStore, ReadingQueue, RedisQueue, SeriesStore,
};

#[derive(Parser)]
#[command(name = "sonde-ingester")]
#[command(about = "Sonde batch ingester")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sonde-ingester.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,sonde_ingester=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };
    config.apply_env();

    info!(http_addr = %config.server.http_addr, "Starting sonde-ingester");

    match config.queue.clone() {
        QueueBackend::Redis {
            host,
            port,
            password,
            prefix,
        } => {
            let url = RedisQueue::url(&host, port, password.as_deref());
            info!(%host, port, "Using Redis queue");
            let queue = RedisQueue::connect(&url, prefix).await?;
            run_with_series(config, queue).await
        }
        QueueBackend::Memory => {
            info!("Using in-memory queue");
            run_with_series(config, MemoryQueue::default()).await
        }
    }
}

async fn run_with_series<Q: ReadingQueue>(config: Config, queue: Q) -> color_eyre::Result<()> {
    match config.series.clone() {
        SeriesBackend::Mongo { uri, database } => {
            info!(%database, "Using MongoDB series store");
            let series = MongoSeriesStore::connect(&uri, &database).await?;
            run_ingester(config, queue, series).await
        }
        SeriesBackend::Memory => {
            info!("Using in-memory series store");
            run_ingester(config, queue, MemorySeriesStore::default()).await
        }
    }
}

async fn run_ingester<Q, S>(config: Config, queue: Q, series: S) -> color_eyre::Result<()>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let cancel = CancellationToken::new();

    let ingester = Ingester::new(queue, series, IngesterSettings::default());
    let worker = {
        let ingester = ingester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ingester.run(cancel).await;
        })
    };

    let app = Router::new().route("/health", get(health_handler));
    let listener = TcpListener::bind(config.server.http_addr).await?;
    info!(http_addr = %config.server.http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = shutdown_signal() => {
            cancel.cancel();
        }
    }

    // Let in-flight drain loops observe the cancellation and finish.
    let _ = worker.await;

    info!("sonde-ingester shut down complete");
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received Ctrl+C, shutting down...");
    }
}
