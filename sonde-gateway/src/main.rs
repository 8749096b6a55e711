use std::path::PathBuf;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use sonde_gateway::config::{Config, QueueBackend, SeriesBackend};
use sonde_gateway::socket::{socket_handler, SocketSettings};
use sonde_gateway::state::GatewayState;
use sonde_gateway::{api, AppState};
use sonde_store::{
    MemoryQueue, MemorySeriesStore, MongoSeriesStore, ReadingQueue, RedisQueue, SeriesStore,
};

#[derive(Parser)]
#[command(name = "sonde-gateway")]
#[command(about = "Sonde ingress gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sonde-gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,sonde_gateway=info".to_owned());
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

    info!(
        http_addr = %config.server.http_addr,
        buffer_size = config.socket.buffer_size,
        "Starting sonde-gateway"
    );

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
            run_gateway(config, queue, series).await
        }
        SeriesBackend::Memory => {
            info!("Using in-memory series store");
            run_gateway(config, queue, MemorySeriesStore::default()).await
        }
    }
}

async fn run_gateway<Q, S>(config: Config, queue: Q, series: S) -> color_eyre::Result<()>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let state = AppState {
        queue,
        series,
        gateway: GatewayState::new(),
        settings: SocketSettings {
            buffer_size: config.socket.buffer_size,
            identify_timeout: Duration::from_millis(config.socket.identify_timeout_ms),
        },
        cancel: cancel.clone(),
        tracker: tracker.clone(),
    };

    let app = Router::new()
        .route("/socket", get(socket_handler))
        .merge(api::router())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(config.server.http_addr).await?;
    info!(http_addr = %config.server.http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    let mut server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_for_http.cancelled().await;
            })
            .await
        {
            error!(error = ?e, "HTTP server error");
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            cancel.cancel();
            let _ = (&mut server).await;
        }
        result = &mut server => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server task failed");
            }
            cancel.cancel();
        }
    }

    // Cancellation makes every connection task flush its buffer; wait for
    // those flushes to land before exiting.
    tracker.close();
    tracker.wait().await;

    info!("sonde-gateway shut down complete");
    Ok(())
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
