pub mod error;
pub mod handlers;
pub mod models;

use axum::{
    routing::{get, post},
    Router,
};

use sonde_store::{ReadingQueue, SeriesStore};

use crate::AppState;

pub fn router<Q, S>() -> Router<AppState<Q, S>>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    Router::new()
        .route("/api/series/{node_id}", get(handlers::series))
        .route("/api/latest/{node_id}", get(handlers::latest))
        .route("/api/sync/{node_id}", get(handlers::sync))
        .route("/api/nodes", get(handlers::nodes))
        .route("/api/metrics/{node_id}", get(handlers::metrics))
        .route("/api/command/{node_id}", post(handlers::command))
        .route("/health", get(handlers::health))
}
