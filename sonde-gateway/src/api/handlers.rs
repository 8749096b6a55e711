use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, info};

use sonde_core::wire::ServerEvent;
use sonde_core::{Command, NodeId, DEFAULT_SERIES_LIMIT};
use sonde_store::{ReadingQueue, SeriesRange, SeriesStore};

use super::error::ApiError;
use super::models::{
    ApiResponse, CommandRequest, CommandResponse, HealthResponse, SeriesParams, SyncParams,
};
use crate::AppState;

fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        data,
    })
    .into_response()
}

/// Historical window, ordered by sequence ascending. Time range and
/// sequence range are mutually exclusive; with neither, the first `limit`
/// records are returned.
pub async fn series<Q, S>(
    Path(node_id): Path<String>,
    Query(params): Query<SeriesParams>,
    State(state): State<AppState<Q, S>>,
) -> Result<Response, ApiError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let node = NodeId(node_id);
    let has_ts = params.from_ts.is_some() || params.to_ts.is_some();
    let has_seq = params.from_seq.is_some() || params.to_seq.is_some();
    if has_ts && has_seq {
        return Err(ApiError::BadRequest(
            "time range and sequence range are mutually exclusive".to_owned(),
        ));
    }

    let range = if has_ts {
        SeriesRange::Ts {
            from: params.from_ts.unwrap_or(0),
            to: params.to_ts.unwrap_or(i64::MAX),
        }
    } else {
        SeriesRange::Seq {
            from: params.from_seq.unwrap_or(1),
            to: params.to_seq.unwrap_or(u64::MAX),
        }
    };
    let limit = params.limit.unwrap_or(DEFAULT_SERIES_LIMIT);

    let records = state.series.query(&node, range, limit).await.map_err(|e| {
        error!(node_id = %node, error = %e, "Series query failed");
        ApiError::Internal(format!("series query failed: {e}"))
    })?;
    Ok(ok(records))
}

/// The record with the highest sequence, or null.
pub async fn latest<Q, S>(
    Path(node_id): Path<String>,
    State(state): State<AppState<Q, S>>,
) -> Result<Response, ApiError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let node = NodeId(node_id);
    let record = state.series.latest(&node).await.map_err(|e| {
        error!(node_id = %node, error = %e, "Latest query failed");
        ApiError::Internal(format!("latest query failed: {e}"))
    })?;
    Ok(ok(record))
}

/// Gap recovery: every record with `seq > lastSeq`, ordered by sequence.
pub async fn sync<Q, S>(
    Path(node_id): Path<String>,
    Query(params): Query<SyncParams>,
    State(state): State<AppState<Q, S>>,
) -> Result<Response, ApiError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let node = NodeId(node_id);
    let Some(last_seq) = params.last_seq else {
        return Err(ApiError::BadRequest(
            "lastSeq query parameter is required".to_owned(),
        ));
    };

    let records = state.series.since_seq(&node, last_seq).await.map_err(|e| {
        error!(node_id = %node, error = %e, "Sync query failed");
        ApiError::Internal(format!("sync query failed: {e}"))
    })?;
    Ok(ok(records))
}

/// Snapshot of the connected-node registry.
pub async fn nodes<Q, S>(State(state): State<AppState<Q, S>>) -> Response
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    ok(state.gateway.snapshot().await)
}

/// Flush metrics for one node, or null if none were recorded in the TTL
/// window.
pub async fn metrics<Q, S>(
    Path(node_id): Path<String>,
    State(state): State<AppState<Q, S>>,
) -> Result<Response, ApiError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let node = NodeId(node_id);
    let metrics = state.queue.metrics(&node).await.map_err(|e| {
        error!(node_id = %node, error = %e, "Metrics lookup failed");
        ApiError::Internal(format!("metrics lookup failed: {e}"))
    })?;
    Ok(ok(metrics))
}

/// Forward a control command to a connected node's socket.
pub async fn command<Q, S>(
    Path(node_id): Path<String>,
    State(state): State<AppState<Q, S>>,
    Json(request): Json<CommandRequest>,
) -> Result<Response, ApiError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let node = NodeId(node_id);
    let Some(command) = Command::parse(&request.command) else {
        return Err(ApiError::BadRequest(format!(
            "unknown command {:?}",
            request.command
        )));
    };

    let Some(sender) = state.gateway.command_sender(&node).await else {
        return Err(ApiError::NotFound(format!("node {node} is not connected")));
    };

    let event = command.wire_event();
    sender
        .send(ServerEvent::Command {
            event,
            data: request.data,
        })
        .await
        .map_err(|_| ApiError::NotFound(format!("node {node} socket expired")))?;

    info!(node_id = %node, event, "Command dispatched");
    Ok(ok(CommandResponse {
        node_id: node.to_string(),
        event,
    }))
}

pub async fn health<Q, S>(State(state): State<AppState<Q, S>>) -> Response
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    Json(HealthResponse {
        status: "ok",
        connected_nodes: state.gateway.node_count().await,
        connected_clients: state.gateway.client_count().await,
        uptime_seconds: state.gateway.uptime_secs().await,
    })
    .into_response()
}
