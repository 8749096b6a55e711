use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use ulid::Ulid;

use sonde_core::wire::ServerEvent;
use sonde_core::{Meta, NodeId, Record, Source};
use sonde_gateway::api::error::ApiError;
use sonde_gateway::api::handlers;
use sonde_gateway::api::models::{CommandRequest, SeriesParams, SyncParams};
use sonde_gateway::socket::SocketSettings;
use sonde_gateway::state::GatewayState;
use sonde_gateway::AppState;
use sonde_store::{MemoryQueue, MemorySeriesStore, ReadingQueue, SeriesStore};

fn app_state() -> AppState<MemoryQueue, MemorySeriesStore> {
    AppState {
        queue: MemoryQueue::default(),
        series: MemorySeriesStore::default(),
        gateway: GatewayState::new(),
        settings: SocketSettings {
            buffer_size: 100,
            identify_timeout: Duration::from_secs(3),
        },
        cancel: CancellationToken::new(),
        tracker: TaskTracker::new(),
    }
}

fn record(node: &str, seq: u64, ts: i64) -> Record {
    Record {
        node_id: NodeId::from(node),
        seq,
        ts,
        payload: json!({"current": seq}).as_object().cloned().unwrap(),
        meta: Meta {
            source: Source::Esp32,
            raw_device_id: None,
            auto_identified: false,
        },
    }
}

async fn body_json(response: Response) -> Value {
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn series_rejects_mixed_range_kinds() {
    let state = app_state();
    let params = SeriesParams {
        from_ts: Some(0),
        from_seq: Some(1),
        ..Default::default()
    };

    let err = handlers::series(
        Path("A".to_owned()),
        Query(params),
        State(state),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn series_windows_are_inclusive_and_capped() {
    let state = app_state();
    state
        .series
        .insert_records((1..=20).map(|seq| record("A", seq, seq as i64 * 10)).collect())
        .await
        .unwrap();

    let params = SeriesParams {
        from_seq: Some(5),
        to_seq: Some(8),
        ..Default::default()
    };
    let body = body_json(
        handlers::series(Path("A".to_owned()), Query(params), State(state.clone()))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["success"], true);
    let seqs: Vec<u64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, [5, 6, 7, 8]);

    let params = SeriesParams {
        from_ts: Some(30),
        to_ts: Some(60),
        limit: Some(2),
        ..Default::default()
    };
    let body = body_json(
        handlers::series(Path("A".to_owned()), Query(params), State(state))
            .await
            .unwrap(),
    )
    .await;
    let seqs: Vec<u64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, [3, 4]);
}

#[tokio::test]
async fn sync_requires_last_seq_and_fills_the_gap() {
    let state = app_state();
    state
        .series
        .insert_records((1..=10).map(|seq| record("A", seq, seq as i64)).collect())
        .await
        .unwrap();

    let err = handlers::sync(
        Path("A".to_owned()),
        Query(SyncParams::default()),
        State(state.clone()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let body = body_json(
        handlers::sync(
            Path("A".to_owned()),
            Query(SyncParams { last_seq: Some(4) }),
            State(state.clone()),
        )
        .await
        .unwrap(),
    )
    .await;
    let replay: Vec<u64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(replay, [5, 6, 7, 8, 9, 10]);

    // Replay equals the equivalent open series window.
    let params = SeriesParams {
        from_seq: Some(5),
        ..Default::default()
    };
    let body = body_json(
        handlers::series(Path("A".to_owned()), Query(params), State(state))
            .await
            .unwrap(),
    )
    .await;
    let windowed: Vec<u64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(replay, windowed);
}

#[tokio::test]
async fn latest_is_null_until_a_record_lands() {
    let state = app_state();

    let body = body_json(
        handlers::latest(Path("A".to_owned()), State(state.clone()))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["data"], Value::Null);

    state
        .series
        .insert_records(vec![record("A", 1, 10), record("A", 2, 20)])
        .await
        .unwrap();
    let body = body_json(
        handlers::latest(Path("A".to_owned()), State(state))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["data"]["seq"], 2);
}

#[tokio::test]
async fn metrics_mirror_the_flush_counters() {
    let state = app_state();

    let body = body_json(
        handlers::metrics(Path("A".to_owned()), State(state.clone()))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["data"], Value::Null);

    state
        .queue
        .record_flush(&NodeId::from("A"), 150, 12345)
        .await
        .unwrap();
    let body = body_json(
        handlers::metrics(Path("A".to_owned()), State(state))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["data"]["totalRecords"], 150);
    assert_eq!(body["data"]["lastFlush"], 12345);
}

#[tokio::test]
async fn command_dispatch_reaches_the_node_socket() {
    let state = app_state();
    let node = NodeId::from("ESP32_A");
    let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
    state
        .gateway
        .node_connected(node.clone(), Ulid::new(), Value::Null, cmd_tx)
        .await;

    let request = CommandRequest {
        command: "setThreshold".to_owned(),
        data: json!({"threshold": 80}),
    };
    let body = body_json(
        handlers::command(
            Path("ESP32_A".to_owned()),
            State(state.clone()),
            Json(request),
        )
        .await
        .unwrap(),
    )
    .await;
    assert_eq!(body["data"]["event"], "/threshold/set");

    let event = cmd_rx.recv().await.unwrap();
    let ServerEvent::Command { event, data } = event else {
        panic!("expected a command event");
    };
    assert_eq!(event, "/threshold/set");
    assert_eq!(data, json!({"threshold": 80}));
}

#[tokio::test]
async fn command_errors_map_to_rest_statuses() {
    let state = app_state();

    // Unknown command is a 400-class error.
    let err = handlers::command(
        Path("ESP32_A".to_owned()),
        State(state.clone()),
        Json(CommandRequest {
            command: "reboot".to_owned(),
            data: Value::Null,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    // A disconnected node is a 404-class error.
    let err = handlers::command(
        Path("ESP32_A".to_owned()),
        State(state),
        Json(CommandRequest {
            command: "stop".to_owned(),
            data: Value::Null,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn nodes_and_health_reflect_the_registry() {
    let state = app_state();
    state
        .gateway
        .node_connected(
            NodeId::from("ESP32_A"),
            Ulid::new(),
            json!({"fw": "1.2"}),
            mpsc::channel(1).0,
        )
        .await;
    state.gateway.client_connected().await;

    let body = body_json(handlers::nodes(State(state.clone())).await).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["nodeId"], "ESP32_A");
    assert_eq!(body["data"][0]["metadata"]["fw"], "1.2");

    let health = handlers::health(State(state)).await;
    let bytes = axum::body::to_bytes(health.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connectedNodes"], 1);
    assert_eq!(health["connectedClients"], 1);
}
