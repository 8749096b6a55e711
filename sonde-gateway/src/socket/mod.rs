//! The device/dashboard socket endpoint.
//!
//! Each connection is one task. A fresh socket starts unidentified: an
//! `identify` frame or a first `/save` promotes it to a node session, an
//! `identify {type:"client"}` promotes it to a dashboard session. A socket
//! that stays silent past the identification window is parked, not closed;
//! a later `/save` still promotes it.

pub mod client;
pub mod node;

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::Value;
use tracing::{debug, info, warn};
use ulid::Ulid;

use sonde_core::wire::{ClientEvent, IdentifyKind};
use sonde_core::NodeId;
use sonde_store::{ReadingQueue, SeriesStore};

use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("node identify frame carries no usable id")]
    MissingId,
}

/// Per-connection tuning shared through the app state.
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    pub buffer_size: usize,
    pub identify_timeout: Duration,
}

pub async fn socket_handler<Q, S>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<Q, S>>,
) -> Response
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(async move {
            if let Err(e) = run_connection(socket, state).await {
                warn!(error = %e, "Connection closed with error");
            }
        })
    })
}

/// Pre-identification phase of every connection.
async fn run_connection<Q, S>(
    mut socket: WebSocket,
    state: AppState<Q, S>,
) -> Result<(), SocketError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let socket_id = Ulid::new();
    let cancel = state.cancel.clone();

    let identify_deadline = tokio::time::sleep(state.settings.identify_timeout);
    tokio::pin!(identify_deadline);
    let mut pending = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = &mut identify_deadline, if pending => {
                pending = false;
                info!(%socket_id, "Socket not identified in time, parked");
            }
            received = socket.recv() => {
                let text = match received {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => continue,
                };

                let event = match ClientEvent::parse(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(%socket_id, error = %e, "Dropping malformed frame");
                        continue;
                    }
                };

                match event {
                    ClientEvent::Identify(frame) => match frame.kind {
                        IdentifyKind::Node => {
                            let Some(node_id) = frame.node_id else {
                                warn!(%socket_id, "Node identify without an id, closing");
                                return Err(SocketError::MissingId);
                            };
                            return node::run(
                                socket,
                                socket_id,
                                NodeId(node_id),
                                frame.metadata,
                                false,
                                None,
                                state,
                            )
                            .await;
                        }
                        IdentifyKind::Client => {
                            return client::run(socket, socket_id, state).await;
                        }
                    },
                    // A reading before `identify` makes this a node.
                    ClientEvent::Save(payload) => {
                        let node_id = save_device_id(&payload)
                            .unwrap_or_else(|| synthesized_node_id(socket_id));
                        return node::run(
                            socket,
                            socket_id,
                            NodeId(node_id),
                            Value::Null,
                            true,
                            Some(payload),
                            state,
                        )
                        .await;
                    }
                    other => {
                        debug!(%socket_id, event = other.name(), "Frame before identification ignored");
                    }
                }
            }
        }
    }
}

fn save_device_id(payload: &Value) -> Option<String> {
    payload
        .get("deviceId")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Fallback identity for firmware that pushes readings without a device id.
fn synthesized_node_id(socket_id: Ulid) -> String {
    let id = socket_id.to_string();
    format!("ESP32_{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_ids_use_the_socket_id_prefix() {
        let socket_id = Ulid::new();
        let node_id = synthesized_node_id(socket_id);
        assert!(node_id.starts_with("ESP32_"));
        assert_eq!(node_id.len(), "ESP32_".len() + 8);
        assert!(socket_id.to_string().starts_with(&node_id["ESP32_".len()..]));
    }

    #[test]
    fn device_id_is_lifted_from_the_save_payload() {
        let payload = serde_json::json!({"deviceId": "ESP32_A", "min": 1});
        assert_eq!(save_device_id(&payload).as_deref(), Some("ESP32_A"));
        assert_eq!(save_device_id(&serde_json::json!({"min": 1})), None);
    }
}
