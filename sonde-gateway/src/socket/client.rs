use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use sonde_core::wire::{ClientEvent, ServerEvent};
use sonde_core::NodeId;
use sonde_store::{ReadingQueue, SeriesStore};

use super::SocketError;
use crate::AppState;

/// Drive a dashboard connection: send the registry snapshot, then forward
/// the live stream until the socket closes.
pub(super) async fn run<Q, S>(
    mut socket: WebSocket,
    socket_id: Ulid,
    state: AppState<Q, S>,
) -> Result<(), SocketError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = state.gateway.subscribe();
    state.gateway.client_connected().await;
    info!(%socket_id, "Dashboard client connected");

    let snapshot = state.gateway.snapshot().await;
    if socket
        .send(Message::Text(
            ServerEvent::NodesList(snapshot).to_frame().into(),
        ))
        .await
        .is_err()
    {
        state.gateway.client_disconnected().await;
        return Ok(());
    }

    // Room membership is tracked for selective fan-out later; today every
    // client receives the full stream.
    let mut rooms: HashSet<NodeId> = HashSet::new();
    let cancel = state.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if socket
                        .send(Message::Text(event.to_frame().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%socket_id, skipped, "Client lagging behind the live stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            received = socket.recv() => match received {
                None => break,
                Some(Err(e)) => {
                    warn!(%socket_id, error = %e, "Socket read failed");
                    break;
                }
                Some(Ok(Message::Text(text))) => match ClientEvent::parse(text.as_str()) {
                    Ok(ClientEvent::Subscribe(node_id)) => {
                        rooms.insert(NodeId(node_id));
                    }
                    Ok(ClientEvent::Unsubscribe(node_id)) => {
                        rooms.remove(&NodeId(node_id));
                    }
                    Ok(ClientEvent::Identify(_)) => {}
                    Ok(other) => {
                        debug!(%socket_id, event = other.name(), "Ignoring event from a client socket");
                    }
                    Err(e) => warn!(%socket_id, error = %e, "Dropping malformed frame"),
                },
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.gateway.client_disconnected().await;
    info!(%socket_id, "Dashboard client disconnected");
    Ok(())
}
