use axum::extract::ws::{Message, WebSocket};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use sonde_core::wire::{ClientEvent, IdentifyKind, ServerEvent};
use sonde_core::{now_ms, Meta, NodeId, Reading, Source};
use sonde_store::{ReadingQueue, SeriesStore};

use super::SocketError;
use crate::state::GatewayState;
use crate::AppState;

/// Size of the per-node command mailbox.
const COMMAND_CAPACITY: usize = 16;

/// Drive an identified node connection until it closes or the gateway
/// shuts down. Whatever is still buffered is flushed on the way out.
pub(super) async fn run<Q, S>(
    mut socket: WebSocket,
    socket_id: Ulid,
    node_id: NodeId,
    metadata: Value,
    auto_identified: bool,
    initial_save: Option<Value>,
    state: AppState<Q, S>,
) -> Result<(), SocketError>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    state
        .gateway
        .node_connected(node_id.clone(), socket_id, metadata, cmd_tx)
        .await;
    info!(%socket_id, node_id = %node_id, auto_identified, "Node connected");

    let mut session = NodeSession {
        node_id,
        auto_identified,
        buffer: Vec::with_capacity(state.settings.buffer_size),
        buffer_size: state.settings.buffer_size,
        gateway: state.gateway.clone(),
        queue: state.queue.clone(),
    };

    if let Some(payload) = initial_save {
        session.accept_save(payload).await;
    }

    let cancel = state.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(node_id = %session.node_id, "Shutdown, closing node socket");
                break;
            }
            Some(command) = cmd_rx.recv() => {
                if socket
                    .send(Message::Text(command.to_frame().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            received = socket.recv() => {
                match received {
                    None => break,
                    Some(Err(e)) => {
                        warn!(node_id = %session.node_id, error = %e, "Socket read failed");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => session.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Best-effort handoff of whatever is still buffered.
    session.flush().await;
    if state
        .gateway
        .node_disconnected(&session.node_id, socket_id)
        .await
    {
        info!(node_id = %session.node_id, "Node disconnected");
    }
    Ok(())
}

/// Owns one device's buffer. Because the session lives inside the
/// connection task, appends and flushes for a device are serialized and at
/// most one flush is in flight at a time.
struct NodeSession<Q> {
    node_id: NodeId,
    auto_identified: bool,
    buffer: Vec<Reading>,
    buffer_size: usize,
    gateway: GatewayState,
    queue: Q,
}

impl<Q: ReadingQueue> NodeSession<Q> {
    async fn handle_frame(&mut self, text: &str) {
        let event = match ClientEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match event {
            ClientEvent::Save(payload) => self.accept_save(payload).await,
            ClientEvent::Data(payload) => self.accept(payload, Source::SocketIo, None).await,
            ClientEvent::BulkData(items) => {
                for item in items {
                    self.accept(item, Source::SocketIo, None).await;
                }
            }
            ClientEvent::Identify(frame) => {
                // Repeated identify refreshes the entry in place.
                if frame.kind == IdentifyKind::Node {
                    self.gateway
                        .update_metadata(&self.node_id, frame.metadata)
                        .await;
                } else {
                    warn!(node_id = %self.node_id, "Ignoring client identify on a node socket");
                }
            }
            ClientEvent::Subscribe(_) | ClientEvent::Unsubscribe(_) => {}
        }
    }

    async fn accept_save(&mut self, payload: Value) {
        let raw_device_id = payload
            .get("deviceId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        self.accept(payload, Source::Esp32, raw_device_id).await;
    }

    async fn accept(&mut self, payload: Value, source: Source, raw_device_id: Option<String>) {
        let Value::Object(payload) = payload else {
            warn!(node_id = %self.node_id, "Discarding non-object reading payload");
            return;
        };

        let reading = Reading {
            node_id: self.node_id.clone(),
            ts: now_ms(),
            payload,
            meta: Meta {
                source,
                raw_device_id,
                auto_identified: self.auto_identified,
            },
        };

        self.gateway.touch_last_data(&self.node_id, reading.ts).await;
        // Live fan-out happens before the durable handoff.
        self.gateway.broadcast(ServerEvent::DataLive(reading.clone()));
        self.buffer.push(reading);

        if self.buffer.len() >= self.buffer_size {
            self.flush().await;
        }
    }

    /// Hand the buffered readings to the durable queue in acceptance
    /// order. On failure the buffer is kept and the next trigger retries.
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let entries = match self
            .buffer
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(entries) => entries,
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Reading serialization failed");
                return;
            }
        };

        match self.queue.push_batch(&self.node_id, entries).await {
            Ok(()) => {
                debug!(node_id = %self.node_id, count = self.buffer.len(), "Buffer flushed to queue");
                self.buffer.clear();
            }
            Err(e) => {
                warn!(
                    node_id = %self.node_id,
                    buffered = self.buffer.len(),
                    error = %e,
                    "Queue push failed, keeping buffer"
                );
            }
        }
    }
}
