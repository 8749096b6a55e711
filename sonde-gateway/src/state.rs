use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use ulid::Ulid;

use sonde_core::wire::ServerEvent;
use sonde_core::{now_ms, NodeId, NodeInfo};

/// Capacity of the dashboard fan-out channel. A client that falls further
/// behind than this drops frames and reconciles through `/api/sync`.
const FANOUT_CAPACITY: usize = 256;

/// One connected node as the gateway sees it. The command sender reaches
/// the connection task that owns the socket.
pub struct NodeEntry {
    pub socket_id: Ulid,
    pub connected_at: i64,
    pub metadata: Value,
    pub last_data_at: Option<i64>,
    cmd_tx: mpsc::Sender<ServerEvent>,
}

/// Shared registry of connected nodes and dashboard clients, plus the live
/// fan-out channel.
pub struct GatewayState {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<ServerEvent>,
}

struct Inner {
    nodes: HashMap<NodeId, NodeEntry>,
    client_count: usize,
    started_at: Instant,
}

impl GatewayState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                nodes: HashMap::new(),
                client_count: 0,
                started_at: Instant::now(),
            })),
            events,
        }
    }

    /// Register a node connection, replacing any previous entry for the
    /// same id (a reconnect under a fresh socket wins).
    pub async fn node_connected(
        &self,
        node_id: NodeId,
        socket_id: Ulid,
        metadata: Value,
        cmd_tx: mpsc::Sender<ServerEvent>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.nodes.insert(
            node_id.clone(),
            NodeEntry {
                socket_id,
                connected_at: now_ms(),
                metadata: metadata.clone(),
                last_data_at: None,
                cmd_tx,
            },
        );
        drop(inner);
        self.broadcast(ServerEvent::NodeConnected { node_id, metadata });
    }

    /// Remove a node entry if the given socket still owns it. Returns
    /// whether the entry was removed; a reconnect may have replaced it, in
    /// which case the stale socket's teardown is a no-op.
    pub async fn node_disconnected(&self, node_id: &NodeId, socket_id: Ulid) -> bool {
        let mut inner = self.inner.lock().await;
        let owned = inner
            .nodes
            .get(node_id)
            .is_some_and(|entry| entry.socket_id == socket_id);
        if owned {
            inner.nodes.remove(node_id);
        }
        drop(inner);
        if owned {
            self.broadcast(ServerEvent::NodeDisconnected {
                node_id: node_id.clone(),
            });
        }
        owned
    }

    pub async fn touch_last_data(&self, node_id: &NodeId, ts: i64) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.nodes.get_mut(node_id) {
            entry.last_data_at = Some(ts);
        }
    }

    /// Refresh a node's metadata in place on a repeated `identify`.
    pub async fn update_metadata(&self, node_id: &NodeId, metadata: Value) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.nodes.get_mut(node_id) {
            entry.metadata = metadata;
        }
    }

    /// Command channel into a node's connection task, if the node is
    /// connected.
    pub async fn command_sender(&self, node_id: &NodeId) -> Option<mpsc::Sender<ServerEvent>> {
        let inner = self.inner.lock().await;
        inner.nodes.get(node_id).map(|entry| entry.cmd_tx.clone())
    }

    /// Snapshot of the connected-node registry, ordered by node id.
    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        let inner = self.inner.lock().await;
        let mut nodes: Vec<NodeInfo> = inner
            .nodes
            .iter()
            .map(|(node_id, entry)| NodeInfo {
                node_id: node_id.clone(),
                socket_id: entry.socket_id.to_string(),
                connected_at: entry.connected_at,
                last_data_at: entry.last_data_at,
                metadata: entry.metadata.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub async fn client_connected(&self) {
        let mut inner = self.inner.lock().await;
        inner.client_count += 1;
    }

    pub async fn client_disconnected(&self) {
        let mut inner = self.inner.lock().await;
        inner.client_count = inner.client_count.saturating_sub(1);
    }

    pub async fn node_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.nodes.len()
    }

    pub async fn client_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.client_count
    }

    pub async fn uptime_secs(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.started_at.elapsed().as_secs()
    }

    /// Fan an event out to every subscribed dashboard. Sending with no
    /// subscribers is not an error.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for GatewayState {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}
