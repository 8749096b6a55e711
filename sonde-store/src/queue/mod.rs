pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sonde_core::NodeId;

/// Per-node flush bookkeeping kept next to the durable queue. The hash
/// carries a 24h TTL, so the counters describe a rolling window rather
/// than all of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_records: u64,
    pub last_flush: i64,
}

/// Durable per-node FIFO between the gateway and the ingester.
///
/// The gateway is the only producer and the ingester the only consumer;
/// entries are UTF-8 JSON serializations of a `Reading`. Implementations
/// must append a batch as one unit so a reading is never both buffered and
/// queued.
#[async_trait]
pub trait ReadingQueue: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append serialized readings to the tail of a node's queue, in order,
    /// as a single batch.
    async fn push_batch(&self, node: &NodeId, entries: Vec<String>) -> Result<(), Self::Error>;

    /// Pop up to `count` entries from the head of a node's queue, FIFO.
    async fn pop_batch(&self, node: &NodeId, count: usize) -> Result<Vec<String>, Self::Error>;

    /// Current queue length for a node.
    async fn len(&self, node: &NodeId) -> Result<u64, Self::Error>;

    /// Nodes that currently have a queue key.
    async fn queued_nodes(&self) -> Result<Vec<NodeId>, Self::Error>;

    /// Record a completed flush: bump `totalRecords` by `count`, stamp
    /// `lastFlush`, refresh the TTL on the metrics hash.
    async fn record_flush(
        &self,
        node: &NodeId,
        count: u64,
        now_ms: i64,
    ) -> Result<(), Self::Error>;

    /// Metrics hash for a node, if one exists.
    async fn metrics(&self, node: &NodeId) -> Result<Option<QueueMetrics>, Self::Error>;

    /// Park a batch that could not be written to the series store.
    async fn push_dead_letter(
        &self,
        node: &NodeId,
        entries: Vec<String>,
    ) -> Result<(), Self::Error>;
}
