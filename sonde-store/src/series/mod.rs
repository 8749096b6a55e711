pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use sonde_core::{NodeId, Record};

/// Inclusive query window over a node's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesRange {
    /// Wall-clock window in milliseconds.
    Ts { from: i64, to: i64 },
    /// Sequence window.
    Seq { from: u64, to: u64 },
}

/// Result of an unordered bulk insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Time-series store plus the per-node sequence counters.
///
/// Sequence ranges are allocated in one atomic step before the insert, so
/// sequences stay dense per node as long as one drain loop owns a node at
/// a time.
#[async_trait]
pub trait SeriesStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically advance a node's counter by `count` and return the new
    /// top value. The allocated range is `top - count + 1 ..= top`.
    async fn allocate_seq(&self, node: &NodeId, count: u64) -> Result<u64, Self::Error>;

    /// Bulk insert with unordered semantics: a duplicate-key conflict is
    /// reported in the outcome and does not abort sibling writes.
    async fn insert_records(&self, records: Vec<Record>) -> Result<InsertOutcome, Self::Error>;

    /// Records inside the window, ordered by sequence ascending, capped by
    /// `limit`.
    async fn query(
        &self,
        node: &NodeId,
        range: SeriesRange,
        limit: usize,
    ) -> Result<Vec<Record>, Self::Error>;

    /// The record with the highest sequence for a node.
    async fn latest(&self, node: &NodeId) -> Result<Option<Record>, Self::Error>;

    /// All records with `seq > last_seq`, ordered by sequence. This is the
    /// sync/replay query dashboards use to fill gaps.
    async fn since_seq(&self, node: &NodeId, last_seq: u64) -> Result<Vec<Record>, Self::Error>;

    /// Number of records stored for a node.
    async fn count(&self, node: &NodeId) -> Result<u64, Self::Error>;
}
