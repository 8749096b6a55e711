use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sonde_core::{NodeId, Record};

use super::{InsertOutcome, SeriesRange, SeriesStore};

/// In-memory series store.
/// Models the unique `(nodeId, seq)` index of the real store: an insert
/// that collides on a sequence is counted as a duplicate and skipped
/// without failing its siblings.
#[derive(Clone, Default)]
pub struct MemorySeriesStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Per-node records, kept ordered by sequence.
    records: HashMap<NodeId, Vec<Record>>,
    counters: HashMap<NodeId, u64>,
}

#[derive(Debug)]
pub enum MemorySeriesError {
    MutexPoisoned(String),
}

impl std::error::Error for MemorySeriesError {}

impl fmt::Display for MemorySeriesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySeriesError::MutexPoisoned(msg) => write!(f, "Mutex poisoned: {}", msg),
        }
    }
}

impl<T> From<PoisonError<T>> for MemorySeriesError {
    fn from(err: PoisonError<T>) -> Self {
        MemorySeriesError::MutexPoisoned(err.to_string())
    }
}

#[async_trait]
impl SeriesStore for MemorySeriesStore {
    type Error = MemorySeriesError;

    async fn allocate_seq(&self, node: &NodeId, count: u64) -> Result<u64, Self::Error> {
        let mut inner = self.inner.lock()?;
        let counter = inner.counters.entry(node.clone()).or_insert(0);
        *counter += count;
        Ok(*counter)
    }

    async fn insert_records(&self, records: Vec<Record>) -> Result<InsertOutcome, Self::Error> {
        let mut inner = self.inner.lock()?;
        let mut outcome = InsertOutcome::default();

        for record in records {
            let stored = inner.records.entry(record.node_id.clone()).or_default();
            match stored.binary_search_by_key(&record.seq, |r| r.seq) {
                Ok(_) => outcome.duplicates += 1,
                Err(pos) => {
                    stored.insert(pos, record);
                    outcome.inserted += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn query(
        &self,
        node: &NodeId,
        range: SeriesRange,
        limit: usize,
    ) -> Result<Vec<Record>, Self::Error> {
        let inner = self.inner.lock()?;
        let Some(stored) = inner.records.get(node) else {
            return Ok(Vec::new());
        };

        Ok(stored
            .iter()
            .filter(|record| match range {
                SeriesRange::Ts { from, to } => record.ts >= from && record.ts <= to,
                SeriesRange::Seq { from, to } => record.seq >= from && record.seq <= to,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest(&self, node: &NodeId) -> Result<Option<Record>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner
            .records
            .get(node)
            .and_then(|stored| stored.last().cloned()))
    }

    async fn since_seq(&self, node: &NodeId, last_seq: u64) -> Result<Vec<Record>, Self::Error> {
        let inner = self.inner.lock()?;
        let Some(stored) = inner.records.get(node) else {
            return Ok(Vec::new());
        };
        Ok(stored
            .iter()
            .filter(|record| record.seq > last_seq)
            .cloned()
            .collect())
    }

    async fn count(&self, node: &NodeId) -> Result<u64, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.records.get(node).map_or(0, |s| s.len() as u64))
    }
}
