use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sonde_core::NodeId;

use super::{QueueMetrics, ReadingQueue};

/// In-memory queue implementation.
/// Primarily intended for testing and as a reference implementation of
/// the ReadingQueue trait. TTLs are not modeled.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<NodeId, VecDeque<String>>,
    dead_letters: HashMap<NodeId, Vec<String>>,
    metrics: HashMap<NodeId, QueueMetrics>,
}

#[derive(Debug)]
pub enum MemoryQueueError {
    MutexPoisoned(String),
}

impl std::error::Error for MemoryQueueError {}

impl fmt::Display for MemoryQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryQueueError::MutexPoisoned(msg) => write!(f, "Mutex poisoned: {}", msg),
        }
    }
}

impl<T> From<PoisonError<T>> for MemoryQueueError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryQueueError::MutexPoisoned(err.to_string())
    }
}

impl MemoryQueue {
    /// Dead letters parked for a node. Test helper.
    pub fn dead_letters(&self, node: &NodeId) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.dead_letters.get(node).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ReadingQueue for MemoryQueue {
    type Error = MemoryQueueError;

    async fn push_batch(&self, node: &NodeId, entries: Vec<String>) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner
            .queues
            .entry(node.clone())
            .or_default()
            .extend(entries);
        Ok(())
    }

    async fn pop_batch(&self, node: &NodeId, count: usize) -> Result<Vec<String>, Self::Error> {
        let mut inner = self.inner.lock()?;
        let Some(queue) = inner.queues.get_mut(node) else {
            return Ok(Vec::new());
        };
        let take = count.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn len(&self, node: &NodeId) -> Result<u64, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.queues.get(node).map_or(0, |q| q.len() as u64))
    }

    async fn queued_nodes(&self) -> Result<Vec<NodeId>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(node, _)| node.clone())
            .collect())
    }

    async fn record_flush(
        &self,
        node: &NodeId,
        count: u64,
        now_ms: i64,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        let entry = inner.metrics.entry(node.clone()).or_insert(QueueMetrics {
            total_records: 0,
            last_flush: 0,
        });
        entry.total_records += count;
        entry.last_flush = now_ms;
        Ok(())
    }

    async fn metrics(&self, node: &NodeId) -> Result<Option<QueueMetrics>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.metrics.get(node).copied())
    }

    async fn push_dead_letter(
        &self,
        node: &NodeId,
        entries: Vec<String>,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner
            .dead_letters
            .entry(node.clone())
            .or_default()
            .extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    #[tokio::test]
    async fn pop_preserves_fifo_order_across_batches() -> Result<(), MemoryQueueError> {
        let queue = MemoryQueue::default();
        let n = node("A");

        queue
            .push_batch(&n, vec!["1".into(), "2".into()])
            .await?;
        queue.push_batch(&n, vec!["3".into()]).await?;

        assert_eq!(queue.len(&n).await?, 3);
        assert_eq!(queue.pop_batch(&n, 2).await?, vec!["1", "2"]);
        assert_eq!(queue.pop_batch(&n, 10).await?, vec!["3"]);
        assert_eq!(queue.len(&n).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn pop_from_missing_node_is_empty() -> Result<(), MemoryQueueError> {
        let queue = MemoryQueue::default();
        assert!(queue.pop_batch(&node("ghost"), 5).await?.is_empty());
        assert_eq!(queue.len(&node("ghost")).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn discovery_skips_drained_queues() -> Result<(), MemoryQueueError> {
        let queue = MemoryQueue::default();
        queue.push_batch(&node("A"), vec!["x".into()]).await?;
        queue.push_batch(&node("B"), vec!["y".into()]).await?;
        queue.pop_batch(&node("B"), 1).await?;

        let nodes = queue.queued_nodes().await?;
        assert_eq!(nodes, vec![node("A")]);
        Ok(())
    }

    #[tokio::test]
    async fn flush_metrics_accumulate() -> Result<(), MemoryQueueError> {
        let queue = MemoryQueue::default();
        let n = node("A");

        assert_eq!(queue.metrics(&n).await?, None);

        queue.record_flush(&n, 150, 1_000).await?;
        queue.record_flush(&n, 7, 2_000).await?;

        let metrics = queue.metrics(&n).await?.unwrap();
        assert_eq!(metrics.total_records, 157);
        assert_eq!(metrics.last_flush, 2_000);
        Ok(())
    }

    #[tokio::test]
    async fn dead_letters_are_kept_apart_from_the_queue() -> Result<(), MemoryQueueError> {
        let queue = MemoryQueue::default();
        let n = node("A");

        queue.push_dead_letter(&n, vec!["bad".into()]).await?;
        assert_eq!(queue.len(&n).await?, 0);
        assert_eq!(queue.dead_letters(&n), vec!["bad"]);
        Ok(())
    }
}
