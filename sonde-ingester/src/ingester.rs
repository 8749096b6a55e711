//! The batch ingester: drains the per-node durable queues, allocates
//! gap-free sequence ranges and bulk writes records into the series store.
//!
//! One drain loop runs per queued node, guarded by a process-local
//! in-flight set so sequence allocation and insertion for a node are never
//! concurrent within this process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use sonde_core::{
    now_ms, NodeId, Reading, Record, BATCH_SIZE, DISCOVERY_INTERVAL_MS, FLUSH_INTERVAL_MS,
    INGEST_POLL_MS,
};
use sonde_store::{ReadingQueue, SeriesStore};

/// Drain-loop tuning. Production runs the defaults; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct IngesterSettings {
    /// Target batch size; a queue at or above this flushes immediately.
    pub batch_size: usize,
    /// One-shot deadline armed when a short queue is first observed.
    pub flush_interval: Duration,
    /// Recheck period inside a drain loop.
    pub poll_interval: Duration,
    /// Period of the queue-key discovery scan.
    pub discovery_interval: Duration,
}

impl Default for IngesterSettings {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            flush_interval: Duration::from_millis(FLUSH_INTERVAL_MS),
            poll_interval: Duration::from_millis(INGEST_POLL_MS),
            discovery_interval: Duration::from_millis(DISCOVERY_INTERVAL_MS),
        }
    }
}

#[derive(Clone)]
pub struct Ingester<Q, S> {
    queue: Q,
    series: S,
    settings: IngesterSettings,
    active: Arc<Mutex<HashSet<NodeId>>>,
    /// Tracks the spawned drain loops so shutdown can wait for them.
    drains: TaskTracker,
}

impl<Q, S> Ingester<Q, S>
where
    Q: ReadingQueue,
    S: SeriesStore,
{
    pub fn new(queue: Q, series: S, settings: IngesterSettings) -> Self {
        Self {
            queue,
            series,
            settings,
            active: Arc::new(Mutex::new(HashSet::new())),
            drains: TaskTracker::new(),
        }
    }

    /// Discovery loop: every scan period, start a drain loop for any
    /// queued node that does not already have one.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Batch ingester started");
        let mut ticker = interval(self.settings.discovery_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Batch ingester shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let nodes = match self.queue.queued_nodes().await {
                        Ok(nodes) => nodes,
                        Err(e) => {
                            warn!(error = %e, "Queue discovery failed");
                            continue;
                        }
                    };

                    for node in nodes {
                        if self.claim(&node).await {
                            let worker = self.clone();
                            let cancel = cancel.clone();
                            self.drains.spawn(async move {
                                worker.drain_node(node, cancel).await;
                            });
                        }
                    }
                }
            }
        }

        // Drain loops observe the cancellation at their next suspension
        // point; an in-flight flush still runs to completion.
        self.drains.close();
        self.drains.wait().await;
        info!("All drain loops finished");
    }

    /// Returns true when the node was not already claimed by a drain loop.
    async fn claim(&self, node: &NodeId) -> bool {
        self.active.lock().await.insert(node.clone())
    }

    async fn release(&self, node: &NodeId) {
        self.active.lock().await.remove(node);
    }

    /// Exclusive per-node loop. Runs until the queue is observed empty,
    /// then releases the node for a later discovery pass.
    async fn drain_node(&self, node: NodeId, cancel: CancellationToken) {
        debug!(node_id = %node, "Drain loop started");
        // One-shot deadline, armed when a short queue is first observed
        // and cleared by any flush.
        let mut flush_at: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let len = match self.queue.len(&node).await {
                Ok(len) => len,
                Err(e) => {
                    warn!(node_id = %node, error = %e, "Queue length check failed");
                    if wait(&cancel, self.settings.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if len == 0 {
                break;
            }

            let deadline_lapsed = flush_at.is_some_and(|at| Instant::now() >= at);
            if len as usize >= self.settings.batch_size || deadline_lapsed {
                let progressed = self.flush_batch(&node, len).await;
                flush_at = None;
                if !progressed && wait(&cancel, self.settings.poll_interval).await {
                    break;
                }
                continue;
            }

            if flush_at.is_none() {
                flush_at = Some(Instant::now() + self.settings.flush_interval);
            }
            if wait(&cancel, self.settings.poll_interval).await {
                break;
            }
        }

        self.release(&node).await;
        debug!(node_id = %node, "Drain loop finished");
    }

    /// Pop, sequence and persist one batch. Returns whether the queue
    /// shrank, so the caller can back off when it did not.
    async fn flush_batch(&self, node: &NodeId, len: u64) -> bool {
        let take = (len as usize).min(self.settings.batch_size);
        let entries = match self.queue.pop_batch(node, take).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(node_id = %node, error = %e, "Queue pop failed");
                return false;
            }
        };
        if entries.is_empty() {
            return true;
        }

        let mut readings: Vec<Reading> = Vec::with_capacity(entries.len());
        for entry in &entries {
            match serde_json::from_str::<Reading>(entry) {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!(node_id = %node, error = %e, "Dropping malformed queue entry"),
            }
        }
        if readings.is_empty() {
            return true;
        }
        let count = readings.len() as u64;

        // The whole range is allocated in one atomic step before the
        // insert, which keeps sequences dense per node.
        let top = match self.series.allocate_seq(node, count).await {
            Ok(top) => top,
            Err(e) => {
                error!(node_id = %node, count, error = %e, "Sequence allocation failed, parking batch");
                self.dead_letter(node, entries).await;
                return true;
            }
        };
        let seq_base = top - count + 1;

        let records: Vec<Record> = readings
            .into_iter()
            .enumerate()
            .map(|(offset, reading)| Record::from_reading(reading, seq_base + offset as u64))
            .collect();

        match self.series.insert_records(records).await {
            Ok(outcome) => {
                if outcome.duplicates > 0 {
                    warn!(
                        node_id = %node,
                        duplicates = outcome.duplicates,
                        "Duplicate sequences skipped by unordered insert"
                    );
                }
                info!(node_id = %node, count, seq_base, seq_top = top, "Batch written");

                if let Err(e) = self.queue.record_flush(node, count, now_ms()).await {
                    warn!(node_id = %node, error = %e, "Metrics update failed");
                }
            }
            Err(e) => {
                error!(node_id = %node, count, error = %e, "Batch insert failed, parking batch");
                self.dead_letter(node, entries).await;
            }
        }
        true
    }

    /// Last-resort parking of a batch that could not be persisted, so the
    /// operator can replay it.
    async fn dead_letter(&self, node: &NodeId, entries: Vec<String>) {
        if let Err(e) = self.queue.push_dead_letter(node, entries).await {
            error!(node_id = %node, error = %e, "Dead-letter push failed, batch lost");
        }
    }
}

/// Cancellable sleep. Returns true when the token fired.
async fn wait(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(period) => false,
    }
}
