use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use sonde_core::{Meta, NodeId, Reading, Source};
use sonde_ingester::{Ingester, IngesterSettings};
use sonde_store::{MemoryQueue, MemorySeriesStore, ReadingQueue, SeriesStore};

fn reading(node: &str, current: i64) -> String {
    serde_json::to_string(&Reading {
        node_id: NodeId::from(node),
        ts: 1_700_000_000_000 + current,
        payload: json!({"current": current}).as_object().cloned().unwrap(),
        meta: Meta {
            source: Source::Esp32,
            raw_device_id: Some(node.to_owned()),
            auto_identified: false,
        },
    })
    .unwrap()
}

fn settings() -> IngesterSettings {
    IngesterSettings {
        batch_size: 150,
        flush_interval: Duration::from_millis(2000),
        poll_interval: Duration::from_millis(500),
        discovery_interval: Duration::from_millis(1000),
    }
}

async fn seed(queue: &MemoryQueue, node: &str, count: usize) {
    let entries = (0..count).map(|i| reading(node, i as i64)).collect();
    queue
        .push_batch(&NodeId::from(node), entries)
        .await
        .unwrap();
}

async fn drained(queue: &MemoryQueue, nodes: &[&str]) -> bool {
    for node in nodes {
        if queue.len(&NodeId::from(*node)).await.unwrap() > 0 {
            return false;
        }
    }
    true
}

async fn assert_dense(series: &MemorySeriesStore, node: &str, expected: u64) {
    let node = NodeId::from(node);
    assert_eq!(series.count(&node).await.unwrap(), expected);
    let records = series.since_seq(&node, 0).await.unwrap();
    for (offset, record) in records.iter().enumerate() {
        assert_eq!(record.seq, offset as u64 + 1, "gap at {}", record.seq);
        assert_eq!(record.node_id, node);
    }
}

/// Readings already queued before the ingester starts are ingested with a
/// dense sequence prefix, the restart-without-loss contract.
#[tokio::test(start_paused = true)]
async fn queued_readings_survive_an_ingester_restart() {
    let queue = MemoryQueue::default();
    let series = MemorySeriesStore::default();
    seed(&queue, "ESP32_A", 200).await;

    let cancel = CancellationToken::new();
    let ingester = Ingester::new(queue.clone(), series.clone(), settings());
    let worker = {
        let ingester = ingester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingester.run(cancel).await })
    };

    while !drained(&queue, &["ESP32_A"]).await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // One more deadline window so the trailing short batch lands.
    tokio::time::sleep(Duration::from_millis(3000)).await;

    cancel.cancel();
    worker.await.unwrap();

    assert_dense(&series, "ESP32_A", 200).await;
    let metrics = queue.metrics(&NodeId::from("ESP32_A")).await.unwrap().unwrap();
    assert_eq!(metrics.total_records, 200);
}

/// Two nodes streaming in parallel each get their own dense sequence.
#[tokio::test(start_paused = true)]
async fn concurrent_nodes_do_not_share_sequences() {
    let queue = MemoryQueue::default();
    let series = MemorySeriesStore::default();

    let cancel = CancellationToken::new();
    let ingester = Ingester::new(queue.clone(), series.clone(), settings());
    let worker = {
        let ingester = ingester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingester.run(cancel).await })
    };

    // Interleaved arrival over several discovery scans.
    for chunk in 0..3 {
        let entries_a = (0..100).map(|i| reading("A", chunk * 100 + i)).collect();
        let entries_b = (0..100).map(|i| reading("B", chunk * 100 + i)).collect();
        queue.push_batch(&NodeId::from("A"), entries_a).await.unwrap();
        queue.push_batch(&NodeId::from("B"), entries_b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
    }

    while !drained(&queue, &["A", "B"]).await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(3000)).await;

    cancel.cancel();
    worker.await.unwrap();

    assert_dense(&series, "A", 300).await;
    assert_dense(&series, "B", 300).await;
}

/// Cancelling mid-drain loses nothing: every reading is still either
/// queued or stored once the worker has returned.
#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_drain_loops_without_losing_readings() {
    let queue = MemoryQueue::default();
    let series = MemorySeriesStore::default();
    seed(&queue, "A", 100).await;

    let cancel = CancellationToken::new();
    let ingester = Ingester::new(queue.clone(), series.clone(), settings());
    let worker = {
        let ingester = ingester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingester.run(cancel).await })
    };

    // Cancel while the drain loop is still inside its flush window.
    tokio::time::sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    worker.await.unwrap();

    let queued = queue.len(&NodeId::from("A")).await.unwrap();
    let stored = series.count(&NodeId::from("A")).await.unwrap();
    assert_eq!(queued + stored, 100);
    assert_dense(&series, "A", stored).await;
}

/// A queue below the batch size is not stuck: the flush deadline moves it.
#[tokio::test(start_paused = true)]
async fn short_queues_flush_within_the_deadline_window() {
    let queue = MemoryQueue::default();
    let series = MemorySeriesStore::default();
    seed(&queue, "A", 7).await;

    let cancel = CancellationToken::new();
    let ingester = Ingester::new(queue.clone(), series.clone(), settings());
    let worker = {
        let ingester = ingester.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { ingester.run(cancel).await })
    };

    // Discovery (1s) + flush deadline (2s) + slack.
    tokio::time::sleep(Duration::from_millis(4000)).await;

    cancel.cancel();
    worker.await.unwrap();

    assert_dense(&series, "A", 7).await;
}
