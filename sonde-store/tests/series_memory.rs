use serde_json::json;
use sonde_core::{Meta, NodeId, Record, Source};
use sonde_store::{InsertOutcome, MemorySeriesStore, SeriesRange, SeriesStore};

fn record(node: &str, seq: u64, ts: i64) -> Record {
    Record {
        node_id: NodeId::from(node),
        seq,
        ts,
        payload: json!({"current": seq}).as_object().cloned().unwrap(),
        meta: Meta {
            source: Source::Esp32,
            raw_device_id: None,
            auto_identified: false,
        },
    }
}

#[tokio::test]
async fn sequence_allocation_is_contiguous() {
    let store = MemorySeriesStore::default();
    let node = NodeId::from("A");

    let top = store.allocate_seq(&node, 150).await.unwrap();
    assert_eq!(top, 150);
    let top = store.allocate_seq(&node, 7).await.unwrap();
    assert_eq!(top, 157);

    // A second node allocates independently.
    let top = store.allocate_seq(&NodeId::from("B"), 3).await.unwrap();
    assert_eq!(top, 3);
}

#[tokio::test]
async fn unordered_insert_skips_duplicates_without_failing_siblings() {
    let store = MemorySeriesStore::default();
    let node = NodeId::from("A");

    let outcome = store
        .insert_records(vec![record("A", 1, 10), record("A", 2, 20)])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InsertOutcome {
            inserted: 2,
            duplicates: 0
        }
    );

    // Replaying one sequence must not block the new one.
    let outcome = store
        .insert_records(vec![record("A", 2, 20), record("A", 3, 30)])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InsertOutcome {
            inserted: 1,
            duplicates: 1
        }
    );

    assert_eq!(store.count(&node).await.unwrap(), 3);
}

#[tokio::test]
async fn query_windows_are_inclusive_and_seq_ordered() {
    let store = MemorySeriesStore::default();
    let node = NodeId::from("A");
    store
        .insert_records((1..=5).map(|seq| record("A", seq, seq as i64 * 100)).collect())
        .await
        .unwrap();

    let by_seq = store
        .query(&node, SeriesRange::Seq { from: 2, to: 4 }, 1000)
        .await
        .unwrap();
    assert_eq!(by_seq.iter().map(|r| r.seq).collect::<Vec<_>>(), [2, 3, 4]);

    let by_ts = store
        .query(&node, SeriesRange::Ts { from: 200, to: 400 }, 1000)
        .await
        .unwrap();
    assert_eq!(by_ts.iter().map(|r| r.seq).collect::<Vec<_>>(), [2, 3, 4]);

    let capped = store
        .query(&node, SeriesRange::Seq { from: 1, to: u64::MAX }, 2)
        .await
        .unwrap();
    assert_eq!(capped.iter().map(|r| r.seq).collect::<Vec<_>>(), [1, 2]);
}

#[tokio::test]
async fn latest_returns_the_highest_sequence() {
    let store = MemorySeriesStore::default();
    let node = NodeId::from("A");

    assert!(store.latest(&node).await.unwrap().is_none());

    store
        .insert_records(vec![record("A", 2, 20), record("A", 1, 10)])
        .await
        .unwrap();
    let latest = store.latest(&node).await.unwrap().unwrap();
    assert_eq!(latest.seq, 2);
}

#[tokio::test]
async fn since_seq_fills_the_gap_exactly() {
    let store = MemorySeriesStore::default();
    let node = NodeId::from("A");
    store
        .insert_records((1..=10).map(|seq| record("A", seq, seq as i64)).collect())
        .await
        .unwrap();

    let replay = store.since_seq(&node, 6).await.unwrap();
    assert_eq!(replay.iter().map(|r| r.seq).collect::<Vec<_>>(), [7, 8, 9, 10]);

    // Replay from zero is the full dense prefix.
    let all = store.since_seq(&node, 0).await.unwrap();
    assert_eq!(all.len(), 10);
    assert!(all.windows(2).all(|w| w[1].seq == w[0].seq + 1));
}

#[tokio::test]
async fn nodes_do_not_cross_contaminate() {
    let store = MemorySeriesStore::default();
    store
        .insert_records(vec![record("A", 1, 1), record("B", 1, 1), record("B", 2, 2)])
        .await
        .unwrap();

    assert_eq!(store.count(&NodeId::from("A")).await.unwrap(), 1);
    assert_eq!(store.count(&NodeId::from("B")).await.unwrap(), 2);
    let b = store.since_seq(&NodeId::from("B"), 0).await.unwrap();
    assert!(b.iter().all(|r| r.node_id.as_str() == "B"));
}
