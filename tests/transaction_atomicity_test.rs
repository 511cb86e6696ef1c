//! Transaction Atomicity Tests
//!
//! Tests the invariants around transactions:
//! - All operations of a transaction commit together or not at all
//! - A rejected transaction leaves every table and the checkpoints untouched
//! - Transactions in the same batch are isolated from each other
//! - Later operations see the effects of earlier ones in the same transaction

mod common;

use therapydb::{
    AuditEntry, Bolus, BolusType, Carbs, OpOutcome, Record, RecordId, RecordKind, StoreConfig,
    TemporaryBasal, MINUTE_MS,
};

fn snapshot(path: &std::path::Path) -> Vec<Vec<Record>> {
    [RecordKind::Bolus, RecordKind::Carbs, RecordKind::TemporaryBasal]
        .into_iter()
        .map(|kind| common::raw_rows(path, kind))
        .collect()
}

#[tokio::test]
async fn rejected_transaction_changes_nothing() {
    let (_dir, path) = common::create_temp_db_file("rejected.db");
    let store = common::open_store(&path).await;

    let carbs_id = store
        .insert_or_update(Record::new(0, Carbs::new(30.0)))
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;
    let basal_id = store
        .insert_or_update(Record::new(0, TemporaryBasal::absolute(0.8)).with_duration(60 * MINUTE_MS))
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;
    store.acknowledge(RecordKind::Carbs, carbs_id).await.unwrap();

    let before = snapshot(&path);
    let checkpoint_before = store.checkpoint(RecordKind::Carbs).await.unwrap();

    let mut tx = store.begin_transaction();
    tx.insert_or_update(Record::new(1_000, Bolus::new(4.0, BolusType::Normal)))
        .invalidate(RecordKind::Carbs, carbs_id, AuditEntry::new("CARBS_REMOVED", "User"))
        .update_duration(RecordKind::TemporaryBasal, basal_id, 30 * MINUTE_MS)
        .insert_or_update(Record::new(2_000, Bolus::new(-1.0, BolusType::Normal)));
    assert_eq!(tx.len(), 4);

    let err = tx.submit().await.unwrap_err();
    assert!(err.is_sanity(), "unexpected error {err}");

    assert_eq!(snapshot(&path), before);
    assert_eq!(store.checkpoint(RecordKind::Carbs).await.unwrap(), checkpoint_before);

    store.shutdown().await;
}

#[tokio::test]
async fn committed_transaction_applies_every_operation() {
    let (_dir, path) = common::create_temp_db_file("committed.db");
    let store = common::open_store(&path).await;

    let carbs_id = store
        .insert_or_update(Record::new(0, Carbs::new(30.0)))
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;

    let mut tx = store.begin_transaction();
    tx.insert_or_update(Record::new(1_000, Bolus::new(4.0, BolusType::Normal)))
        .invalidate(RecordKind::Carbs, carbs_id, AuditEntry::new("CARBS_REMOVED", "User"))
        .invalidate(RecordKind::Bolus, RecordId::from_raw(404), AuditEntry::new("BOLUS_REMOVED", "User"));
    let outcome = tx.submit().await.unwrap();

    assert_eq!(outcome.outcomes.len(), 3);
    assert!(matches!(outcome.outcomes[0], OpOutcome::Inserted(_)));
    assert!(matches!(outcome.outcomes[1], OpOutcome::Invalidated(_)));
    // Not found is an outcome, not a failure.
    assert!(outcome.outcomes[2].is_not_found());

    assert_eq!(outcome.changes.inserted.len(), 1);
    assert_eq!(outcome.changes.invalidated.len(), 1);
    assert_eq!(common::raw_rows(&path, RecordKind::Bolus).len(), 1);

    store.shutdown().await;
}

#[tokio::test]
async fn later_operations_see_earlier_ones() {
    let (_dir, path) = common::create_temp_db_file("visibility.db");
    let store = common::open_store(&path).await;

    // Insert under a remote id, then update it by that remote id in the same
    // transaction: the live pointer staged by the first op is visible.
    let mut tx = store.begin_transaction();
    tx.insert_or_update(Record::new(0, Carbs::new(10.0)).with_remote_id("r-1"))
        .insert_or_update(Record::new(0, Carbs::new(12.0)).with_remote_id("r-1"));
    let outcome = tx.submit().await.unwrap();

    let first = outcome.outcomes[0].record().unwrap().id;
    match &outcome.outcomes[1] {
        OpOutcome::Updated(r) => assert_eq!(r.id, first),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(common::raw_rows(&path, RecordKind::Carbs).len(), 2);

    store.shutdown().await;
}

#[tokio::test]
async fn batch_isolates_transactions() {
    let (_dir, path) = common::create_temp_db_file("isolation.db");
    // A long window so all submissions land in one batch.
    let config = StoreConfig {
        batch_timeout_ms: 200,
        ..common::test_config()
    };
    let store = common::open_store_with(&path, config, Default::default()).await;

    let mut handles = Vec::new();
    for i in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let amount = if i % 2 == 0 { i as f64 } else { f64::NAN };
            let mut tx = store.begin_transaction();
            tx.insert_or_update(Record::new(i * 1_000, Carbs::new(amount)))
                .insert_or_update(Record::new(i * 1_000, Bolus::new(1.0, BolusType::Normal)));
            tx.submit().await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(e.is_sanity()),
        }
    }
    assert_eq!(ok, 3);

    let carbs = common::raw_rows(&path, RecordKind::Carbs);
    let bolus = common::raw_rows(&path, RecordKind::Bolus);
    assert_eq!(carbs.len(), 3);
    assert_eq!(bolus.len(), 3);
    // Each surviving transaction wrote both rows at the same timestamp.
    let mut carb_times: Vec<i64> = carbs.iter().map(|r| r.timestamp_ms).collect();
    let mut bolus_times: Vec<i64> = bolus.iter().map(|r| r.timestamp_ms).collect();
    carb_times.sort_unstable();
    bolus_times.sort_unstable();
    assert_eq!(carb_times, bolus_times);

    store.shutdown().await;
}

#[tokio::test]
async fn concurrent_edits_last_commit_wins() {
    let (_dir, path) = common::create_temp_db_file("last_wins.db");
    let store = common::open_store(&path).await;

    let id = store
        .insert_or_update(Record::new(0, Carbs::new(1.0)).with_remote_id("shared"))
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;

    let mut tasks = Vec::new();
    for amount in [2.0, 3.0, 4.0] {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .insert_or_update(Record::new(0, Carbs::new(amount)).with_remote_id("shared"))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // One live row; every losing value is preserved in history.
    let history = store.history_of(RecordKind::Carbs, id).await.unwrap();
    assert_eq!(history.len(), 3);
    let live = store.find_current_by_id(RecordKind::Carbs, id).await.unwrap().unwrap();
    let mut seen: Vec<f64> = history
        .iter()
        .chain(std::iter::once(&live))
        .map(|r| r.payload.as_carbs().unwrap().amount)
        .collect();
    seen.sort_by(f64::total_cmp);
    assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0]);

    store.shutdown().await;
}
