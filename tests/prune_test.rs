//! Sweep behavior against a real store: audit completeness, safety,
//! cancellation, and the daemon driver.

use std::time::Duration;

use chrono::Utc;
use mnemon::config::{EngineConfig, PruneThresholds};
use mnemon::model::{Category, NewMemoryItem, PruneReason};
use mnemon::prune::{CancelFlag, PruneDaemon, Pruner, PrunerState};
use mnemon::{Engine, ItemStore, SqliteStore};

const DIM: usize = 2;

/// Thresholds with no age floor, so freshly inserted items are sweepable
/// in tests.
fn eager_thresholds() -> PruneThresholds {
    PruneThresholds {
        min_age_days: 0.0,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Eviction and audit
// ---------------------------------------------------------------------------

#[test]
fn expired_items_are_evicted_with_audit_records() {
    let mut store = SqliteStore::in_memory(DIM).unwrap();
    let expired = store
        .insert(
            NewMemoryItem::new(Category::Turn, vec![1.0, 0.0], "stale")
                .expires_at(Utc::now() - chrono::Duration::hours(1)),
        )
        .unwrap();
    store
        .insert(
            NewMemoryItem::new(Category::Turn, vec![0.0, 1.0], "live")
                .salience(0.9)
                .expires_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .unwrap();

    let mut pruner = Pruner::new(store, eager_thresholds());
    let report = pruner.sweep(&CancelFlag::new()).unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.evicted, 1);
    assert_eq!(report.retained, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(pruner.state(), PrunerState::Idle);

    let audit = pruner.store().audit_since(0).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].item_id, expired.id);
    assert_eq!(audit[0].reason, PruneReason::Expired);
    assert_eq!(audit[0].snapshot.lexical_text, "stale");
}

#[test]
fn every_eviction_leaves_exactly_one_audit_record() {
    let mut store = SqliteStore::in_memory(DIM).unwrap();

    let mut doomed = Vec::new();
    for i in 0..3 {
        let item = store
            .insert(
                NewMemoryItem::new(Category::Turn, vec![1.0, i as f32], "doomed")
                    .expires_at(Utc::now() - chrono::Duration::minutes(1)),
            )
            .unwrap();
        doomed.push(item.id);
    }
    store
        .insert(NewMemoryItem::new(Category::Summary, vec![0.0, 1.0], "keep").salience(0.9))
        .unwrap();

    let mut pruner = Pruner::new(store, eager_thresholds());
    let report = pruner.sweep(&CancelFlag::new()).unwrap();
    assert_eq!(report.evicted, 3);

    let store = pruner.into_store();
    let audit = store.audit_since(0).unwrap();
    assert_eq!(audit.len(), 3);
    for id in &doomed {
        let matching: Vec<_> = audit.iter().filter(|r| r.item_id == *id).collect();
        assert_eq!(matching.len(), 1, "expected exactly one record for {id}");
        assert_eq!(matching[0].reason, PruneReason::Expired);
        assert_eq!(matching[0].snapshot.lexical_text, "doomed");
        assert!(store.get(*id).is_err(), "evicted item still present");
    }
    assert_eq!(store.count_items().unwrap(), 1);
}

#[test]
fn audit_sequence_is_monotonic() {
    let mut store = SqliteStore::in_memory(DIM).unwrap();
    for i in 0..4 {
        let item = store
            .insert(
                NewMemoryItem::new(Category::Turn, vec![i as f32, 1.0], "x")
                    .expires_at(Utc::now() - chrono::Duration::minutes(1)),
            )
            .unwrap();
        store.evict(&item, PruneReason::Expired).unwrap();
    }

    let audit = store.audit_since(0).unwrap();
    assert_eq!(audit.len(), 4);
    for window in audit.windows(2) {
        assert!(window[1].seq > window[0].seq);
        assert!(window[1].pruned_at >= window[0].pruned_at);
    }

    // audit_since is exclusive of the given seq.
    let tail = store.audit_since(audit[1].seq).unwrap();
    assert_eq!(tail.len(), 2);
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

#[test]
fn future_expiry_and_accessed_items_survive_a_sweep() {
    let mut store = SqliteStore::in_memory(DIM).unwrap();

    // Future expiry: never evicted by the expired rule.
    store
        .insert(
            NewMemoryItem::new(Category::Turn, vec![1.0, 0.0], "future")
                .salience(0.9)
                .expires_at(Utc::now() + chrono::Duration::days(30)),
        )
        .unwrap();

    // Low salience but accessed often enough to be immune to rules 2/3.
    let accessed = store
        .insert(NewMemoryItem::new(Category::Turn, vec![0.0, 1.0], "busy").salience(0.0))
        .unwrap();
    store.touch(&[accessed.id]).unwrap();
    store.touch(&[accessed.id]).unwrap();

    let mut pruner = Pruner::new(store, eager_thresholds());
    let report = pruner.sweep(&CancelFlag::new()).unwrap();

    assert_eq!(report.evicted, 0);
    assert_eq!(report.retained, 2);
}

#[test]
fn recent_items_are_below_the_scan_age_floor() {
    let mut store = SqliteStore::in_memory(DIM).unwrap();
    store
        .insert(NewMemoryItem::new(Category::Turn, vec![1.0, 0.0], "fresh").salience(0.0))
        .unwrap();

    // Default floor is 7 days; a just-inserted item is not even scanned.
    let mut pruner = Pruner::new(store, PruneThresholds::default());
    let report = pruner.sweep(&CancelFlag::new()).unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.evicted, 0);
}

#[test]
fn cancellation_stops_between_items() {
    let mut store = SqliteStore::in_memory(DIM).unwrap();
    for i in 0..5 {
        store
            .insert(
                NewMemoryItem::new(Category::Turn, vec![i as f32, 1.0], "x")
                    .expires_at(Utc::now() - chrono::Duration::minutes(1)),
            )
            .unwrap();
    }

    let cancel = CancelFlag::new();
    cancel.cancel(); // cancelled before the first item boundary

    let mut pruner = Pruner::new(store, eager_thresholds());
    let report = pruner.sweep(&cancel).unwrap();

    assert!(report.cancelled);
    assert_eq!(report.evicted, 0);
    assert_eq!(report.scanned, 5);
}

// ---------------------------------------------------------------------------
// Manual eviction
// ---------------------------------------------------------------------------

#[test]
fn manual_eviction_is_audited_like_any_other() {
    let store = SqliteStore::in_memory(DIM).unwrap();
    let mut engine = Engine::new(store, EngineConfig::default());

    let item = engine
        .insert(NewMemoryItem::new(Category::Turn, vec![1.0, 0.0], "remove me"))
        .unwrap();

    engine.evict_manual(item.id).unwrap();

    assert!(engine.get(item.id).is_err());
    let audit = engine.audit_since(0).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].item_id, item.id);
    assert_eq!(audit[0].reason, PruneReason::Manual);
}

#[test]
fn manual_eviction_of_missing_item_is_not_found() {
    let store = SqliteStore::in_memory(DIM).unwrap();
    let mut engine = Engine::new(store, EngineConfig::default());
    let ghost = mnemon::ItemId::new();
    assert!(engine.evict_manual(ghost).is_err());
    assert!(engine.audit_since(0).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[tokio::test]
async fn daemon_sweeps_on_its_interval_and_shuts_down() {
    mnemon::telemetry::init_for_tests();

    let mut store = SqliteStore::in_memory(DIM).unwrap();
    store
        .insert(
            NewMemoryItem::new(Category::Turn, vec![1.0, 0.0], "stale")
                .expires_at(Utc::now() - chrono::Duration::minutes(1)),
        )
        .unwrap();

    let daemon = PruneDaemon::new(store, eager_thresholds(), Duration::from_millis(20));
    let handle = daemon.handle();
    let task = tokio::spawn(daemon.run());

    // Give the daemon a few ticks to sweep; in-memory stores are owned by
    // the daemon, so observe completion via the task lifecycle only.
    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.shutdown();

    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("daemon did not shut down")
        .expect("daemon task panicked");
}
