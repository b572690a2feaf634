//! Range migrations interleaved with transactions

use crate::common::*;
use serde_json::json;
use std::time::Duration;
use tessera::{CommandKind, ErrorLabel, MigrationKind};

fn moving() -> KeyRange {
    KeyRange::new(Key::int(10), Key::int(20))
}

#[test]
fn migration_waits_for_prepared_transaction() {
    let cluster = two_shard_cluster();
    let donor = cluster.shard("a").unwrap();
    let recipient = cluster.shard("b").unwrap();

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.update(Key::int(15), json!({"v": 1}), true).unwrap();
    let id = txn.id();
    let prepare_ts = donor.prepare_transaction(&id, None).unwrap();

    std::thread::scope(|scope| {
        let handle = scope.spawn(|| cluster.move_range(&moving(), "b", MigrationKind::ChunkMigration));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished(), "critical section entered over a prepared transaction");
        assert_eq!(cluster.catalog().version(), 1);

        donor.commit_transaction(&id, Some(prepare_ts)).unwrap();
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.routing_version, 2);
    });

    // The document lives on exactly one shard.
    assert_eq!(recipient.find_one(&Key::int(15), None).unwrap(), Some(json!({"v": 1})));
    assert!(donor.snapshot_range(&moving(), donor.cluster_time()).is_empty());
    assert_eq!(cluster.router().find_one(&Key::int(15)).unwrap(), Some(json!({"v": 1})));
    cluster.shutdown();
}

#[test]
fn migration_gives_up_when_prepared_transaction_lingers() {
    let config = ClusterConfig {
        migration_blocking_timeout_ms: 30,
        ..ClusterConfig::default()
    };
    let cluster = two_shard_builder().config(config).open().unwrap();
    let donor = cluster.shard("a").unwrap();

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(12), json!(12)).unwrap();
    donor.prepare_transaction(&txn.id(), None).unwrap();

    let err = cluster
        .move_range(&moving(), "b", MigrationKind::ChunkMigration)
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));
    assert!(cluster.config().race_policy().accepts(&err));
    assert_eq!(cluster.catalog().version(), 1);
    assert!(donor.interlock().owns(&Key::int(12)));
    assert!(cluster.shard("b").unwrap().snapshot_range(&moving(), donor.cluster_time()).is_empty());
    cluster.shutdown();
}

#[test]
fn in_progress_transaction_cannot_commit_into_a_moved_range() {
    let cluster = two_shard_cluster();
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(12), json!("late")).unwrap();

    cluster
        .move_range(&moving(), "b", MigrationKind::ChunkMigration)
        .unwrap();

    let err = txn.commit().unwrap_err();
    assert!(err.is_stale_ownership());
    assert!(err
        .labels(CommandKind::Commit)
        .contains(&ErrorLabel::TransientTransactionError));
    assert_eq!(cluster.router().find_one(&Key::int(12)).unwrap(), None);
    cluster.shutdown();
}

#[test]
fn stale_router_retries_on_the_new_owner() {
    let cluster = two_shard_cluster();
    let router = cluster.router();
    assert_eq!(router.routing().version(), 1);

    cluster
        .move_range(&moving(), "b", MigrationKind::ChunkMigration)
        .unwrap();
    // The router still routes key 15 to shard "a".
    assert_eq!(router.routing().shard_for(&Key::int(15)).unwrap(), &ShardId::new("a"));

    let mut txn = router.begin(Lsid::new(), ReadConcern::snapshot());
    txn.update(Key::int(15), json!({"moved": true}), true).unwrap();
    txn.update(Key::int(SPLIT + 15), json!({"moved": false}), true).unwrap();
    txn.commit().unwrap();

    assert_eq!(router.routing().version(), 2);
    let recipient = cluster.shard("b").unwrap();
    assert_eq!(recipient.find_one(&Key::int(15), None).unwrap(), Some(json!({"moved": true})));
    assert_eq!(
        recipient.find_one(&Key::int(SPLIT + 15), None).unwrap(),
        Some(json!({"moved": false}))
    );
    cluster.shutdown();
}

#[test]
fn broadcast_update_tolerates_a_concurrent_move() {
    let cluster = two_shard_cluster();
    seed(
        &cluster,
        &[(5, json!({"n": 5})), (15, json!({"n": 15})), (SPLIT + 5, json!({"n": 105}))],
    );
    cluster
        .move_range(&moving(), "b", MigrationKind::ChunkMigration)
        .unwrap();

    // Stale routing sends [min, 100) to "a", which no longer owns all of it.
    // The race policy accepts the refusal and that part is skipped whole.
    let updated = cluster
        .router()
        .update_many(&KeyRange::full(), &json!({"seen": true}))
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(
        cluster.router().find_one(&Key::int(SPLIT + 5)).unwrap(),
        Some(json!({"n": 105, "seen": true}))
    );
    assert_eq!(cluster.router().find_one(&Key::int(5)).unwrap(), Some(json!({"n": 5})));
    cluster.shutdown();
}

#[test]
fn moved_documents_keep_their_commit_timestamps() {
    let cluster = two_shard_cluster();
    let seeded_at = seed(&cluster, &[(15, json!({"v": 1})), (16, json!({"v": 2}))]);
    let mut delete = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    assert!(delete.delete(Key::int(16)).unwrap());
    let deleted_at = delete.commit().unwrap();

    cluster
        .move_range(&moving(), "b", MigrationKind::ChunkMigration)
        .unwrap();

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    assert_eq!(txn.find(Key::int(15)).unwrap(), Some(json!({"v": 1})));
    assert_eq!(txn.find(Key::int(16)).unwrap(), None);
    txn.commit().unwrap();

    let recipient = cluster.shard("b").unwrap();
    let before_seed = Timestamp::from_raw(seeded_at.as_raw() - 1);
    assert_eq!(recipient.store().read_at(&Key::int(15), before_seed), None);
    assert_eq!(recipient.store().read_at(&Key::int(15), seeded_at), Some(json!({"v": 1})));
    assert_eq!(recipient.store().read_at(&Key::int(16), seeded_at), Some(json!({"v": 2})));
    assert_eq!(recipient.store().read_at(&Key::int(16), deleted_at), None);
    cluster.shutdown();
}
