//! Protocol properties: decisions, timestamps, prepare conflicts

use crate::common::*;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use tessera::{Decision, Op};

#[test]
fn commit_decision_is_idempotent() {
    let cluster = two_shard_cluster();
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(1), json!(1)).unwrap();
    txn.insert(Key::int(SPLIT + 1), json!(1)).unwrap();
    let id = txn.id();

    let first = txn.commit().unwrap();
    assert_eq!(txn.commit().unwrap(), first);
    assert_eq!(
        cluster.coordinator().decision_of(&id),
        Some(Decision::Commit {
            commit_timestamp: first
        })
    );

    // Participants acknowledge the same decision again.
    for name in ["a", "b"] {
        let shard = cluster.shard(name).unwrap();
        assert_eq!(shard.commit_transaction(&id, Some(first)).unwrap(), first);
    }
    cluster.shutdown();
}

#[test]
fn participants_commit_at_the_same_timestamp() {
    let cluster = two_shard_cluster();
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(2), json!(2)).unwrap();
    txn.insert(Key::int(SPLIT + 2), json!(2)).unwrap();
    let id = txn.id();
    let ts = txn.commit().unwrap();

    for name in ["a", "b"] {
        match cluster.shard(name).unwrap().transaction_state(&id) {
            Some(TxnState::Committed {
                commit_timestamp,
                was_prepared,
            }) => {
                assert_eq!(commit_timestamp, ts);
                assert!(was_prepared);
            }
            other => panic!("shard {} not committed: {:?}", name, other),
        }
    }
    assert!(cluster.router().cluster_time() >= ts);
    cluster.shutdown();
}

#[test]
fn read_of_prepared_key_waits_for_the_decision() {
    let cluster = two_shard_cluster();
    seed(&cluster, &[(5, json!({"v": 0}))]);
    let shard = cluster.shard("a").unwrap();

    let mut writer = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    writer.update(Key::int(5), json!({"v": 1}), false).unwrap();
    let id = writer.id();
    let prepare_ts = shard.prepare_transaction(&id, None).unwrap();

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut txn = cluster
                .router()
                .begin(Lsid::new(), ReadConcern::snapshot_at(prepare_ts));
            let seen = txn.find(Key::int(5));
            let _ = txn.commit();
            seen
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(!reader.is_finished(), "read went past a prepared write");

        shard.commit_transaction(&id, Some(prepare_ts)).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), Some(json!({"v": 1})));
    });
    cluster.shutdown();
}

#[test]
fn read_below_prepare_timestamp_does_not_wait() {
    let cluster = two_shard_cluster();
    let before = seed(&cluster, &[(6, json!({"v": 0}))]);
    let shard = cluster.shard("a").unwrap();

    let mut writer = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    writer.update(Key::int(6), json!({"v": 1}), false).unwrap();
    shard.prepare_transaction(&writer.id(), None).unwrap();

    let mut reader = cluster.router().begin(Lsid::new(), ReadConcern::snapshot_at(before));
    assert_eq!(reader.find(Key::int(6)).unwrap(), Some(json!({"v": 0})));
    cluster.shutdown();
}

#[test]
fn write_to_prepared_key_waits_for_the_decision() {
    let cluster = two_shard_cluster();
    seed(&cluster, &[(8, json!({"v": 0}))]);
    let shard = cluster.shard("a").unwrap();

    let mut first = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    first.update(Key::int(8), json!({"by": "first"}), false).unwrap();
    let id = first.id();
    shard.prepare_transaction(&id, None).unwrap();

    std::thread::scope(|scope| {
        let second = scope.spawn(|| {
            let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::local());
            txn.update(Key::int(8), json!({"by": "second"}), false)?;
            txn.commit()
        });
        std::thread::sleep(Duration::from_millis(100));
        assert!(!second.is_finished(), "write went past a prepared write");

        shard.abort_transaction(&id, "test").unwrap();
        second.join().unwrap().unwrap();
    });
    assert_eq!(cluster.router().find_one(&Key::int(8)).unwrap(), Some(json!({"v": 0, "by": "second"})));
    cluster.shutdown();
}

#[test]
fn scan_spans_shards_in_key_order() {
    let cluster = two_shard_cluster();
    seed(
        &cluster,
        &[(SPLIT + 1, json!("b1")), (1, json!("a1")), (SPLIT - 1, json!("a99"))],
    );
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    let docs = txn.scan(KeyRange::full()).unwrap();
    let keys: Vec<Key> = docs.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![Key::int(1), Key::int(SPLIT - 1), Key::int(SPLIT + 1)]);
    txn.commit().unwrap();
    cluster.shutdown();
}

#[test]
fn retried_prepare_votes_once() {
    let cluster = faulty_cluster();
    cluster
        .faults("a")
        .unwrap()
        .fail_next(Op::Prepare, 2, host_unreachable("a"));
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(9), json!(9)).unwrap();
    txn.insert(Key::int(SPLIT + 9), json!(9)).unwrap();
    txn.commit().unwrap();
    assert_eq!(cluster.faults("a").unwrap().calls(Op::Prepare), 3);
    assert_eq!(cluster.router().find_one(&Key::int(9)).unwrap(), Some(json!(9)));
    cluster.shutdown();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn commit_timestamps_increase(keys in prop::collection::vec(0i64..2 * SPLIT, 1..12)) {
        let cluster = two_shard_cluster();
        let router = cluster.router();
        let lsid = Lsid::new();
        let mut last = Timestamp::ZERO;
        for (i, key) in keys.iter().enumerate() {
            let mut txn = router.begin(lsid, ReadConcern::snapshot());
            txn.update(Key::int(*key), json!({"i": i}), true).unwrap();
            if i % 3 == 0 {
                // Every third transaction spans both shards.
                let other = (*key + SPLIT) % (2 * SPLIT);
                txn.update(Key::int(other), json!({"i": i}), true).unwrap();
            }
            let ts = txn.commit().unwrap();
            prop_assert!(ts > last, "commit {} at {} not after {}", i, ts, last);
            last = ts;
        }
        prop_assert!(router.cluster_time() >= last);
        cluster.shutdown();
    }
}
