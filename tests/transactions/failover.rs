//! Prepare, then lose the coordinator: the successor finishes the decision

use crate::common::*;
use serde_json::json;
use std::time::Duration;
use tessera::{CommandKind, Decision, ErrorLabel, Op};

#[test]
fn decided_commit_survives_coordinator_restart() {
    let mut tc = TestCluster::new(true);
    let id = {
        let cluster = tc.cluster();
        cluster
            .faults("b")
            .unwrap()
            .fail_next(Op::Commit, 10_000, host_unreachable("b"));

        let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
        txn.insert(Key::int(1), json!({"side": "a"})).unwrap();
        txn.insert(Key::int(SPLIT + 1), json!({"side": "b"})).unwrap();
        let id = txn.id();

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| txn.commit());
            assert!(wait_until(Duration::from_secs(5), || {
                cluster.faults("b").unwrap().calls(Op::Commit) >= 2
            }));
            cluster.coordinator().step_down();
            let err = handle.join().unwrap().unwrap_err();
            assert!(err.is_retryable());
            assert!(err
                .labels(CommandKind::Commit)
                .contains(&ErrorLabel::UnknownTransactionCommitResult));
        });

        let doc = cluster.coordinator().store().get(&id).unwrap();
        assert!(doc.decision.unwrap().is_commit());
        assert!(cluster
            .shard("b")
            .unwrap()
            .transaction_state(&id)
            .unwrap()
            .is_prepared());
        id
    };

    tc.crash_and_reopen();
    let cluster = tc.cluster();
    assert!(cluster.coordinator().store().is_empty());
    assert_eq!(cluster.coordinator().metrics().recovered, 1);
    for name in ["a", "b"] {
        assert!(matches!(
            cluster.shard(name).unwrap().transaction_state(&id),
            Some(TxnState::Committed { .. })
        ));
    }
    let router = cluster.router();
    assert_eq!(router.find_one(&Key::int(1)).unwrap(), Some(json!({"side": "a"})));
    assert_eq!(router.find_one(&Key::int(SPLIT + 1)).unwrap(), Some(json!({"side": "b"})));
}

#[test]
fn undecided_document_aborts_after_restart() {
    let mut tc = TestCluster::new(false);
    let id = {
        let cluster = tc.cluster();
        let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
        txn.insert(Key::int(2), json!(2)).unwrap();
        txn.insert(Key::int(SPLIT + 2), json!(2)).unwrap();
        let id = txn.id();

        // Crash after the document was persisted and one shard prepared.
        cluster.shard("a").unwrap().prepare_transaction(&id, None).unwrap();
        let store = cluster.coordinator().store();
        let term = store.term().current();
        store
            .create(term, id, vec![ShardId::new("a"), ShardId::new("b")], Vec::new())
            .unwrap();
        id
    };

    tc.crash_and_reopen();
    let cluster = tc.cluster();
    assert!(matches!(
        cluster.shard("a").unwrap().transaction_state(&id),
        Some(TxnState::Aborted { .. })
    ));
    assert!(cluster.coordinator().store().is_empty());
    assert_eq!(cluster.router().find_one(&Key::int(2)).unwrap(), None);
    assert_eq!(cluster.router().find_one(&Key::int(SPLIT + 2)).unwrap(), None);

    // The aborted prepare released its key.
    let mut next = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    next.insert(Key::int(2), json!("again")).unwrap();
    next.commit().unwrap();
    assert_eq!(cluster.router().find_one(&Key::int(2)).unwrap(), Some(json!("again")));
}

#[test]
fn retried_commit_after_failover_returns_the_same_decision() {
    let cluster = faulty_cluster();
    cluster
        .faults("a")
        .unwrap()
        .fail_next(Op::Commit, 10_000, host_unreachable("a"));

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(3), json!(3)).unwrap();
    txn.insert(Key::int(SPLIT + 3), json!(3)).unwrap();
    let id = txn.id();

    std::thread::scope(|scope| {
        let handle = scope.spawn(|| txn.commit());
        assert!(wait_until(Duration::from_secs(5), || {
            cluster.faults("a").unwrap().calls(Op::Commit) >= 2
        }));
        cluster.coordinator().step_down();
        assert!(handle.join().unwrap().is_err());
    });

    cluster.faults("a").unwrap().clear(Op::Commit);
    assert_eq!(cluster.fail_over_coordinator(), 1);
    let decided = match cluster.coordinator().decision_of(&id) {
        Some(Decision::Commit { commit_timestamp }) => commit_timestamp,
        other => panic!("expected a commit decision, got {:?}", other),
    };

    // The client retries commitTransaction and learns the stored outcome.
    assert_eq!(txn.commit().unwrap(), decided);
    assert_eq!(txn.commit().unwrap(), decided);
    assert_eq!(cluster.router().find_one(&Key::int(3)).unwrap(), Some(json!(3)));
    cluster.shutdown();
}

#[test]
fn stepped_down_coordinator_refuses_new_commits() {
    let cluster = two_shard_cluster();
    cluster.coordinator().step_down();

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(4), json!(4)).unwrap();
    txn.insert(Key::int(SPLIT + 4), json!(4)).unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, Error::NotWritablePrimary(_)));

    // Once a new primary is up the same commit goes through.
    cluster.coordinator().step_up();
    txn.commit().unwrap();
    assert_eq!(cluster.router().find_one(&Key::int(SPLIT + 4)).unwrap(), Some(json!(4)));
    cluster.shutdown();
}

#[test]
fn prepare_keeps_retrying_past_attempt_limit() {
    let config = ClusterConfig {
        retry: tessera::RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_attempts: 10,
        },
        ..ClusterConfig::default()
    };
    let cluster = two_shard_builder().config(config).with_fault_injection().open().unwrap();
    cluster
        .faults("a")
        .unwrap()
        .fail_next(Op::Prepare, 15, host_unreachable("a"));

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(3), json!({"v": 1})).unwrap();
    txn.insert(Key::int(SPLIT + 3), json!({"v": 1})).unwrap();
    let ts = txn.commit().unwrap();

    assert_eq!(cluster.faults("a").unwrap().calls(Op::Prepare), 16);
    for name in ["a", "b"] {
        assert_eq!(
            cluster.shard(name).unwrap().transaction_state(&txn.id()),
            Some(TxnState::Committed {
                commit_timestamp: ts,
                was_prepared: true
            })
        );
    }
    assert_eq!(cluster.router().find_one(&Key::int(3)).unwrap(), Some(json!({"v": 1})));
    cluster.shutdown();
}
