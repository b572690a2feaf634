//! Commit visibility: single-shard and two-shard transactions

use crate::common::*;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tessera::{CommandKind, ErrorLabel, Op};

#[test]
fn single_shard_commit_becomes_visible_outside_the_session() {
    let cluster = two_shard_cluster();
    let router = cluster.router();

    let mut writer = router.begin(Lsid::new(), ReadConcern::snapshot());
    writer.insert(Key::int(1), json!({"_id": 1})).unwrap();

    // Another session does not see the uncommitted insert.
    let mut reader = router.begin(Lsid::new(), ReadConcern::snapshot());
    assert_eq!(reader.find(Key::int(1)).unwrap(), None);
    reader.commit().unwrap();
    assert_eq!(router.find_one(&Key::int(1)).unwrap(), None);

    let ts = writer.commit().unwrap();
    assert!(!ts.is_zero());
    assert_eq!(router.find_one(&Key::int(1)).unwrap(), Some(json!({"_id": 1})));
    cluster.shutdown();
}

#[test]
fn transaction_reads_its_own_writes() {
    let cluster = two_shard_cluster();
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(7), json!({"n": 1})).unwrap();
    assert!(txn.update(Key::int(7), json!({"m": 2}), false).unwrap());
    assert_eq!(txn.find(Key::int(7)).unwrap(), Some(json!({"n": 1, "m": 2})));
    txn.commit().unwrap();
    cluster.shutdown();
}

#[test]
fn duplicate_key_leaves_transaction_usable() {
    let cluster = two_shard_cluster();
    seed(&cluster, &[(3, json!({"v": 0}))]);

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    let err = txn.insert(Key::int(3), json!({"v": 1})).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { .. }));
    assert!(err.labels(CommandKind::Statement).is_empty());

    txn.insert(Key::int(4), json!({"v": 1})).unwrap();
    txn.commit().unwrap();
    assert_eq!(cluster.router().find_one(&Key::int(4)).unwrap(), Some(json!({"v": 1})));
    cluster.shutdown();
}

#[test]
fn two_shard_transfer_keeps_sum_invariant() {
    let cluster = two_shard_cluster();
    let router = cluster.router();
    let (from, to) = (Key::int(1), Key::int(SPLIT + 50));
    seed(&cluster, &[(1, json!({"balance": 1000})), (SPLIT + 50, json!({"balance": 1000}))]);

    let done = AtomicBool::new(false);
    let consistent_reads = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let lsid = Lsid::new();
            for _ in 0..20 {
                loop {
                    let mut txn = router.begin(lsid, ReadConcern::snapshot());
                    let attempt = (|| -> tessera::Result<()> {
                        let a = balance(&txn.find(from.clone())?);
                        let b = balance(&txn.find(to.clone())?);
                        txn.update(from.clone(), json!({"balance": a - 100}), false)?;
                        txn.update(to.clone(), json!({"balance": b + 100}), false)?;
                        txn.commit().map(|_| ())
                    })();
                    match attempt {
                        Ok(()) => break,
                        Err(e) if e.is_transient() || e.is_retryable() => continue,
                        Err(e) => panic!("transfer failed: {}", e),
                    }
                }
            }
            done.store(true, Ordering::SeqCst);
        });

        scope.spawn(|| {
            let lsid = Lsid::new();
            while !done.load(Ordering::SeqCst) {
                let mut txn = router.begin(lsid, ReadConcern::snapshot());
                let read = (|| -> tessera::Result<i64> {
                    let a = balance(&txn.find(from.clone())?);
                    let b = balance(&txn.find(to.clone())?);
                    txn.commit()?;
                    Ok(a + b)
                })();
                match read {
                    Ok(sum) => {
                        assert_eq!(sum, 2000, "reader observed a partial transfer");
                        consistent_reads.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        let _ = txn.abort();
                    }
                }
            }
        });
    });

    let a = balance(&router.find_one(&from).unwrap());
    let b = balance(&router.find_one(&to).unwrap());
    assert_eq!(a, 1000 - 20 * 100);
    assert_eq!(a + b, 2000);
    assert!(consistent_reads.load(Ordering::Relaxed) > 0);
    assert!(cluster.coordinator().metrics().committed >= 20);
    cluster.shutdown();
}

#[test]
fn refused_prepare_aborts_every_participant() {
    let cluster = faulty_cluster();
    cluster
        .faults("b")
        .unwrap()
        .fail_next(Op::Prepare, 1, Error::WriteConflict { key: Key::int(SPLIT + 5) });

    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(5), json!("low")).unwrap();
    txn.insert(Key::int(SPLIT + 5), json!("high")).unwrap();
    let id = txn.id();

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, Error::NoSuchTransaction { .. }));
    assert!(err
        .labels(CommandKind::Commit)
        .contains(&ErrorLabel::TransientTransactionError));

    for name in ["a", "b"] {
        assert!(matches!(
            cluster.shard(name).unwrap().transaction_state(&id),
            Some(TxnState::Aborted { .. })
        ));
    }
    assert_eq!(cluster.router().find_one(&Key::int(5)).unwrap(), None);
    assert_eq!(cluster.router().find_one(&Key::int(SPLIT + 5)).unwrap(), None);
    assert!(wait_until(Duration::from_secs(1), || cluster.coordinator().store().is_empty()));
    cluster.shutdown();
}
