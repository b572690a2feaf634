//! Session lifecycle: numbering, read concern, reaping, session end

use crate::common::*;
use serde_json::json;
use std::time::Duration;
use tessera::{TxnNumber, CONFIG_FILE_NAME};

#[test]
fn older_transaction_number_is_too_old() {
    let cluster = two_shard_cluster();
    let router = cluster.router();
    let lsid = Lsid::new();

    let mut first = router.begin(lsid, ReadConcern::snapshot());
    first.insert(Key::int(1), json!(1)).unwrap();
    first.commit().unwrap();
    let mut second = router.begin(lsid, ReadConcern::snapshot());
    assert_eq!(second.id().txn_number, TxnNumber(2));
    second.insert(Key::int(2), json!(2)).unwrap();

    let stale = TxnId::new(lsid, TxnNumber(1));
    let err = router
        .execute(stale, None, tessera::Statement::Find { key: Key::int(1) })
        .unwrap_err();
    assert!(matches!(err, Error::TransactionTooOld { .. }));
    second.commit().unwrap();
    cluster.shutdown();
}

#[test]
fn newer_transaction_aborts_the_active_one() {
    let cluster = two_shard_cluster();
    let router = cluster.router();
    let lsid = Lsid::new();

    let mut first = router.begin(lsid, ReadConcern::snapshot());
    first.insert(Key::int(3), json!("first")).unwrap();
    let first_id = first.id();
    let mut second = router.begin(lsid, ReadConcern::snapshot());
    second.insert(Key::int(4), json!("second")).unwrap();

    assert!(matches!(
        cluster.shard("a").unwrap().transaction_state(&first_id),
        Some(TxnState::Aborted { .. })
    ));
    assert!(first.commit().is_err());
    second.commit().unwrap();
    assert_eq!(router.find_one(&Key::int(3)).unwrap(), None);
    cluster.shutdown();
}

#[test]
fn changed_read_concern_leaves_only_abort() {
    let cluster = two_shard_cluster();
    let router = cluster.router();
    let mut txn = router.begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(5), json!(5)).unwrap();

    let err = router
        .execute(
            txn.id(),
            Some(ReadConcern::local()),
            tessera::Statement::Find { key: Key::int(5) },
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
    assert!(matches!(txn.commit(), Err(Error::InvalidOptions(_))));
    txn.abort().unwrap();
    assert_eq!(router.find_one(&Key::int(5)).unwrap(), None);
    cluster.shutdown();
}

#[test]
fn reaper_aborts_transactions_past_their_lifetime() {
    let config = ClusterConfig {
        transaction_lifetime_limit_ms: 40,
        ..ClusterConfig::default()
    };
    let cluster = two_shard_builder().config(config).open().unwrap();
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(6), json!(6)).unwrap();
    let id = txn.id();

    let shard = cluster.shard("a").unwrap();
    assert!(wait_until(Duration::from_secs(5), || matches!(
        shard.transaction_state(&id),
        Some(TxnState::Aborted { .. })
    )));
    let err = txn.commit().unwrap_err();
    assert!(err.is_transient(), "unexpected error {:?}", err);
    assert_eq!(cluster.router().find_one(&Key::int(6)).unwrap(), None);
    cluster.shutdown();
}

#[test]
fn reaper_leaves_prepared_transactions_alone() {
    let config = ClusterConfig {
        transaction_lifetime_limit_ms: 20,
        ..ClusterConfig::default()
    };
    let cluster = two_shard_builder().config(config).open().unwrap();
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    txn.insert(Key::int(7), json!(7)).unwrap();
    let id = txn.id();
    let shard = cluster.shard("a").unwrap();
    let prepare_ts = shard.prepare_transaction(&id, None).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    cluster.reap();
    assert!(shard.transaction_state(&id).unwrap().is_prepared());
    shard.commit_transaction(&id, Some(prepare_ts)).unwrap();
    assert_eq!(cluster.router().find_one(&Key::int(7)).unwrap(), Some(json!(7)));
    cluster.shutdown();
}

#[test]
fn end_session_aborts_and_forgets() {
    let cluster = two_shard_cluster();
    let router = cluster.router();
    let lsid = Lsid::new();
    let mut txn = router.begin(lsid, ReadConcern::snapshot());
    txn.insert(Key::int(8), json!(8)).unwrap();
    txn.insert(Key::int(SPLIT + 8), json!(8)).unwrap();
    let id = txn.id();
    assert_eq!(router.session_count(), 1);

    router.end_session(&lsid);
    assert_eq!(router.session_count(), 0);
    for name in ["a", "b"] {
        assert_eq!(cluster.shard(name).unwrap().transaction_state(&id), None);
    }
    assert_eq!(router.find_one(&Key::int(8)).unwrap(), None);

    // The session can be reused from the first transaction number.
    let mut again = router.begin(lsid, ReadConcern::snapshot());
    assert_eq!(again.id().txn_number, TxnNumber(1));
    again.insert(Key::int(8), json!("again")).unwrap();
    again.commit().unwrap();
    cluster.shutdown();
}

#[test]
fn data_directory_gets_a_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = two_shard_builder().path(dir.path()).open().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);
    assert!(path.exists());
    assert_eq!(ClusterConfig::from_file(&path).unwrap(), *cluster.config());
    assert!(dir.path().join("shards").join("a").exists());
    assert!(dir.path().join("coordinator").exists());
    cluster.shutdown();
}
