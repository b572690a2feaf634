//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::Once;
use std::time::{Duration, Instant};
pub use tessera::{
    Cluster, ClusterBuilder, ClusterConfig, Document, Error, Key, KeyRange, Lsid, ReadConcern, ShardId, Timestamp,
    TxnId, TxnState,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a tracing subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Key boundary between shard "a" and shard "b".
pub const SPLIT: i64 = 100;

/// Config with fsync on every record.
pub fn always_config() -> ClusterConfig {
    ClusterConfig {
        durability: "always".to_string(),
        ..ClusterConfig::default()
    }
}

/// Shard "a" owns keys below [`SPLIT`], shard "b" the rest.
pub fn two_shard_builder() -> ClusterBuilder {
    init_tracing();
    Cluster::builder()
        .shard("a", vec![KeyRange::new(Key::min(), Key::int(SPLIT))])
        .shard("b", vec![KeyRange::from(Key::int(SPLIT))])
}

/// In-memory two-shard cluster.
pub fn two_shard_cluster() -> Cluster {
    two_shard_builder().open().expect("open cluster")
}

/// In-memory two-shard cluster with fault injectors in front of both shards.
pub fn faulty_cluster() -> Cluster {
    two_shard_builder()
        .with_fault_injection()
        .open()
        .expect("open cluster")
}

// ============================================================================
// Persistent cluster
// ============================================================================

/// Two-shard cluster in a temp directory that can be closed and reopened.
pub struct TestCluster {
    pub cluster: Option<Cluster>,
    pub dir: TempDir,
    pub faults: bool,
}

impl TestCluster {
    pub fn new(faults: bool) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cluster = Self::open_at(&dir, faults);
        TestCluster {
            cluster: Some(cluster),
            dir,
            faults,
        }
    }

    fn open_at(dir: &TempDir, faults: bool) -> Cluster {
        let builder = two_shard_builder().path(dir.path()).config(always_config());
        let builder = if faults { builder.with_fault_injection() } else { builder };
        builder.open().expect("open persistent cluster")
    }

    pub fn cluster(&self) -> &Cluster {
        self.cluster.as_ref().expect("cluster is open")
    }

    /// Simulate a process crash: drop every in-memory structure and reopen
    /// from the data directory. The reopened cluster has no fault injection.
    pub fn crash_and_reopen(&mut self) {
        if let Some(cluster) = self.cluster.take() {
            cluster.shutdown();
        }
        self.cluster = Some(Self::open_at(&self.dir, false));
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Commit `docs` in one transaction on a fresh session.
pub fn seed(cluster: &Cluster, docs: &[(i64, Document)]) -> Timestamp {
    let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
    for (key, doc) in docs {
        txn.insert(Key::int(*key), doc.clone()).expect("seed insert");
    }
    txn.commit().expect("seed commit")
}

/// `balance` field of a document.
pub fn balance(doc: &Option<Document>) -> i64 {
    doc.as_ref()
        .and_then(|d| d.get("balance"))
        .and_then(|b| b.as_i64())
        .unwrap_or(0)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn host_unreachable(target: &str) -> Error {
    Error::HostUnreachable {
        target: target.to_string(),
        message: "partitioned".to_string(),
    }
}
