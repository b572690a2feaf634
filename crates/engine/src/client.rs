//! How routers and coordinators reach shards
//!
//! [`ParticipantClient`] is the command surface a shard exposes to the rest
//! of the cluster. [`LocalParticipant`] calls an in-process [`Shard`];
//! [`FaultyParticipant`] wraps any client and injects failures so retry,
//! recovery and race paths can be driven deterministically.

use crate::command::{StatementReply, StatementRequest};
use crate::shard::Shard;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tessera_core::{Document, Error, Key, KeyRange, Lsid, Result, ShardId, Timestamp, TxnId};

/// Commands a shard accepts from routers and coordinators
pub trait ParticipantClient: Send + Sync {
    /// Shard behind this client
    fn shard(&self) -> &ShardId;

    /// Run one statement of a transaction
    fn execute(&self, request: &StatementRequest) -> Result<StatementReply>;

    /// prepareTransaction
    fn prepare(&self, txn: &TxnId, cluster_time: Option<Timestamp>) -> Result<Timestamp>;

    /// commitTransaction; `None` commits single-phase
    fn commit(&self, txn: &TxnId, commit_ts: Option<Timestamp>) -> Result<Timestamp>;

    /// abortTransaction
    fn abort(&self, txn: &TxnId, reason: &str) -> Result<()>;

    /// Non-transactional read
    fn find_one(&self, key: &Key, cluster_time: Option<Timestamp>) -> Result<Option<Document>>;

    /// Non-transactional multi-document update of the shard's part of `range`
    fn update_range(&self, range: &KeyRange, set: &Document, cluster_time: Option<Timestamp>) -> Result<usize>;

    /// Forget a session
    fn end_session(&self, lsid: &Lsid);
}

/// Client for a shard in the same process
#[derive(Debug, Clone)]
pub struct LocalParticipant {
    shard: Arc<Shard>,
}

impl LocalParticipant {
    /// Wrap a shard
    pub fn new(shard: Arc<Shard>) -> Self {
        Self { shard }
    }
}

impl ParticipantClient for LocalParticipant {
    fn shard(&self) -> &ShardId {
        self.shard.id()
    }

    fn execute(&self, request: &StatementRequest) -> Result<StatementReply> {
        self.shard.execute(request)
    }

    fn prepare(&self, txn: &TxnId, cluster_time: Option<Timestamp>) -> Result<Timestamp> {
        self.shard.prepare_transaction(txn, cluster_time)
    }

    fn commit(&self, txn: &TxnId, commit_ts: Option<Timestamp>) -> Result<Timestamp> {
        self.shard.commit_transaction(txn, commit_ts)
    }

    fn abort(&self, txn: &TxnId, reason: &str) -> Result<()> {
        self.shard.abort_transaction(txn, reason)
    }

    fn find_one(&self, key: &Key, cluster_time: Option<Timestamp>) -> Result<Option<Document>> {
        self.shard.find_one(key, cluster_time)
    }

    fn update_range(&self, range: &KeyRange, set: &Document, cluster_time: Option<Timestamp>) -> Result<usize> {
        self.shard.update_range(range, set, cluster_time)
    }

    fn end_session(&self, lsid: &Lsid) {
        self.shard.end_session(lsid);
    }
}

/// Command kinds a fault can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Statements
    Execute,
    /// prepareTransaction
    Prepare,
    /// commitTransaction
    Commit,
    /// abortTransaction
    Abort,
    /// Non-transactional reads and updates
    Read,
}

/// One injected failure
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail without reaching the shard
    Fail(Error),
    /// Run the command, then lose the reply
    DropReply,
}

/// Client wrapper that fails queued calls
pub struct FaultyParticipant {
    inner: Arc<dyn ParticipantClient>,
    faults: Mutex<HashMap<Op, VecDeque<Fault>>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl std::fmt::Debug for FaultyParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyParticipant")
            .field("shard", self.inner.shard())
            .field("faults", &*self.faults.lock())
            .finish()
    }
}

impl FaultyParticipant {
    /// Wrap `inner` with no faults queued
    pub fn new(inner: Arc<dyn ParticipantClient>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `fault` for the next call of `op`
    pub fn inject(&self, op: Op, fault: Fault) {
        self.faults.lock().entry(op).or_default().push_back(fault);
    }

    /// Make the next `n` calls of `op` fail with `error`
    pub fn fail_next(&self, op: Op, n: usize, error: Error) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat(Fault::Fail(error)).take(n));
    }

    /// Drop every queued fault for `op`
    pub fn clear(&self, op: Op) {
        self.faults.lock().remove(&op);
    }

    /// Calls of `op` seen so far, faulted or not
    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn intercept<T>(&self, op: Op, call: impl FnOnce() -> Result<T>) -> Result<T> {
        *self.calls.lock().entry(op).or_default() += 1;
        let fault = self.faults.lock().get_mut(&op).and_then(|q| q.pop_front());
        match fault {
            None => call(),
            Some(Fault::Fail(error)) => Err(error),
            Some(Fault::DropReply) => {
                let _ = call();
                Err(Error::HostUnreachable {
                    target: self.inner.shard().to_string(),
                    message: "reply lost".into(),
                })
            }
        }
    }
}

impl ParticipantClient for FaultyParticipant {
    fn shard(&self) -> &ShardId {
        self.inner.shard()
    }

    fn execute(&self, request: &StatementRequest) -> Result<StatementReply> {
        self.intercept(Op::Execute, || self.inner.execute(request))
    }

    fn prepare(&self, txn: &TxnId, cluster_time: Option<Timestamp>) -> Result<Timestamp> {
        self.intercept(Op::Prepare, || self.inner.prepare(txn, cluster_time))
    }

    fn commit(&self, txn: &TxnId, commit_ts: Option<Timestamp>) -> Result<Timestamp> {
        self.intercept(Op::Commit, || self.inner.commit(txn, commit_ts))
    }

    fn abort(&self, txn: &TxnId, reason: &str) -> Result<()> {
        self.intercept(Op::Abort, || self.inner.abort(txn, reason))
    }

    fn find_one(&self, key: &Key, cluster_time: Option<Timestamp>) -> Result<Option<Document>> {
        self.intercept(Op::Read, || self.inner.find_one(key, cluster_time))
    }

    fn update_range(&self, range: &KeyRange, set: &Document, cluster_time: Option<Timestamp>) -> Result<usize> {
        self.intercept(Op::Read, || self.inner.update_range(range, set, cluster_time))
    }

    fn end_session(&self, lsid: &Lsid) {
        self.inner.end_session(lsid);
    }
}

/// Shard id to client lookup shared by routers and the coordinator
#[derive(Default)]
pub struct ShardRegistry {
    clients: DashMap<ShardId, Arc<dyn ParticipantClient>>,
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistry").field("shards", &self.ids()).finish()
    }
}

impl ShardRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the client for its shard
    pub fn register(&self, client: Arc<dyn ParticipantClient>) {
        self.clients.insert(client.shard().clone(), client);
    }

    /// Client for `shard`
    pub fn get(&self, shard: &ShardId) -> Result<Arc<dyn ParticipantClient>> {
        self.clients
            .get(shard)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::ShardNotFound(shard.clone()))
    }

    /// Registered shard ids, sorted
    pub fn ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.clients.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
