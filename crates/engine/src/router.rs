//! Session-aware transaction router
//!
//! The router is what clients talk to. For every session it remembers the
//! active transaction: its number, read concern, and the shards it has
//! touched so far. Statements are routed by key through a cached
//! [`RoutingTable`]; the first statement a shard sees carries
//! `startTransaction` and the read concern.
//!
//! Commit picks the cheapest protocol that is still atomic: nothing to do
//! without participants, single-phase on a lone participant, the
//! coordinator otherwise.
//!
//! Cluster time is gossiped: every request carries the largest timestamp
//! the router has seen and every reply raises it, so a transaction that
//! starts after another committed always reads and commits later.
//!
//! [`Router::reap`] aborts uncoordinated transactions that outlive
//! [`SessionLimits::transaction_lifetime_limit`] and forgets finished
//! sessions idle for longer than [`SessionLimits::session_retention`].

use crate::client::ShardRegistry;
use crate::command::{intersect, Statement, StatementRequest, StatementResult, Target};
use crate::config::MigrationRacePolicy;
use crate::coordinator::CoordinatorService;
use crate::retry::RetryPolicy;
use crate::routing::{Catalog, RoutingTable};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_concurrency::ReapStats;
use tessera_core::{
    CancellationToken, Deadline, Decision, Document, Error, ErrorKind, Key, KeyRange, Lsid, ReadConcern,
    ReadConcernLevel, Result, ShardId, Timestamp, TxnId, TxnNumber,
};
use tracing::{debug, info, warn};

/// Statement re-routes allowed after stale-ownership errors
const MAX_STALE_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RouterTxnState {
    Active,
    Committed(Timestamp),
    Aborted(String),
}

/// Router-side view of one transaction
#[derive(Debug)]
struct RouterTxn {
    txn_number: TxnNumber,
    /// Read concern as the client gave it
    requested: Option<ReadConcern>,
    /// Read concern sent to shards (snapshot time pinned)
    effective: ReadConcern,
    /// Touched shards; `true` once a write statement was sent there
    participants: BTreeMap<ShardId, bool>,
    state: RouterTxnState,
    abort_only: bool,
    /// Commit was handed to the coordinator; only it may abort now
    coordinated: bool,
    started_at: Instant,
}

#[derive(Debug)]
struct RouterSession {
    txn: Option<RouterTxn>,
    last_used: Instant,
    removed: bool,
}

type SessionSlot = Arc<Mutex<RouterSession>>;

/// Lifetime bounds the router enforces on its sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Uncoordinated transactions older than this are aborted by the reaper
    pub transaction_lifetime_limit: Duration,
    /// Finished sessions idle for longer are forgotten
    pub session_retention: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            transaction_lifetime_limit: Duration::from_secs(60),
            session_retention: Duration::from_secs(30 * 60),
        }
    }
}

/// Routes transactional and plain commands to shards
pub struct Router {
    catalog: Arc<Catalog>,
    routing: RwLock<Arc<RoutingTable>>,
    registry: Arc<ShardRegistry>,
    coordinator: Arc<CoordinatorService>,
    race_policy: MigrationRacePolicy,
    read_retry: RetryPolicy,
    limits: SessionLimits,
    sessions: DashMap<Lsid, SessionSlot>,
    cluster_time: AtomicU64,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routing_version", &self.routing.read().version())
            .field("sessions", &self.sessions.len())
            .field("cluster_time", &self.cluster_time())
            .finish()
    }
}

impl Router {
    /// Create a router with a routing cache loaded from `catalog`
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ShardRegistry>,
        coordinator: Arc<CoordinatorService>,
        race_policy: MigrationRacePolicy,
    ) -> Self {
        let routing = RwLock::new(catalog.current());
        Self {
            catalog,
            routing,
            registry,
            coordinator,
            race_policy,
            read_retry: RetryPolicy::default(),
            limits: SessionLimits::default(),
            sessions: DashMap::new(),
            cluster_time: AtomicU64::new(0),
        }
    }

    /// Retry policy for non-transactional reads
    pub fn with_read_retry(mut self, retry: RetryPolicy) -> Self {
        self.read_retry = retry;
        self
    }

    /// Bounds applied by [`Router::reap`]
    pub fn with_session_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Largest cluster time seen
    pub fn cluster_time(&self) -> Timestamp {
        Timestamp::from_raw(self.cluster_time.load(Ordering::Acquire))
    }

    fn observe(&self, ts: Timestamp) {
        self.cluster_time.fetch_max(ts.as_raw(), Ordering::AcqRel);
    }

    fn gossip(&self) -> Option<Timestamp> {
        let ts = self.cluster_time();
        (!ts.is_zero()).then_some(ts)
    }

    /// Cached routing table
    pub fn routing(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.routing.read())
    }

    /// Reload the routing table from the catalog
    pub fn refresh(&self) -> u64 {
        let table = self.catalog.current();
        let version = table.version();
        *self.routing.write() = table;
        debug!(target: "tessera::router", version, "Refreshed routing table");
        version
    }

    /// Run `f` on the session's transaction slot, creating the session
    fn with_session<R>(&self, lsid: &Lsid, f: impl FnOnce(&mut Option<RouterTxn>) -> R) -> R {
        loop {
            let slot = Arc::clone(
                self.sessions
                    .entry(*lsid)
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(RouterSession {
                            txn: None,
                            last_used: Instant::now(),
                            removed: false,
                        }))
                    })
                    .value(),
            );
            let mut guard = slot.lock();
            if guard.removed {
                continue;
            }
            guard.last_used = Instant::now();
            return f(&mut guard.txn);
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Run `statement` in transaction `txn`
    ///
    /// `read_concern` belongs on the first statement; a later statement
    /// carrying a different one fails with `InvalidOptions` and the
    /// transaction can then only be aborted.
    pub fn execute(&self, txn: TxnId, read_concern: Option<ReadConcern>, statement: Statement) -> Result<StatementResult> {
        self.with_session(&txn.lsid, |slot| self.execute_in(slot, txn, read_concern, &statement))
    }

    fn execute_in(
        &self,
        slot: &mut Option<RouterTxn>,
        txn: TxnId,
        read_concern: Option<ReadConcern>,
        statement: &Statement,
    ) -> Result<StatementResult> {
        let rt = self.admit(slot, txn, read_concern)?;

        let mut attempt = 0;
        loop {
            let routing = self.routing();
            match self.dispatch(rt, txn, &routing, statement) {
                Ok(result) => return Ok(result),
                Err((e, new_shard)) if e.is_stale_ownership() && new_shard && attempt < MAX_STALE_RETRIES => {
                    attempt += 1;
                    debug!(
                        target: "tessera::router",
                        lsid = %txn.lsid,
                        txn_number = %txn.txn_number,
                        attempt,
                        error = %e,
                        "Retrying statement after routing refresh"
                    );
                    self.refresh();
                }
                Err((e, _)) => {
                    if e.is_stale_ownership() {
                        self.refresh();
                    }
                    if e.kind() != ErrorKind::Statement {
                        let reason = format!("{} failed: {}", statement.name(), e);
                        if let Err(abort_err) = self.abort_participants(rt, txn, &reason) {
                            warn!(
                                target: "tessera::router",
                                lsid = %txn.lsid,
                                txn_number = %txn.txn_number,
                                error = %abort_err,
                                "Implicit abort incomplete"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    fn admit<'a>(
        &self,
        slot: &'a mut Option<RouterTxn>,
        txn: TxnId,
        read_concern: Option<ReadConcern>,
    ) -> Result<&'a mut RouterTxn> {
        let start = match slot.as_mut() {
            Some(rt) if rt.txn_number > txn.txn_number => {
                return Err(Error::TransactionTooOld {
                    lsid: txn.lsid,
                    requested: txn.txn_number,
                    active: rt.txn_number,
                })
            }
            Some(rt) if rt.txn_number == txn.txn_number => {
                match &rt.state {
                    RouterTxnState::Active => {}
                    RouterTxnState::Committed(_) => return Err(Error::TransactionCommitted(txn)),
                    RouterTxnState::Aborted(reason) => {
                        return Err(Error::no_such_transaction(txn, reason.clone()))
                    }
                }
                if read_concern.is_some() && read_concern != rt.requested {
                    rt.abort_only = true;
                    return Err(Error::invalid_options(
                        "readConcern may only be specified on the first statement of a transaction",
                    ));
                }
                if rt.abort_only {
                    return Err(Error::invalid_options("transaction can only be aborted"));
                }
                false
            }
            _ => true,
        };

        if start {
            let mut effective = read_concern.unwrap_or_default();
            effective.validate().map_err(Error::InvalidOptions)?;
            if let Some(previous) = slot.as_mut() {
                if previous.state == RouterTxnState::Active && !previous.participants.is_empty() {
                    let old = TxnId::new(txn.lsid, previous.txn_number);
                    if let Err(e) = self.abort_participants(previous, old, "superseded by a newer transaction") {
                        warn!(
                            target: "tessera::router",
                            lsid = %txn.lsid,
                            txn_number = %old.txn_number,
                            error = %e,
                            "Implicit abort of superseded transaction incomplete"
                        );
                    }
                }
            }
            if effective.level == ReadConcernLevel::Snapshot && effective.at_cluster_time.is_none() {
                effective.at_cluster_time = self.gossip();
            }
            *slot = Some(RouterTxn {
                txn_number: txn.txn_number,
                requested: read_concern,
                effective,
                participants: BTreeMap::new(),
                state: RouterTxnState::Active,
                abort_only: false,
                coordinated: false,
                started_at: Instant::now(),
            });
            debug!(
                target: "tessera::router",
                lsid = %txn.lsid,
                txn_number = %txn.txn_number,
                "Started transaction"
            );
        }
        slot.as_mut()
            .ok_or_else(|| Error::internal("router session vanished while locked"))
    }

    /// Send `statement` to every shard it targets; the flag on error tells
    /// whether the failing shard was new to the transaction
    fn dispatch(
        &self,
        rt: &mut RouterTxn,
        txn: TxnId,
        routing: &RoutingTable,
        statement: &Statement,
    ) -> std::result::Result<StatementResult, (Error, bool)> {
        match statement.target() {
            Target::Key(key) => {
                let shard = routing.shard_for(key).map_err(|e| (e, false))?.clone();
                self.send(rt, txn, &shard, statement.clone())
            }
            Target::Range(range) => {
                let mut docs = Vec::new();
                for chunk in routing.chunks_for_range(range) {
                    let part = statement.restricted_to(&chunk.range);
                    if let StatementResult::Scanned(found) = self.send(rt, txn, &chunk.shard, part)? {
                        docs.extend(found);
                    }
                }
                Ok(StatementResult::Scanned(docs))
            }
        }
    }

    fn send(
        &self,
        rt: &mut RouterTxn,
        txn: TxnId,
        shard: &ShardId,
        statement: Statement,
    ) -> std::result::Result<StatementResult, (Error, bool)> {
        let client = self.registry.get(shard).map_err(|e| (e, false))?;
        let is_new = !rt.participants.contains_key(shard);
        let is_write = statement.is_write();
        let mut request = if is_new {
            StatementRequest::start(txn, rt.effective, statement)
        } else {
            StatementRequest::new(txn, statement)
        };
        request.cluster_time = self.gossip();
        if is_new {
            rt.participants.insert(shard.clone(), false);
        }

        match client.execute(&request) {
            Ok(reply) => {
                self.observe(reply.cluster_time);
                if is_write {
                    rt.participants.insert(shard.clone(), true);
                }
                Ok(reply.result)
            }
            Err(e) => {
                if is_new && e.is_stale_ownership() {
                    rt.participants.remove(shard);
                }
                Err((e, is_new))
            }
        }
    }

    // ========================================================================
    // Commit / abort
    // ========================================================================

    /// commitTransaction; returns the commit timestamp
    ///
    /// Retrying a commit that succeeded returns the same timestamp. Errors
    /// labelled `UnknownTransactionCommitResult` leave the transaction
    /// active so the commit can be retried.
    pub fn commit(&self, txn: TxnId) -> Result<Timestamp> {
        self.with_session(&txn.lsid, |slot| self.commit_in(slot, txn))
    }

    fn commit_in(&self, slot: &mut Option<RouterTxn>, txn: TxnId) -> Result<Timestamp> {
        let rt = Self::current(slot, txn)?;
        match &rt.state {
            RouterTxnState::Committed(ts) => return Ok(*ts),
            RouterTxnState::Aborted(reason) => return Err(Error::no_such_transaction(txn, reason.clone())),
            RouterTxnState::Active => {}
        }
        if rt.abort_only {
            return Err(Error::invalid_options("transaction can only be aborted"));
        }

        let result = match rt.participants.len() {
            0 => Ok(self.cluster_time()),
            1 => {
                let shard = rt.participants.keys().next().cloned();
                match shard {
                    Some(shard) => self.registry.get(&shard).and_then(|c| c.commit(&txn, None)),
                    None => Ok(self.cluster_time()),
                }
            }
            _ => {
                let writers: Vec<ShardId> = rt.participants.iter().filter(|(_, w)| **w).map(|(s, _)| s.clone()).collect();
                let readers: Vec<ShardId> = rt.participants.iter().filter(|(_, w)| !**w).map(|(s, _)| s.clone()).collect();
                rt.coordinated = true;
                match self.coordinator.coordinate_commit(txn, writers, readers, self.cluster_time()) {
                    Ok(Decision::Commit { commit_timestamp }) => Ok(commit_timestamp),
                    Ok(Decision::Abort { reason }) => Err(Error::no_such_transaction(txn, reason)),
                    Err(e) => Err(e),
                }
            }
        };

        match &result {
            Ok(ts) => {
                self.observe(*ts);
                rt.state = RouterTxnState::Committed(*ts);
                info!(
                    target: "tessera::router",
                    lsid = %txn.lsid,
                    txn_number = %txn.txn_number,
                    participants = rt.participants.len(),
                    commit_ts = %ts,
                    "Committed transaction"
                );
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    target: "tessera::router",
                    lsid = %txn.lsid,
                    txn_number = %txn.txn_number,
                    error = %e,
                    "Commit result unknown"
                );
            }
            Err(e) => {
                rt.state = RouterTxnState::Aborted(e.to_string());
            }
        }
        result
    }

    /// abortTransaction on every touched shard
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        self.with_session(&txn.lsid, |slot| {
            let rt = Self::current(slot, txn)?;
            match &rt.state {
                RouterTxnState::Committed(_) => Err(Error::TransactionCommitted(txn)),
                RouterTxnState::Aborted(_) => Ok(()),
                RouterTxnState::Active if rt.coordinated => Err(Error::invalid_options(
                    "commit is in the coordinator's hands; retry commitTransaction",
                )),
                RouterTxnState::Active => self.abort_participants(rt, txn, "abortTransaction"),
            }
        })
    }

    fn current(slot: &mut Option<RouterTxn>, txn: TxnId) -> Result<&mut RouterTxn> {
        match slot.as_mut() {
            Some(rt) if rt.txn_number == txn.txn_number => Ok(rt),
            Some(rt) if rt.txn_number > txn.txn_number => Err(Error::TransactionTooOld {
                lsid: txn.lsid,
                requested: txn.txn_number,
                active: rt.txn_number,
            }),
            _ => Err(Error::no_such_transaction(txn, "transaction was never started on this router")),
        }
    }

    fn abort_participants(&self, rt: &mut RouterTxn, txn: TxnId, reason: &str) -> Result<()> {
        rt.state = RouterTxnState::Aborted(reason.to_string());
        if rt.coordinated {
            return Ok(());
        }
        let shards: Vec<ShardId> = rt.participants.keys().cloned().collect();
        let results: Vec<Result<()>> = shards
            .par_iter()
            .map(|shard| {
                let client = self.registry.get(shard)?;
                match client.abort(&txn, reason) {
                    Err(Error::NoSuchTransaction { .. }) => Ok(()),
                    other => other,
                }
            })
            .collect();
        debug!(
            target: "tessera::router",
            lsid = %txn.lsid,
            txn_number = %txn.txn_number,
            participants = shards.len(),
            reason,
            "Aborted transaction"
        );
        results.into_iter().collect()
    }

    // ========================================================================
    // Non-transactional commands
    // ========================================================================

    /// Read the latest committed version of `key`
    ///
    /// Unreachable shards are retried under the read retry policy.
    pub fn find_one(&self, key: &Key) -> Result<Option<Document>> {
        let cancel = CancellationToken::new();
        let mut attempt = 0;
        loop {
            let shard = self.routing().shard_for(key)?.clone();
            let client = self.registry.get(&shard)?;
            let found = self
                .read_retry
                .run("find", &cancel, Deadline::none(), || client.find_one(key, self.gossip()));
            match found {
                Err(e) if e.is_stale_ownership() && attempt < MAX_STALE_RETRIES => {
                    attempt += 1;
                    self.refresh();
                }
                other => return other,
            }
        }
    }

    /// Merge `set` into every document in `range` on every owning shard
    ///
    /// Each shard applies its part atomically. A shard answering with an
    /// error the race policy accepts is skipped; the range was moving.
    /// Returns the number of documents updated.
    pub fn update_many(&self, range: &KeyRange, set: &Document) -> Result<usize> {
        let routing = self.routing();
        let mut updated = 0;
        for chunk in routing.chunks_for_range(range) {
            let part = intersect(range, &chunk.range);
            let client = self.registry.get(&chunk.shard)?;
            match client.update_range(&part, set, self.gossip()) {
                Ok(n) => updated += n,
                Err(e) if self.race_policy.accepts(&e) => {
                    warn!(
                        target: "tessera::router",
                        shard = %chunk.shard,
                        range = %part,
                        error = %e,
                        "Broadcast write raced a migration"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    /// End a session (and its children) on the router and every shard
    pub fn end_session(&self, lsid: &Lsid) {
        let ended: Vec<Lsid> = self
            .sessions
            .iter()
            .map(|e| *e.key())
            .filter(|key| key.parent() == *lsid || key == lsid)
            .collect();
        for key in ended {
            if let Some((_, slot)) = self.sessions.remove(&key) {
                slot.lock().removed = true;
            }
        }
        for shard in self.registry.ids() {
            if let Ok(client) = self.registry.get(&shard) {
                client.end_session(lsid);
            }
        }
    }

    /// Sessions the router tracks
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Abort uncoordinated transactions past the lifetime limit, then
    /// forget finished sessions idle past the retention period
    ///
    /// Sessions busy with a request are skipped until the next pass.
    pub fn reap(&self) -> ReapStats {
        let mut stats = ReapStats::default();
        let now = Instant::now();
        let entries: Vec<(Lsid, SessionSlot)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (lsid, slot) in entries {
            let Some(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.removed {
                continue;
            }
            if let Some(rt) = guard.txn.as_mut() {
                let expired = rt.state == RouterTxnState::Active
                    && !rt.coordinated
                    && now.duration_since(rt.started_at) > self.limits.transaction_lifetime_limit;
                if expired {
                    let txn = TxnId::new(lsid, rt.txn_number);
                    warn!(
                        target: "tessera::router",
                        lsid = %lsid,
                        txn_number = %rt.txn_number,
                        "Aborting transaction past lifetime limit"
                    );
                    if let Err(e) = self.abort_participants(rt, txn, "transaction lifetime limit exceeded") {
                        warn!(target: "tessera::router", lsid = %lsid, error = %e, "Implicit abort incomplete");
                    }
                    stats.expired += 1;
                }
            }
            let finished = guard
                .txn
                .as_ref()
                .map_or(true, |rt| rt.state != RouterTxnState::Active);
            if finished && now.duration_since(guard.last_used) > self.limits.session_retention {
                guard.removed = true;
                self.sessions.remove(&lsid);
                stats.reaped += 1;
            }
        }

        if stats.expired > 0 || stats.reaped > 0 {
            debug!(
                target: "tessera::router",
                expired = stats.expired,
                reaped = stats.reaped,
                "Reaper pass"
            );
        }
        stats
    }

    /// Start the next transaction on `lsid`
    pub fn begin(&self, lsid: Lsid, read_concern: ReadConcern) -> Transaction<'_> {
        let slot = self.sessions.get(&lsid).map(|e| Arc::clone(e.value()));
        let mut next = TxnNumber(1);
        if let Some(slot) = slot {
            if let Some(rt) = slot.lock().txn.as_ref() {
                next = rt.txn_number.next();
            }
        }
        Transaction {
            router: self,
            txn: TxnId::new(lsid, next),
            read_concern: Some(read_concern),
        }
    }
}

/// Client handle for one transaction
#[derive(Debug)]
pub struct Transaction<'r> {
    router: &'r Router,
    txn: TxnId,
    read_concern: Option<ReadConcern>,
}

impl Transaction<'_> {
    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.txn
    }

    /// Run any statement
    pub fn execute(&mut self, statement: Statement) -> Result<StatementResult> {
        self.router.execute(self.txn, self.read_concern.take(), statement)
    }

    /// Insert a document
    pub fn insert(&mut self, key: Key, doc: Document) -> Result<()> {
        self.execute(Statement::Insert { key, doc }).map(|_| ())
    }

    /// Merge fields into a document, creating it with `upsert`
    pub fn update(&mut self, key: Key, set: Document, upsert: bool) -> Result<bool> {
        match self.execute(Statement::Update {
            key,
            set,
            upsert,
        })? {
            StatementResult::Updated { matched, upserted } => Ok(matched || upserted),
            _ => Ok(false),
        }
    }

    /// Delete a document
    pub fn delete(&mut self, key: Key) -> Result<bool> {
        match self.execute(Statement::Delete { key })? {
            StatementResult::Deleted { deleted } => Ok(deleted),
            _ => Ok(false),
        }
    }

    /// Read a document
    pub fn find(&mut self, key: Key) -> Result<Option<Document>> {
        match self.execute(Statement::Find { key })? {
            StatementResult::Found(doc) => Ok(doc),
            _ => Ok(None),
        }
    }

    /// Read every document in `range`
    pub fn scan(&mut self, range: KeyRange) -> Result<Vec<(Key, Document)>> {
        match self.execute(Statement::Scan { range })? {
            StatementResult::Scanned(docs) => Ok(docs),
            _ => Ok(Vec::new()),
        }
    }

    /// Commit; returns the commit timestamp
    pub fn commit(&self) -> Result<Timestamp> {
        self.router.commit(self.txn)
    }

    /// Abort
    pub fn abort(&self) -> Result<()> {
        self.router.abort(self.txn)
    }
}
