//! Transaction table: the participant service of one shard
//!
//! Owns the session entries of a shard and drives every participant
//! operation through the state machine in [`crate::participant`]:
//!
//! - `execute`: begin or continue a transaction and run one statement
//! - `prepare`: durably prepare and return the prepare timestamp
//! - `commit` / `abort`: apply the coordinator's (or client's) decision
//! - `end_session` / `reap`: forget sessions, enforce the lifetime limit
//! - `recover`: rebuild state from the participant log
//! - `rollback`: undo every step after a common point
//!
//! ## Concurrency
//!
//! Sessions live in a `DashMap<Lsid, Arc<Mutex<SessionEntry>>>`. Requests of
//! one session are serialized by its mutex; different sessions run in
//! parallel. A request never holds more than one session mutex, and locks
//! are always taken in the order session -> intents -> tracker -> interlock.
//!
//! ## Prepare sequence
//!
//! ```text
//! 1. interlock.admit_prepare()  - wait out critical sections, check ownership,
//!                                 record lock set (atomic)
//! 2. tracker.register_with()    - issue prepare_ts and lock keys (atomic)
//! 3. log.append(Prepared)       - DURABILITY POINT
//! 4. record.mark_prepared()
//! ```
//!
//! If step 3 fails, steps 1-2 are undone and the transaction stays in
//! progress.
//!
//! ## Commit sequence
//!
//! The store is checked before the `Committed` entry is logged, so a write
//! the store would refuse fails the commit with no state change. Once the
//! entry is logged the writes must apply; a store refusal at that point
//! aborts the process.

use crate::participant::{AbortAction, CommitAction, PrepareAction, PreparedImage, TransactionRecord};
use crate::rollback::DecidedTxn;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{
    fatal::fatal_invariant, CancelReason, CancellationToken, Deadline, Document, Error, ErrorKind, Key,
    KeyRange, Lsid, Mutation, ReadConcern, Result, ShardId, Timestamp, TxnId, TxnState,
};
use tessera_durability::{RecoveredLog, RecoveredPrepared, StoreChange, TransactionLog, TxnLogEntry};
use tessera_storage::{Access, LogicalClock, PrepareConflictTracker, VersionedStore};
use tracing::{debug, info, warn};

use crate::interlock::MigrationInterlock;

/// Limits enforced by the table
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Longest a read or write waits on a prepared transaction
    pub prepare_conflict_timeout: Duration,
    /// In-progress transactions older than this are aborted by the reaper
    pub transaction_lifetime_limit: Duration,
    /// Idle terminal sessions are forgotten after this long
    pub session_retention: Duration,
    /// Largest buffered write set of one transaction
    pub max_transaction_bytes: usize,
    /// Buffered bytes across all transactions before writes are refused
    pub cache_pressure_bytes: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            prepare_conflict_timeout: Duration::from_secs(5),
            transaction_lifetime_limit: Duration::from_secs(60),
            session_retention: Duration::from_secs(30 * 60),
            max_transaction_bytes: 16 * 1024 * 1024,
            cache_pressure_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Counters kept by the table
#[derive(Debug, Default)]
pub struct TableMetrics {
    started: AtomicU64,
    prepared: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    reaped: AtomicU64,
}

/// Point-in-time copy of [`TableMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableMetricsSnapshot {
    /// Transactions started
    pub started: u64,
    /// Transactions prepared
    pub prepared: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions aborted
    pub aborted: u64,
    /// Sessions reaped or ended
    pub reaped: u64,
}

/// Result of one reaper pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReapStats {
    /// In-progress transactions aborted for exceeding the lifetime limit
    pub expired: usize,
    /// Sessions removed
    pub reaped: usize,
}

/// What a rollback undid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackStats {
    /// Committed transactions returned to the prepared state
    pub reprepared: usize,
    /// Transactions forgotten: later single-phase commits and later prepares
    pub forgotten: usize,
    /// In-progress transactions aborted because they read past the point
    pub aborted: usize,
    /// Log entries removed
    pub log_entries: usize,
}

/// What a participant log replay reinstated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryStats {
    /// Committed batches and imports applied to the store
    pub batches: usize,
    /// Prepared transactions reinstated with their barriers
    pub prepared: usize,
    /// Terminal outcomes kept for retries
    pub outcomes: usize,
}

#[derive(Debug)]
struct SessionEntry {
    record: Option<TransactionRecord>,
    last_used: Instant,
    removed: bool,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            record: None,
            last_used: Instant::now(),
            removed: false,
        }
    }

    /// True if the session holds nothing that must survive
    fn reapable(&self) -> bool {
        self.record.as_ref().map_or(true, |r| r.state.is_terminal())
    }

    fn record_mut(&mut self, txn: &TxnId) -> Result<&mut TransactionRecord> {
        match self.record.as_mut() {
            Some(r) if r.txn.txn_number == txn.txn_number => Ok(r),
            Some(r) if r.txn.txn_number > txn.txn_number => Err(Error::TransactionTooOld {
                lsid: txn.lsid,
                requested: txn.txn_number,
                active: r.txn.txn_number,
            }),
            _ => Err(Error::no_such_transaction(
                *txn,
                "transaction not found on this participant",
            )),
        }
    }
}

enum Admission {
    Continue,
    Start,
    Supersede,
    Refuse(Error),
}

/// Participant service of one shard
pub struct TransactionTable {
    shard: ShardId,
    config: TableConfig,
    sessions: DashMap<Lsid, Arc<Mutex<SessionEntry>>>,
    store: Arc<VersionedStore>,
    clock: Arc<LogicalClock>,
    tracker: Arc<PrepareConflictTracker>,
    interlock: Arc<MigrationInterlock>,
    log: Arc<TransactionLog>,
    /// Keys written by in-progress or prepared transactions
    intents: Mutex<HashMap<Key, TxnId>>,
    cache_bytes: AtomicUsize,
    cancel: RwLock<CancellationToken>,
    metrics: TableMetrics,
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("shard", &self.shard)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl TransactionTable {
    /// Create the table of `shard` over its storage primitives
    pub fn new(
        shard: ShardId,
        config: TableConfig,
        store: Arc<VersionedStore>,
        clock: Arc<LogicalClock>,
        tracker: Arc<PrepareConflictTracker>,
        interlock: Arc<MigrationInterlock>,
        log: Arc<TransactionLog>,
    ) -> Self {
        Self {
            shard,
            config,
            sessions: DashMap::new(),
            store,
            clock,
            tracker,
            interlock,
            log,
            intents: Mutex::new(HashMap::new()),
            cache_bytes: AtomicUsize::new(0),
            cancel: RwLock::new(CancellationToken::new()),
            metrics: TableMetrics::default(),
        }
    }

    /// Shard this table serves
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Limits in force
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Token cancelled when the shard steps down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Run one statement of `txn`
    ///
    /// `start` carries the read concern when the request is the
    /// transaction's first statement on this shard. Errors that leave the
    /// transaction unusable abort it here, releasing its write intents.
    pub fn execute<R>(
        &self,
        txn: TxnId,
        start: Option<ReadConcern>,
        deadline: Deadline,
        statement: impl FnOnce(&mut StatementContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let cancel = self.cancel_token();
        self.with_session(&txn.lsid, start.is_some(), |entry| {
            self.begin_or_continue(entry, txn, start)?;
            let record = entry.record_mut(&txn)?;

            if let Err(e) = self.interlock.check_owned(record.write_keys().iter()) {
                self.abort_in_progress(record, &format!("range ownership changed: {}", e));
                return Err(e);
            }

            let mut ctx = StatementContext {
                table: self,
                record: &mut *record,
                deadline,
                cancel,
            };
            let result = statement(&mut ctx);
            if let Err(e) = &result {
                if aborts_transaction(e) && matches!(record.state, TxnState::InProgress) {
                    self.abort_in_progress(record, &e.to_string());
                }
            }
            result
        })
        .unwrap_or_else(|| Err(Error::no_such_transaction(txn, "transaction not started")))
    }

    fn begin_or_continue(
        &self,
        entry: &mut SessionEntry,
        txn: TxnId,
        start: Option<ReadConcern>,
    ) -> Result<()> {
        let admission = match &entry.record {
            None => match start {
                Some(_) => Admission::Start,
                None => Admission::Refuse(Error::no_such_transaction(txn, "transaction not started")),
            },
            Some(r) if txn.txn_number < r.txn.txn_number => Admission::Refuse(Error::TransactionTooOld {
                lsid: txn.lsid,
                requested: txn.txn_number,
                active: r.txn.txn_number,
            }),
            Some(r) if txn.txn_number == r.txn.txn_number => match (&start, &r.state) {
                (Some(_), TxnState::Aborted { was_prepared: false, .. }) => Admission::Start,
                (Some(rc), TxnState::InProgress) if *rc != r.read_concern => {
                    Admission::Refuse(Error::invalid_options(format!(
                        "read concern of {} was fixed by its first statement",
                        txn
                    )))
                }
                _ => match r.check_statement() {
                    Ok(()) => Admission::Continue,
                    Err(e) => Admission::Refuse(e),
                },
            },
            Some(r) => match &r.state {
                TxnState::Prepared { .. } => {
                    Admission::Refuse(Error::PreparedTransactionInProgress(r.txn))
                }
                _ => Admission::Supersede,
            },
        };

        match admission {
            Admission::Continue => Ok(()),
            Admission::Refuse(e) => Err(e),
            Admission::Supersede => {
                if let Some(old) = entry.record.as_mut() {
                    if matches!(old.state, TxnState::InProgress) {
                        let reason = format!("superseded by txnNumber {}", txn.txn_number);
                        self.abort_in_progress(old, &reason);
                    }
                }
                match start {
                    Some(rc) => {
                        entry.record = Some(self.new_record(txn, rc));
                        Ok(())
                    }
                    None => Err(Error::no_such_transaction(txn, "transaction not started")),
                }
            }
            Admission::Start => {
                let rc = start.unwrap_or_default();
                entry.record = Some(self.new_record(txn, rc));
                Ok(())
            }
        }
    }

    fn new_record(&self, txn: TxnId, read_concern: ReadConcern) -> TransactionRecord {
        if let Some(after) = read_concern.after_cluster_time {
            self.clock.advance_to(after);
        }
        let read_ts = match read_concern.at_cluster_time {
            Some(ts) => {
                self.clock.advance_to(ts);
                ts
            }
            None => self.clock.current(),
        };
        self.metrics.started.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "tessera::txn",
            shard = %self.shard,
            lsid = %txn.lsid,
            txn_number = %txn.txn_number,
            read_ts = %read_ts,
            level = ?read_concern.level,
            "Started transaction"
        );
        TransactionRecord::new(txn, read_concern, read_ts)
    }

    // ========================================================================
    // Prepare / commit / abort
    // ========================================================================

    /// Durably prepare `txn`; returns its prepare timestamp
    ///
    /// A retry on a prepared transaction returns the original timestamp.
    pub fn prepare(&self, txn: &TxnId, deadline: Deadline) -> Result<Timestamp> {
        let cancel = self.cancel_token();
        self.with_session(&txn.lsid, false, |entry| {
            let record = entry.record_mut(txn)?;
            if let PrepareAction::AlreadyPrepared(ts) = record.prepare_action()? {
                return Ok(ts);
            }

            let keys = record.write_keys();
            if let Err(e) = self.interlock.admit_prepare(*txn, &keys, deadline, &cancel) {
                if aborts_transaction(&e) {
                    self.abort_in_progress(record, &format!("prepare refused: {}", e));
                }
                return Err(e);
            }

            let writes = record.mutations();
            let prepare_ts = self
                .tracker
                .register_with(*txn, keys, || self.clock.next_timestamp());
            let logged = self.log.append(&TxnLogEntry::Prepared {
                txn: *txn,
                read_ts: record.read_ts,
                prepare_ts,
                writes,
            });
            if let Err(e) = logged {
                self.tracker.release(txn);
                self.interlock.on_prepared_txn_resolved(txn);
                return Err(e);
            }

            record.mark_prepared(prepare_ts);
            self.metrics.prepared.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "tessera::txn",
                shard = %self.shard,
                lsid = %txn.lsid,
                txn_number = %txn.txn_number,
                prepare_ts = %prepare_ts,
                "Prepared transaction"
            );
            Ok(prepare_ts)
        })
        .unwrap_or_else(|| Err(Error::no_such_transaction(*txn, "transaction not found on this participant")))
    }

    /// Commit `txn`
    ///
    /// Prepared transactions require `commit_ts >= prepare_ts`; unprepared
    /// ones must not carry a timestamp and commit at a fresh one. Returns
    /// the commit timestamp.
    pub fn commit(&self, txn: &TxnId, commit_ts: Option<Timestamp>, deadline: Deadline) -> Result<Timestamp> {
        let cancel = self.cancel_token();
        self.with_session(&txn.lsid, false, |entry| {
            let record = entry.record_mut(txn)?;
            match record.commit_action(commit_ts)? {
                CommitAction::AlreadyCommitted(ts) => Ok(ts),
                CommitAction::CommitPrepared(ts) => {
                    self.store.check_writable(ts, &record.mutations())?;
                    self.clock.advance_to(ts);
                    self.log.append(&TxnLogEntry::Committed {
                        txn: *txn,
                        commit_ts: ts,
                        writes: Vec::new(),
                        was_prepared: true,
                    })?;
                    self.apply(ts, &record.mutations());
                    self.finish_committed(record, ts);
                    Ok(ts)
                }
                CommitAction::SinglePhase if record.is_read_only() => {
                    let ts = record.read_ts;
                    self.finish_committed(record, ts);
                    Ok(ts)
                }
                CommitAction::SinglePhase => {
                    let keys = record.write_keys();
                    if let Err(e) = self.interlock.admit_prepare(*txn, &keys, deadline, &cancel) {
                        if aborts_transaction(&e) {
                            self.abort_in_progress(record, &format!("commit refused: {}", e));
                        }
                        return Err(e);
                    }
                    let writes = record.mutations();
                    let ts = self
                        .tracker
                        .register_with(*txn, keys, || self.clock.next_timestamp());
                    let logged = self.store.check_writable(ts, &writes).and_then(|()| {
                        self.log.append(&TxnLogEntry::Committed {
                            txn: *txn,
                            commit_ts: ts,
                            writes: writes.clone(),
                            was_prepared: false,
                        })
                    });
                    if let Err(e) = logged {
                        self.tracker.release(txn);
                        self.interlock.on_prepared_txn_resolved(txn);
                        return Err(e);
                    }
                    self.apply(ts, &writes);
                    self.finish_committed(record, ts);
                    Ok(ts)
                }
            }
        })
        .unwrap_or_else(|| Err(Error::no_such_transaction(*txn, "transaction not found on this participant")))
    }

    /// Abort `txn`; aborting an aborted transaction succeeds
    pub fn abort(&self, txn: &TxnId, reason: &str) -> Result<()> {
        self.with_session(&txn.lsid, false, |entry| {
            let record = entry.record_mut(txn)?;
            match record.abort_action()? {
                AbortAction::AlreadyAborted => Ok(()),
                AbortAction::AbortInProgress => {
                    self.abort_in_progress(record, reason);
                    Ok(())
                }
                AbortAction::AbortPrepared => {
                    self.log.append(&TxnLogEntry::Aborted {
                        txn: *txn,
                        reason: reason.to_string(),
                    })?;
                    self.release(record);
                    record.mark_aborted(reason);
                    self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        target: "tessera::txn",
                        shard = %self.shard,
                        lsid = %txn.lsid,
                        txn_number = %txn.txn_number,
                        reason,
                        "Aborted prepared transaction"
                    );
                    Ok(())
                }
            }
        })
        .unwrap_or_else(|| Err(Error::no_such_transaction(*txn, "transaction not found on this participant")))
    }

    /// Install logged writes; they were checked before logging
    fn apply(&self, ts: Timestamp, writes: &[Mutation]) {
        if writes.is_empty() {
            return;
        }
        if let Err(e) = self.store.write_at_timestamp(ts, writes) {
            fatal_invariant(&format!(
                "shard {}: writes logged at {} were refused by the store: {}",
                self.shard, ts, e
            ));
        }
    }

    fn finish_committed(&self, record: &mut TransactionRecord, ts: Timestamp) {
        let image = record.prepare_ts().map(|prepare_ts| PreparedImage {
            prepare_ts,
            writes: record.mutations(),
        });
        self.release(record);
        record.mark_committed(ts);
        record.prepared_image = image;
        self.metrics.committed.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "tessera::txn",
            shard = %self.shard,
            lsid = %record.txn.lsid,
            txn_number = %record.txn.txn_number,
            commit_ts = %ts,
            "Committed transaction"
        );
    }

    fn abort_in_progress(&self, record: &mut TransactionRecord, reason: &str) {
        self.release(record);
        record.mark_aborted(reason);
        self.metrics.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "tessera::txn",
            shard = %self.shard,
            lsid = %record.txn.lsid,
            txn_number = %record.txn.txn_number,
            reason,
            "Aborted transaction"
        );
    }

    /// Drop intents, barrier and lock set of `record`
    fn release(&self, record: &mut TransactionRecord) {
        let txn = record.txn;
        {
            let mut intents = self.intents.lock();
            for key in record.write_keys() {
                if intents.get(&key) == Some(&txn) {
                    intents.remove(&key);
                }
            }
        }
        let freed = record.clear_writes();
        self.cache_bytes.fetch_sub(freed, Ordering::Relaxed);
        self.tracker.release(&txn);
        self.interlock.on_prepared_txn_resolved(&txn);
    }

    // ========================================================================
    // Non-transactional access
    // ========================================================================

    /// Read the latest committed version of `key`, waiting on prepared writers
    pub fn read_latest(&self, key: &Key, deadline: Deadline) -> Result<Option<Document>> {
        let cancel = self.cancel_token();
        self.interlock.admit(std::slice::from_ref(key), deadline, &cancel)?;
        let ts = self.clock.current();
        let wait = deadline.min(Deadline::after(self.config.prepare_conflict_timeout));
        self.tracker.wait_until_clear(key, Access::Read(ts), wait, &cancel)?;
        Ok(self.store.read_at(key, ts))
    }

    /// Durably install a batch outside any transaction; returns its timestamp
    pub fn apply_batch(&self, writes: &[Mutation]) -> Result<Timestamp> {
        let ts = self.clock.next_timestamp();
        self.store.check_writable(ts, writes)?;
        self.log.append(&TxnLogEntry::Applied {
            ts,
            writes: writes.to_vec(),
        })?;
        self.apply(ts, writes);
        Ok(ts)
    }

    /// Durably make `versions` the contents of `range`, at their own
    /// timestamps
    ///
    /// Used for a range received from a migration donor, so snapshots older
    /// than the move read the same history the donor served. The clock
    /// moves past the newest version.
    pub fn import_history(&self, range: &KeyRange, versions: Vec<(Timestamp, Mutation)>) -> Result<()> {
        if let Some((_, m)) = versions.iter().find(|(_, m)| !range.contains(&m.key)) {
            return Err(Error::BadValue(format!("imported key {} is outside {}", m.key, range)));
        }
        if let Some(max) = versions.iter().map(|(ts, _)| *ts).max() {
            self.clock.advance_to(max);
        }
        let entry = TxnLogEntry::Imported {
            range: range.clone(),
            versions,
        };
        self.log.append(&entry)?;
        if let TxnLogEntry::Imported { range, versions } = &entry {
            self.store.replace_range(range, versions)?;
        }
        Ok(())
    }

    /// Durably record the interlock's current owned ranges
    pub fn persist_ownership(&self) -> Result<()> {
        self.log.append(&TxnLogEntry::Ownership {
            ranges: self.interlock.owned_ranges(),
        })
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// End `lsid` (and its child sessions if it is a parent)
    ///
    /// In-progress transactions are aborted. Sessions holding a prepared
    /// transaction stay until the decision arrives. Returns the number of
    /// sessions removed.
    pub fn end_session(&self, lsid: &Lsid) -> usize {
        let members: Vec<Lsid> = self
            .sessions
            .iter()
            .map(|e| *e.key())
            .filter(|l| if lsid.is_child() { l == lsid } else { l.id() == lsid.id() })
            .collect();

        let mut removed = 0;
        for member in members {
            let entry = match self.sessions.get(&member) {
                Some(e) => Arc::clone(e.value()),
                None => continue,
            };
            let mut guard = entry.lock();
            if guard.removed {
                continue;
            }
            if let Some(record) = guard.record.as_mut() {
                match record.state {
                    TxnState::Prepared { .. } => continue,
                    TxnState::InProgress => self.abort_in_progress(record, "session ended"),
                    _ => {}
                }
            }
            self.forget(&member, &mut guard);
            removed += 1;
        }
        if removed > 0 {
            debug!(target: "tessera::txn", shard = %self.shard, lsid = %lsid, removed, "Ended session");
        }
        removed
    }

    /// One reaper pass
    ///
    /// Aborts in-progress transactions past the lifetime limit, then removes
    /// session groups (a parent and its children) whose members are all
    /// terminal and idle past the retention window. Busy sessions are
    /// skipped until the next pass.
    pub fn reap(&self) -> ReapStats {
        let mut stats = ReapStats::default();
        let now = Instant::now();

        let entries: Vec<(Lsid, Arc<Mutex<SessionEntry>>)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (_, entry) in &entries {
            if let Some(mut guard) = entry.try_lock() {
                if let Some(record) = guard.record.as_mut() {
                    let expired = matches!(record.state, TxnState::InProgress)
                        && now.duration_since(record.started_at) > self.config.transaction_lifetime_limit;
                    if expired {
                        warn!(
                            target: "tessera::txn",
                            shard = %self.shard,
                            lsid = %record.txn.lsid,
                            txn_number = %record.txn.txn_number,
                            "Aborting transaction past lifetime limit"
                        );
                        self.abort_in_progress(record, "transaction lifetime limit exceeded");
                        stats.expired += 1;
                    }
                }
            }
        }

        // A parent session and its children share `id()` and are reaped together.
        let mut groups: BTreeMap<_, Vec<(Lsid, Arc<Mutex<SessionEntry>>)>> = BTreeMap::new();
        for (lsid, entry) in entries {
            groups.entry(lsid.id()).or_default().push((lsid, entry));
        }

        for (_, mut members) in groups {
            members.sort_by(|a, b| a.0.cmp(&b.0));
            let mut guards = Vec::with_capacity(members.len());
            for (lsid, entry) in &members {
                match entry.try_lock() {
                    Some(guard) => guards.push((*lsid, guard)),
                    None => break,
                }
            }
            if guards.len() != members.len() {
                continue;
            }
            let idle = guards
                .iter()
                .map(|(_, g)| g.last_used)
                .max()
                .map_or(false, |last| now.duration_since(last) > self.config.session_retention);
            let all_reapable = guards.iter().all(|(_, g)| !g.removed && g.reapable());
            if !(idle && all_reapable) {
                continue;
            }
            for (lsid, guard) in guards.iter_mut() {
                self.forget(lsid, guard);
                stats.reaped += 1;
            }
        }

        if stats.expired > 0 || stats.reaped > 0 {
            debug!(
                target: "tessera::txn",
                shard = %self.shard,
                expired = stats.expired,
                reaped = stats.reaped,
                "Reaper pass"
            );
        }
        stats
    }

    /// Remove a locked session entry from the table
    fn forget(&self, lsid: &Lsid, entry: &mut SessionEntry) {
        if let Some(record) = &entry.record {
            let logged_outcome = record.was_prepared()
                || matches!(record.state, TxnState::Committed { .. });
            if logged_outcome {
                if let Err(e) = self.log.append(&TxnLogEntry::Reaped { txn: record.txn }) {
                    warn!(target: "tessera::txn", lsid = %lsid, error = %e, "Could not log reaped transaction");
                }
            }
        }
        entry.removed = true;
        self.sessions.remove(lsid);
        self.metrics.reaped.fetch_add(1, Ordering::Relaxed);
    }

    fn with_session<R>(
        &self,
        lsid: &Lsid,
        create: bool,
        f: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<R> {
        loop {
            let entry = if create {
                Arc::clone(
                    self.sessions
                        .entry(*lsid)
                        .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new())))
                        .value(),
                )
            } else {
                Arc::clone(self.sessions.get(lsid)?.value())
            };
            let mut guard = entry.lock();
            if guard.removed {
                continue;
            }
            guard.last_used = Instant::now();
            return Some(f(&mut guard));
        }
    }

    // ========================================================================
    // Recovery and replication state
    // ========================================================================

    /// Rebuild state from a replayed participant log
    ///
    /// Committed batches are installed, prepared transactions get their
    /// barriers, intents and lock sets back, and the clock resumes above
    /// every logged timestamp.
    pub fn recover(&self, recovered: RecoveredLog) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        for change in &recovered.changes {
            match change {
                StoreChange::Batch(ts, writes) => self.store.install(*ts, writes),
                StoreChange::Import { range, versions } => self.store.replace_range(range, versions)?,
            }
            stats.batches += 1;
        }
        self.clock.advance_to(recovered.max_timestamp);
        if let Some(owned) = recovered.ownership {
            self.interlock.set_owned(owned);
        }

        for p in recovered.prepared {
            let record = self.reinstate_prepared(p.txn, p.read_ts, p.prepare_ts, p.writes);
            self.install(record);
            stats.prepared += 1;
        }

        let mut images: HashMap<TxnId, RecoveredPrepared> =
            recovered.committed_prepares.into_iter().map(|p| (p.txn, p)).collect();
        for (txn, state) in recovered.outcomes {
            let mut record = TransactionRecord::recovered(txn, state, Timestamp::ZERO, Vec::new());
            if let Some(p) = images.remove(&txn) {
                record.read_ts = p.read_ts;
                record.prepared_image = Some(PreparedImage {
                    prepare_ts: p.prepare_ts,
                    writes: p.writes,
                });
            }
            self.install(record);
            stats.outcomes += 1;
        }

        info!(
            target: "tessera::txn",
            shard = %self.shard,
            batches = stats.batches,
            prepared = stats.prepared,
            outcomes = stats.outcomes,
            clock = %self.clock.current(),
            "Recovered participant state"
        );
        Ok(stats)
    }

    /// Prepared record with its intents, footprint, barrier and lock set
    /// registered
    fn reinstate_prepared(
        &self,
        txn: TxnId,
        read_ts: Timestamp,
        prepare_ts: Timestamp,
        writes: Vec<Mutation>,
    ) -> TransactionRecord {
        let record = TransactionRecord::recovered(
            txn,
            TxnState::Prepared {
                prepare_timestamp: prepare_ts,
            },
            read_ts,
            writes,
        );
        let keys = record.write_keys();
        {
            let mut intents = self.intents.lock();
            for key in &keys {
                intents.insert(key.clone(), txn);
            }
        }
        self.cache_bytes.fetch_add(record.bytes(), Ordering::Relaxed);
        self.tracker.register(txn, keys.clone(), prepare_ts);
        self.interlock.on_prepared(txn, keys);
        record
    }

    /// Undo every transaction step taken after `common_point`
    ///
    /// The log is truncated first. Then, in memory: a transaction committed
    /// after the point goes back to prepared if it prepared at or before
    /// it, and is forgotten otherwise; a transaction prepared after the
    /// point is forgotten; an in-progress transaction reading past the
    /// point is aborted. The store is rolled back by the caller.
    pub fn rollback(&self, common_point: Timestamp) -> Result<RollbackStats> {
        let mut stats = RollbackStats {
            log_entries: self.log.truncate_after(common_point)?,
            ..RollbackStats::default()
        };
        let entries: Vec<Arc<Mutex<SessionEntry>>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let mut guard = entry.lock();
            let Some(record) = guard.record.as_mut() else {
                continue;
            };
            match record.state.clone() {
                TxnState::Committed { commit_timestamp, .. } if commit_timestamp > common_point => {
                    let (txn, read_ts) = (record.txn, record.read_ts);
                    let restore = record
                        .prepared_image
                        .take()
                        .filter(|image| image.prepare_ts <= common_point);
                    guard.record = match restore {
                        Some(image) => {
                            stats.reprepared += 1;
                            Some(self.reinstate_prepared(txn, read_ts, image.prepare_ts, image.writes))
                        }
                        None => {
                            stats.forgotten += 1;
                            None
                        }
                    };
                }
                TxnState::Prepared { prepare_timestamp } if prepare_timestamp > common_point => {
                    self.release(record);
                    guard.record = None;
                    stats.forgotten += 1;
                }
                TxnState::InProgress if record.read_ts > common_point => {
                    self.abort_in_progress(record, "rolled back past the transaction's snapshot");
                    stats.aborted += 1;
                }
                _ => {}
            }
        }
        warn!(
            target: "tessera::txn",
            shard = %self.shard,
            common_point = %common_point,
            reprepared = stats.reprepared,
            forgotten = stats.forgotten,
            aborted = stats.aborted,
            log_entries = stats.log_entries,
            "Rolled back transaction table"
        );
        Ok(stats)
    }

    fn install(&self, record: TransactionRecord) {
        let entry = Arc::clone(
            self.sessions
                .entry(record.txn.lsid)
                .or_insert_with(|| Arc::new(Mutex::new(SessionEntry::new())))
                .value(),
        );
        let mut guard = entry.lock();
        let newer = guard
            .record
            .as_ref()
            .map_or(true, |existing| existing.txn.txn_number < record.txn.txn_number);
        if newer {
            guard.record = Some(record);
        }
    }

    /// Cancel blocked waits; called when the shard steps down
    pub fn step_down(&self) {
        self.cancel.read().cancel(CancelReason::StepDown);
        self.tracker.wake_all();
        self.interlock.wake_all();
    }

    /// Accept work again under a fresh cancellation token
    pub fn step_up(&self) {
        *self.cancel.write() = CancellationToken::new();
    }

    /// Committed transactions this table still remembers that committed after `ts`
    pub fn decided_since(&self, ts: Timestamp) -> Vec<DecidedTxn> {
        let entries: Vec<Arc<Mutex<SessionEntry>>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut decided: Vec<DecidedTxn> = entries
            .iter()
            .filter_map(|entry| {
                let guard = entry.lock();
                match guard.record.as_ref().map(|r| (r.txn, &r.state)) {
                    Some((txn, TxnState::Committed { commit_timestamp, .. })) if *commit_timestamp > ts => {
                        Some(DecidedTxn {
                            txn,
                            decided_at: *commit_timestamp,
                        })
                    }
                    _ => None,
                }
            })
            .collect();
        decided.sort_by_key(|d| d.decided_at);
        decided
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// State of `txn`, if this table knows it
    pub fn state_of(&self, txn: &TxnId) -> Option<TxnState> {
        let entry = Arc::clone(self.sessions.get(&txn.lsid)?.value());
        let guard = entry.lock();
        guard
            .record
            .as_ref()
            .filter(|r| r.txn.txn_number == txn.txn_number)
            .map(|r| r.state.clone())
    }

    /// Number of sessions in the table
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Buffered bytes across all transactions
    pub fn cache_bytes(&self) -> usize {
        self.cache_bytes.load(Ordering::Relaxed)
    }

    /// Counter snapshot
    pub fn metrics(&self) -> TableMetricsSnapshot {
        TableMetricsSnapshot {
            started: self.metrics.started.load(Ordering::Relaxed),
            prepared: self.metrics.prepared.load(Ordering::Relaxed),
            committed: self.metrics.committed.load(Ordering::Relaxed),
            aborted: self.metrics.aborted.load(Ordering::Relaxed),
            reaped: self.metrics.reaped.load(Ordering::Relaxed),
        }
    }
}

/// Errors after which an in-progress transaction cannot continue
fn aborts_transaction(e: &Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Transient | ErrorKind::TransactionFatal | ErrorKind::Invariant
    )
}

// ============================================================================
// Statement context
// ============================================================================

/// Access to one transaction while a statement runs
///
/// Reads see the transaction's own buffered writes first, then the snapshot
/// at its read timestamp. Writes are buffered until commit.
pub struct StatementContext<'a> {
    table: &'a TransactionTable,
    record: &'a mut TransactionRecord,
    deadline: Deadline,
    cancel: CancellationToken,
}

impl<'a> StatementContext<'a> {
    /// Transaction running the statement
    pub fn txn(&self) -> TxnId {
        self.record.txn
    }

    /// Snapshot the transaction reads at
    pub fn read_ts(&self) -> Timestamp {
        self.record.read_ts
    }

    fn conflict_deadline(&self) -> Deadline {
        self.deadline
            .min(Deadline::after(self.table.config.prepare_conflict_timeout))
    }

    /// Read `key`
    pub fn read(&mut self, key: &Key) -> Result<Option<Document>> {
        self.table
            .interlock
            .admit(std::slice::from_ref(key), self.deadline, &self.cancel)?;
        if let Some(buffered) = self.record.buffered(key) {
            return Ok(buffered.cloned());
        }
        let ts = self.record.read_ts;
        self.table.tracker.wait_until_clear(
            key,
            Access::Read(ts),
            self.conflict_deadline(),
            &self.cancel,
        )?;
        Ok(self.table.store.read_at(key, ts))
    }

    /// Documents in `range`, in key order
    pub fn scan(&mut self, range: &KeyRange) -> Result<Vec<(Key, Document)>> {
        self.table
            .interlock
            .admit_range(range, self.deadline, &self.cancel)?;
        let ts = self.record.read_ts;
        for (key, _) in self.table.tracker.prepared_in_range(range) {
            self.table.tracker.wait_until_clear(
                &key,
                Access::Read(ts),
                self.conflict_deadline(),
                &self.cancel,
            )?;
        }
        let mut merged: BTreeMap<Key, Document> = self.table.store.scan_at(range, ts).into_iter().collect();
        for (key, value) in self.record.writes_in(range) {
            match value {
                Some(doc) => {
                    merged.insert(key, doc);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Buffer `mutation`
    ///
    /// Fails with `WriteConflict` if another transaction holds an intent on
    /// the key or committed it after this transaction's snapshot.
    pub fn write(&mut self, mutation: Mutation) -> Result<()> {
        let txn = self.record.txn;
        let table = self.table;
        table
            .interlock
            .admit(std::slice::from_ref(&mutation.key), self.deadline, &self.cancel)?;
        table.tracker.wait_until_clear(
            &mutation.key,
            Access::Write(Some(txn)),
            self.conflict_deadline(),
            &self.cancel,
        )?;

        let mut intents = table.intents.lock();
        if let Some(owner) = intents.get(&mutation.key) {
            if *owner != txn {
                debug!(
                    target: "tessera::txn",
                    key = %mutation.key,
                    holder = %owner,
                    "Write conflict with in-progress transaction"
                );
                return Err(Error::WriteConflict { key: mutation.key });
            }
        }
        if let Some(latest) = table.store.latest_timestamp(&mutation.key) {
            if latest > self.record.read_ts {
                return Err(Error::WriteConflict { key: mutation.key });
            }
        }

        let before = self.record.bytes();
        let after = self.record.footprint_after(&mutation);
        if after > table.config.max_transaction_bytes {
            return Err(Error::TransactionTooLargeForCache {
                txn,
                size: after,
                limit: table.config.max_transaction_bytes,
            });
        }
        if after > before {
            let grow = after - before;
            let total = table.cache_bytes.fetch_add(grow, Ordering::Relaxed) + grow;
            if total > table.config.cache_pressure_bytes {
                table.cache_bytes.fetch_sub(grow, Ordering::Relaxed);
                return Err(Error::TemporarilyUnavailable(format!(
                    "transaction cache holds {} bytes (limit {})",
                    total, table.config.cache_pressure_bytes
                )));
            }
        } else {
            table.cache_bytes.fetch_sub(before - after, Ordering::Relaxed);
        }

        intents.insert(mutation.key.clone(), txn);
        self.record.buffer(mutation);
        Ok(())
    }
}
