//! A shard: one participant node
//!
//! Wires the storage primitives, the participant log, the interlock and
//! the transaction table together, and exposes the participant command
//! surface (statements, prepare, commit, abort) plus the hooks migrations
//! and rollback need.
//!
//! Every command first checks that the node is primary. After `step_down`
//! commands fail with `NotWritablePrimary` and blocked waits are
//! interrupted; `step_up` resumes service in a new term.

use crate::command::{self, StatementReply, StatementRequest};
use crate::config::ClusterConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tessera_concurrency::{
    plan_or_abort, MigrationInterlock, ReapStats, RollbackPlan, TransactionTable,
};
use tessera_core::{
    Deadline, Document, Key, KeyRange, Lsid, Mutation, ReadConcern, Result, ShardId,
    Timestamp, TxnId, TxnNumber, TxnState,
};
use tessera_durability::{DurabilityMode, ReplicationTerm, TransactionLog};
use tessera_storage::{LogicalClock, PrepareConflictTracker, VersionedStore};
use tracing::{debug, info, warn};

/// One participant node
pub struct Shard {
    id: ShardId,
    term: Arc<ReplicationTerm>,
    store: Arc<VersionedStore>,
    clock: Arc<LogicalClock>,
    interlock: Arc<MigrationInterlock>,
    table: TransactionTable,
    statement_timeout: Duration,
    dir: Option<PathBuf>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("term", &self.term.current())
            .field("primary", &self.term.is_primary())
            .field("dir", &self.dir)
            .finish()
    }
}

impl Shard {
    /// A shard whose state lives only in memory
    pub fn in_memory(id: ShardId, owned: Vec<KeyRange>, config: &ClusterConfig) -> Self {
        let term = Arc::new(ReplicationTerm::new(id.as_str()));
        let log = TransactionLog::in_memory(Arc::clone(&term));
        Self::assemble(id, owned, config, term, log, None)
    }

    /// Open the shard stored in `dir`, replaying its participant log
    ///
    /// `owned` is used when the log has never recorded an ownership set.
    pub fn open(id: ShardId, dir: &Path, owned: Vec<KeyRange>, config: &ClusterConfig) -> Result<Self> {
        let mode = config.durability_mode()?;
        let term = Arc::new(ReplicationTerm::new(id.as_str()));
        let (log, recovered) = if mode == DurabilityMode::Cache {
            (TransactionLog::in_memory(Arc::clone(&term)), None)
        } else {
            std::fs::create_dir_all(dir)?;
            let (log, recovered) = TransactionLog::open(dir, mode, Arc::clone(&term))?;
            (log, Some(recovered))
        };
        let shard = Self::assemble(id, owned, config, term, log, Some(dir.to_path_buf()));
        if let Some(recovered) = recovered {
            shard.table.recover(recovered)?;
        }
        Ok(shard)
    }

    fn assemble(
        id: ShardId,
        owned: Vec<KeyRange>,
        config: &ClusterConfig,
        term: Arc<ReplicationTerm>,
        log: TransactionLog,
        dir: Option<PathBuf>,
    ) -> Self {
        let store = Arc::new(VersionedStore::new());
        let clock = Arc::new(LogicalClock::new());
        let interlock = Arc::new(MigrationInterlock::new(id.clone(), owned));
        let table = TransactionTable::new(
            id.clone(),
            config.table_config(),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::new(PrepareConflictTracker::new()),
            Arc::clone(&interlock),
            Arc::new(log),
        );
        Self {
            id,
            term,
            store,
            clock,
            interlock,
            table,
            statement_timeout: config.statement_timeout(),
            dir,
        }
    }

    /// Shard id
    pub fn id(&self) -> &ShardId {
        &self.id
    }

    /// Replication term
    pub fn term(&self) -> &Arc<ReplicationTerm> {
        &self.term
    }

    /// Logical clock
    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    /// Multi-version store
    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    /// Migration interlock
    pub fn interlock(&self) -> &Arc<MigrationInterlock> {
        &self.interlock
    }

    /// Transaction table
    pub fn table(&self) -> &TransactionTable {
        &self.table
    }

    /// Latest timestamp this shard has issued or observed
    pub fn cluster_time(&self) -> Timestamp {
        self.clock.current()
    }

    fn observe(&self, cluster_time: Option<Timestamp>) {
        if let Some(ts) = cluster_time {
            self.clock.advance_to(ts);
        }
    }

    // ========================================================================
    // Participant commands
    // ========================================================================

    /// Run one statement of a transaction
    pub fn execute(&self, request: &StatementRequest) -> Result<StatementReply> {
        self.term.ensure_primary()?;
        request.validate()?;
        self.observe(request.cluster_time);
        let deadline = request.deadline(self.statement_timeout);
        debug!(
            target: "tessera::txn",
            shard = %self.id,
            lsid = %request.txn.lsid,
            txn_number = %request.txn.txn_number,
            command = request.statement.name(),
            start = request.start_transaction,
            "Statement"
        );
        let result = self.table.execute(
            request.txn,
            request.start_read_concern(),
            deadline,
            |ctx| command::apply(ctx, &request.statement),
        )?;
        Ok(StatementReply {
            result,
            cluster_time: self.cluster_time(),
        })
    }

    /// prepareTransaction
    pub fn prepare_transaction(&self, txn: &TxnId, cluster_time: Option<Timestamp>) -> Result<Timestamp> {
        self.term.ensure_primary()?;
        self.observe(cluster_time);
        self.table.prepare(txn, Deadline::after(self.statement_timeout))
    }

    /// commitTransaction
    pub fn commit_transaction(&self, txn: &TxnId, commit_ts: Option<Timestamp>) -> Result<Timestamp> {
        self.term.ensure_primary()?;
        self.table.commit(txn, commit_ts, Deadline::after(self.statement_timeout))
    }

    /// abortTransaction
    pub fn abort_transaction(&self, txn: &TxnId, reason: &str) -> Result<()> {
        self.term.ensure_primary()?;
        self.table.abort(txn, reason)
    }

    /// Non-transactional read of the latest committed document
    pub fn find_one(&self, key: &Key, cluster_time: Option<Timestamp>) -> Result<Option<Document>> {
        self.term.ensure_primary()?;
        self.observe(cluster_time);
        self.table.read_latest(key, Deadline::after(self.statement_timeout))
    }

    /// Merge `set` into every document of `range` as one internal transaction
    ///
    /// Returns the number of documents updated.
    pub fn update_range(&self, range: &KeyRange, set: &Document, cluster_time: Option<Timestamp>) -> Result<usize> {
        self.term.ensure_primary()?;
        self.observe(cluster_time);
        let txn = TxnId::new(Lsid::new(), TxnNumber(1));
        let deadline = Deadline::after(self.statement_timeout);
        let updated = self.table.execute(txn, Some(ReadConcern::local()), deadline, |ctx| {
            let docs = ctx.scan(range)?;
            let count = docs.len();
            for (key, doc) in docs {
                ctx.write(Mutation::put(key, command::merge(doc, set)))?;
            }
            Ok(count)
        })?;
        let committed = self.table.commit(&txn, None, deadline);
        self.table.end_session(&txn.lsid);
        committed?;
        Ok(updated)
    }

    /// Forget a session (and its children)
    pub fn end_session(&self, lsid: &Lsid) -> usize {
        self.table.end_session(lsid)
    }

    /// One reaper pass
    pub fn reap(&self) -> ReapStats {
        self.table.reap()
    }

    /// State of `txn` on this shard
    pub fn transaction_state(&self, txn: &TxnId) -> Option<TxnState> {
        self.table.state_of(txn)
    }

    // ========================================================================
    // Replication state
    // ========================================================================

    /// True while this node accepts commands
    pub fn is_primary(&self) -> bool {
        self.term.is_primary()
    }

    /// Lose primaryship: refuse commands and interrupt blocked waits
    ///
    /// Transactions keep their state; prepared ones stay prepared.
    pub fn step_down(&self) {
        self.term.step_down();
        self.table.step_down();
        warn!(target: "tessera::txn", shard = %self.id, term = self.term.current(), "Stepped down");
    }

    /// Become primary again in a new term
    pub fn step_up(&self) -> u64 {
        let term = self.term.step_up();
        self.table.step_up();
        info!(target: "tessera::txn", shard = %self.id, term, "Stepped up");
        term
    }

    /// Roll the shard back to `common_point`
    ///
    /// Aborts the process if that would undo a decision at or before
    /// `majority_point`. Otherwise the participant log, the transaction
    /// table and the store all lose what happened after the point:
    /// transactions whose commit is undone return to prepared when they
    /// prepared at or before it and are forgotten otherwise.
    pub fn rollback_to(&self, common_point: Timestamp, majority_point: Timestamp) -> Result<RollbackPlan> {
        let decided = self.table.decided_since(common_point);
        let plan = plan_or_abort(&decided, common_point, majority_point);
        let stats = self.table.rollback(common_point)?;
        let touched = self.store.rollback_to(common_point);
        warn!(
            target: "tessera::txn",
            shard = %self.id,
            common_point = %common_point,
            undone = plan.undone.len(),
            reprepared = stats.reprepared,
            forgotten = stats.forgotten,
            keys = touched,
            "Rolled back"
        );
        Ok(plan)
    }

    // ========================================================================
    // Migration hooks
    // ========================================================================

    /// Committed documents of `range` at `ts`
    pub fn snapshot_range(&self, range: &KeyRange, ts: Timestamp) -> Vec<(Key, Document)> {
        self.store.scan_at(range, ts)
    }

    /// Every stored version in `range`, tombstones included
    pub fn history_range(&self, range: &KeyRange) -> Vec<(Timestamp, Mutation)> {
        self.store.history_range(range)
    }

    /// Replace the contents of `range` with a donor's version history
    ///
    /// Versions keep the donor's timestamps. Ownership is taken separately
    /// with [`Shard::gain_range`] once the donor has committed.
    pub fn import_range(&self, range: &KeyRange, history: Vec<(Timestamp, Mutation)>) -> Result<()> {
        self.term.ensure_primary()?;
        let versions = history.len();
        self.table.import_history(range, history)?;
        info!(
            target: "tessera::migration",
            shard = %self.id,
            range = %range,
            versions,
            "Imported range"
        );
        Ok(())
    }

    /// Durably take ownership of `range`
    pub fn gain_range(&self, range: &KeyRange) -> Result<()> {
        self.term.ensure_primary()?;
        self.interlock.gain(range.clone());
        self.table.persist_ownership()
    }

    /// Delete the documents of a range this shard does not own
    pub fn drop_range(&self, range: &KeyRange) -> Result<usize> {
        self.term.ensure_primary()?;
        let deletes: Vec<Mutation> = self
            .store
            .scan_at(range, self.clock.current())
            .into_iter()
            .map(|(k, _)| Mutation::delete(k))
            .collect();
        if !deletes.is_empty() {
            self.table.apply_batch(&deletes)?;
        }
        self.table.persist_ownership()?;
        Ok(deletes.len())
    }

    /// Data directory, if the shard is persistent
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}
