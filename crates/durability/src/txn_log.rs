//! Participant transaction log
//!
//! Every durable step of a shard's transactions is one entry:
//!
//! | Entry | Written when |
//! |-------|--------------|
//! | `Prepared` | prepareTransaction (before the prepare timestamp is returned) |
//! | `Committed` | commit of a prepared or single-phase transaction |
//! | `Aborted` | abort of a prepared transaction |
//! | `Applied` | non-transactional batch (range drop, plain writes) |
//! | `Imported` | version history of a range received from a migration donor |
//! | `Ownership` | owned range set changed |
//! | `Reaped` | terminal transaction forgotten by the reaper |
//!
//! Aborts of never-prepared transactions have nothing to undo and are not
//! logged.
//!
//! ## Recovery
//!
//! `replay` folds the entries into a [`RecoveredLog`]: store changes in log
//! order, transactions still prepared (they must be reinstated with their
//! barriers), terminal outcomes kept for idempotent retries, the last
//! ownership set, and the highest timestamp seen so the logical clock can
//! resume above it.
//!
//! ## Rollback
//!
//! [`TransactionLog::truncate_after`] rewrites the log without anything
//! that happened after a common point, so a restart replays the rolled
//! back state.

use crate::error::LogError;
use crate::log::RecordLog;
use crate::mode::DurabilityMode;
use crate::term::ReplicationTerm;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tessera_core::{KeyRange, Mutation, Result, Timestamp, TxnId, TxnState};
use tracing::{debug, info};

/// File name of the participant log inside a shard's directory
pub const TXN_LOG_FILE: &str = "txn.log";

/// One durable step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxnLogEntry {
    /// Transaction prepared with its full write set
    Prepared {
        /// Transaction
        txn: TxnId,
        /// Snapshot the transaction read at
        read_ts: Timestamp,
        /// Issued prepare timestamp
        prepare_ts: Timestamp,
        /// Buffered writes
        writes: Vec<Mutation>,
    },
    /// Transaction committed
    Committed {
        /// Transaction
        txn: TxnId,
        /// Visibility timestamp
        commit_ts: Timestamp,
        /// Writes for single-phase commits; empty when prepared (already logged)
        writes: Vec<Mutation>,
        /// True if a `Prepared` entry precedes this one
        was_prepared: bool,
    },
    /// Prepared transaction aborted
    Aborted {
        /// Transaction
        txn: TxnId,
        /// Reason
        reason: String,
    },
    /// Non-transactional batch installed at `ts`
    Applied {
        /// Timestamp of the batch
        ts: Timestamp,
        /// Mutations
        writes: Vec<Mutation>,
    },
    /// Versions of a range copied from a migration donor, at the donor's
    /// timestamps; they replace whatever the range held
    Imported {
        /// Range received
        range: KeyRange,
        /// Versions by key, oldest first; tombstones included
        versions: Vec<(Timestamp, Mutation)>,
    },
    /// Full owned range set after a change
    Ownership {
        /// Owned ranges
        ranges: Vec<KeyRange>,
    },
    /// Terminal transaction dropped from the table
    Reaped {
        /// Transaction
        txn: TxnId,
    },
}

/// Prepared transaction awaiting its decision after a restart
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredPrepared {
    /// Transaction
    pub txn: TxnId,
    /// Snapshot it read at
    pub read_ts: Timestamp,
    /// Prepare timestamp
    pub prepare_ts: Timestamp,
    /// Writes to apply on commit
    pub writes: Vec<Mutation>,
}

/// One change to the document store, as replayed
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// Mutations installed at one timestamp
    Batch(Timestamp, Vec<Mutation>),
    /// History that replaces the contents of a range
    Import {
        /// Range replaced
        range: KeyRange,
        /// Versions by key, oldest first
        versions: Vec<(Timestamp, Mutation)>,
    },
}

/// State rebuilt from a participant log
#[derive(Debug, Default)]
pub struct RecoveredLog {
    /// Store changes in log order
    pub changes: Vec<StoreChange>,
    /// Transactions prepared but not yet decided
    pub prepared: Vec<RecoveredPrepared>,
    /// Terminal outcomes that were not reaped
    pub outcomes: Vec<(TxnId, TxnState)>,
    /// Prepare entries of committed outcomes, for rollback
    pub committed_prepares: Vec<RecoveredPrepared>,
    /// Last logged ownership set, if ownership was ever logged
    pub ownership: Option<Vec<KeyRange>>,
    /// Highest timestamp in any entry
    pub max_timestamp: Timestamp,
}

/// Fold log entries into recovered state
pub fn replay(entries: Vec<TxnLogEntry>) -> RecoveredLog {
    let mut recovered = RecoveredLog::default();
    let mut prepared: BTreeMap<TxnId, RecoveredPrepared> = BTreeMap::new();
    let mut outcomes: BTreeMap<TxnId, TxnState> = BTreeMap::new();
    let mut committed_prepares: BTreeMap<TxnId, RecoveredPrepared> = BTreeMap::new();

    for entry in entries {
        match entry {
            TxnLogEntry::Prepared {
                txn,
                read_ts,
                prepare_ts,
                writes,
            } => {
                recovered.max_timestamp = recovered.max_timestamp.max(prepare_ts);
                prepared.insert(
                    txn,
                    RecoveredPrepared {
                        txn,
                        read_ts,
                        prepare_ts,
                        writes,
                    },
                );
            }
            TxnLogEntry::Committed {
                txn,
                commit_ts,
                writes,
                was_prepared,
            } => {
                recovered.max_timestamp = recovered.max_timestamp.max(commit_ts);
                let writes = match prepared.remove(&txn) {
                    Some(p) => {
                        let writes = p.writes.clone();
                        committed_prepares.insert(txn, p);
                        writes
                    }
                    None => writes,
                };
                if !writes.is_empty() {
                    recovered.changes.push(StoreChange::Batch(commit_ts, writes));
                }
                outcomes.insert(
                    txn,
                    TxnState::Committed {
                        commit_timestamp: commit_ts,
                        was_prepared,
                    },
                );
            }
            TxnLogEntry::Aborted { txn, reason } => {
                let was_prepared = prepared.remove(&txn).is_some();
                outcomes.insert(
                    txn,
                    TxnState::Aborted {
                        reason,
                        was_prepared,
                    },
                );
            }
            TxnLogEntry::Applied { ts, writes } => {
                recovered.max_timestamp = recovered.max_timestamp.max(ts);
                recovered.changes.push(StoreChange::Batch(ts, writes));
            }
            TxnLogEntry::Imported { range, versions } => {
                if let Some(max) = versions.iter().map(|(ts, _)| *ts).max() {
                    recovered.max_timestamp = recovered.max_timestamp.max(max);
                }
                recovered.changes.push(StoreChange::Import { range, versions });
            }
            TxnLogEntry::Ownership { ranges } => {
                recovered.ownership = Some(ranges);
            }
            TxnLogEntry::Reaped { txn } => {
                outcomes.remove(&txn);
                committed_prepares.remove(&txn);
            }
        }
    }

    recovered.prepared = prepared.into_values().collect();
    recovered.outcomes = outcomes.into_iter().collect();
    recovered.committed_prepares = committed_prepares.into_values().collect();
    recovered
}

/// Durable log of one shard's transaction steps
#[derive(Debug)]
pub struct TransactionLog {
    log: Mutex<RecordLog<TxnLogEntry>>,
    term: Arc<ReplicationTerm>,
}

impl TransactionLog {
    /// Log that keeps nothing across restarts
    pub fn in_memory(term: Arc<ReplicationTerm>) -> Self {
        Self {
            log: Mutex::new(RecordLog::in_memory()),
            term,
        }
    }

    /// Open the log in `dir` and replay it
    pub fn open(
        dir: &Path,
        mode: DurabilityMode,
        term: Arc<ReplicationTerm>,
    ) -> std::result::Result<(Self, RecoveredLog), LogError> {
        let (log, entries) = RecordLog::open(&dir.join(TXN_LOG_FILE), mode)?;
        let entry_count = entries.len();
        let recovered = replay(entries);
        if entry_count > 0 {
            info!(
                target: "tessera::durability",
                entries = entry_count,
                changes = recovered.changes.len(),
                prepared = recovered.prepared.len(),
                max_ts = %recovered.max_timestamp,
                "Replayed participant transaction log"
            );
        }
        Ok((
            Self {
                log: Mutex::new(log),
                term,
            },
            recovered,
        ))
    }

    /// Durably append `entry`
    ///
    /// Refused with `NotWritablePrimary` after a stepdown.
    pub fn append(&self, entry: &TxnLogEntry) -> Result<()> {
        let mut log = self.log.lock();
        self.term.ensure_primary()?;
        log.append(entry)?;
        debug!(target: "tessera::durability", entry = entry_name(entry), "Logged transaction step");
        Ok(())
    }

    /// Force pending appends to disk
    pub fn sync(&self) -> Result<()> {
        self.log.lock().sync()?;
        Ok(())
    }

    /// Entries appended since open
    pub fn appended(&self) -> u64 {
        self.log.lock().appended()
    }

    /// Drop every step taken after `common_point`
    ///
    /// Commits, prepares and batches stamped later are removed, along with
    /// the abort of any removed prepare, and imported versions newer than
    /// the point are cut. A transaction prepared at or before the point
    /// whose commit is removed replays as prepared. Returns the number of
    /// entries removed; logs without a file have nothing to rewrite.
    pub fn truncate_after(&self, common_point: Timestamp) -> Result<usize> {
        let mut log = self.log.lock();
        let entries = log.records()?;
        let before = entries.len();
        let kept = retain_until(entries, common_point);
        let removed = before - kept.len();
        if removed > 0 {
            log.rewrite(&kept)?;
        }
        info!(
            target: "tessera::durability",
            common_point = %common_point,
            removed,
            "Truncated participant log"
        );
        Ok(removed)
    }
}

/// Entries that remain after a rollback to `common_point`
fn retain_until(entries: Vec<TxnLogEntry>, common_point: Timestamp) -> Vec<TxnLogEntry> {
    let mut undone_prepares: BTreeSet<TxnId> = BTreeSet::new();
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            TxnLogEntry::Prepared { txn, prepare_ts, .. } if prepare_ts > common_point => {
                undone_prepares.insert(txn);
            }
            TxnLogEntry::Committed { commit_ts, .. } if commit_ts > common_point => {}
            TxnLogEntry::Aborted { txn, .. } if undone_prepares.contains(&txn) => {}
            TxnLogEntry::Applied { ts, .. } if ts > common_point => {}
            TxnLogEntry::Imported { range, versions } => kept.push(TxnLogEntry::Imported {
                range,
                versions: versions.into_iter().filter(|(ts, _)| *ts <= common_point).collect(),
            }),
            other => kept.push(other),
        }
    }
    kept
}

fn entry_name(entry: &TxnLogEntry) -> &'static str {
    match entry {
        TxnLogEntry::Prepared { .. } => "prepared",
        TxnLogEntry::Committed { .. } => "committed",
        TxnLogEntry::Aborted { .. } => "aborted",
        TxnLogEntry::Applied { .. } => "applied",
        TxnLogEntry::Imported { .. } => "imported",
        TxnLogEntry::Ownership { .. } => "ownership",
        TxnLogEntry::Reaped { .. } => "reaped",
    }
}
