//! Participant-side transaction record and state machine
//!
//! `TransactionRecord` holds everything a shard knows about one
//! transaction: its state, the snapshot it reads at and the writes it has
//! buffered. The methods here only decide what a request means for the
//! current state; the side effects (logging, applying, releasing locks) are
//! performed by [`crate::table::TransactionTable`].
//!
//! ## State transitions
//!
//! ```text
//!             prepare                  commit(ts >= prepare_ts)
//! InProgress ---------> Prepared --------------------------------> Committed
//!     |   \                 |
//!     |    \ commit()       | abort (coordinator)
//!     |     \ single-phase  v
//!     |      ----------> Committed      Aborted
//!     | abort / implicit abort / expiry / fatal statement error
//!     v
//!  Aborted
//! ```
//!
//! Terminal states are sticky. Identical retries succeed without side
//! effects. Conflicting requests on a transaction that went through prepare
//! are refused with `ConflictingDecision`.

use std::collections::BTreeMap;
use std::time::Instant;
use tessera_core::{
    Document, Error, Key, KeyRange, Mutation, ReadConcern, Result, Timestamp, TxnId, TxnState,
};

/// What a prepare request must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareAction {
    /// Already prepared; answer with the original timestamp
    AlreadyPrepared(Timestamp),
    /// Run the prepare
    Prepare,
}

/// What a commit request must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Already committed at this timestamp
    AlreadyCommitted(Timestamp),
    /// Commit an unprepared transaction at a fresh timestamp
    SinglePhase,
    /// Commit a prepared transaction at the given timestamp
    CommitPrepared(Timestamp),
}

/// What an abort request must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// Already aborted
    AlreadyAborted,
    /// Drop buffered writes of an unprepared transaction
    AbortInProgress,
    /// Log the abort and release the prepare barrier
    AbortPrepared,
}

/// Write set and prepare timestamp of a prepared transaction that has
/// since committed; a rollback past the commit restores it
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    /// Prepare timestamp
    pub prepare_ts: Timestamp,
    /// Writes the transaction applied at commit
    pub writes: Vec<Mutation>,
}

/// One transaction as seen by a participant
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    /// Transaction identity
    pub txn: TxnId,
    /// Lifecycle state
    pub state: TxnState,
    /// Read concern fixed by the first statement
    pub read_concern: ReadConcern,
    /// Snapshot all reads use
    pub read_ts: Timestamp,
    /// When the first statement arrived
    pub started_at: Instant,
    /// Set on commit of a prepared transaction
    pub prepared_image: Option<PreparedImage>,
    writes: BTreeMap<Key, Option<Document>>,
    bytes: usize,
}

impl TransactionRecord {
    /// New in-progress transaction reading at `read_ts`
    pub fn new(txn: TxnId, read_concern: ReadConcern, read_ts: Timestamp) -> Self {
        Self {
            txn,
            state: TxnState::InProgress,
            read_concern,
            read_ts,
            started_at: Instant::now(),
            prepared_image: None,
            writes: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Record of a transaction reinstated from the participant log
    pub fn recovered(txn: TxnId, state: TxnState, read_ts: Timestamp, writes: Vec<Mutation>) -> Self {
        let mut record = Self::new(txn, ReadConcern::local(), read_ts);
        for m in writes {
            record.buffer(m);
        }
        record.state = state;
        record
    }

    /// Buffered value of `key`: `Some(None)` for a buffered delete,
    /// `None` if the transaction has not written the key
    pub fn buffered(&self, key: &Key) -> Option<Option<&Document>> {
        self.writes.get(key).map(|v| v.as_ref())
    }

    /// Buffer a write; returns the change in footprint (may be negative)
    pub fn buffer(&mut self, mutation: Mutation) -> isize {
        let added = mutation.footprint();
        let removed = self
            .writes
            .get(&mutation.key)
            .map_or(0, |old| mutation.key.footprint() + old.as_ref().map_or(0, |v| v.to_string().len()));
        self.writes.insert(mutation.key, mutation.value);
        self.bytes = self.bytes + added - removed;
        added as isize - removed as isize
    }

    /// Footprint a new write would add, without buffering it
    pub fn footprint_after(&self, mutation: &Mutation) -> usize {
        let removed = self
            .writes
            .get(&mutation.key)
            .map_or(0, |old| mutation.key.footprint() + old.as_ref().map_or(0, |v| v.to_string().len()));
        self.bytes + mutation.footprint() - removed
    }

    /// Buffered writes as mutations, in key order
    pub fn mutations(&self) -> Vec<Mutation> {
        self.writes
            .iter()
            .map(|(key, value)| Mutation {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Keys written by the transaction (its lock set once prepared)
    pub fn write_keys(&self) -> Vec<Key> {
        self.writes.keys().cloned().collect()
    }

    /// Buffered writes inside `range`, in key order
    pub fn writes_in(&self, range: &KeyRange) -> Vec<(Key, Option<Document>)> {
        self.writes
            .range(range.start.clone()..)
            .take_while(|(k, _)| range.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// True if nothing was written
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Footprint of buffered writes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Drop buffered writes; returns the footprint released
    pub fn clear_writes(&mut self) -> usize {
        self.writes.clear();
        std::mem::take(&mut self.bytes)
    }

    /// Prepare timestamp, if prepared
    pub fn prepare_ts(&self) -> Option<Timestamp> {
        match self.state {
            TxnState::Prepared { prepare_timestamp } => Some(prepare_timestamp),
            _ => None,
        }
    }

    /// True if the transaction went through prepare
    pub fn was_prepared(&self) -> bool {
        match &self.state {
            TxnState::InProgress => false,
            TxnState::Prepared { .. } => true,
            TxnState::Committed { was_prepared, .. } | TxnState::Aborted { was_prepared, .. } => {
                *was_prepared
            }
        }
    }

    /// Check that a statement may run
    pub fn check_statement(&self) -> Result<()> {
        match &self.state {
            TxnState::InProgress => Ok(()),
            TxnState::Prepared { .. } => Err(Error::PreparedTransactionInProgress(self.txn)),
            TxnState::Committed { .. } => Err(Error::TransactionCommitted(self.txn)),
            TxnState::Aborted { reason, .. } => Err(Error::no_such_transaction(
                self.txn,
                format!("transaction was aborted: {}", reason),
            )),
        }
    }

    /// Decide what a prepare request means
    pub fn prepare_action(&self) -> Result<PrepareAction> {
        match &self.state {
            TxnState::InProgress => Ok(PrepareAction::Prepare),
            TxnState::Prepared { prepare_timestamp } => {
                Ok(PrepareAction::AlreadyPrepared(*prepare_timestamp))
            }
            TxnState::Committed { .. } => Err(Error::TransactionCommitted(self.txn)),
            TxnState::Aborted { reason, .. } => Err(Error::no_such_transaction(
                self.txn,
                format!("transaction was aborted: {}", reason),
            )),
        }
    }

    /// Decide what a commit request means
    ///
    /// `commit_ts` is required for prepared transactions and forbidden for
    /// unprepared ones.
    pub fn commit_action(&self, commit_ts: Option<Timestamp>) -> Result<CommitAction> {
        match &self.state {
            TxnState::InProgress => match commit_ts {
                None => Ok(CommitAction::SinglePhase),
                Some(ts) => Err(Error::invalid_options(format!(
                    "commitTimestamp {} given for unprepared transaction {}",
                    ts, self.txn
                ))),
            },
            TxnState::Prepared { prepare_timestamp } => match commit_ts {
                None => Err(Error::invalid_options(format!(
                    "commitTimestamp required for prepared transaction {}",
                    self.txn
                ))),
                Some(ts) if ts < *prepare_timestamp => Err(Error::invalid_options(format!(
                    "commitTimestamp {} is before prepareTimestamp {}",
                    ts, prepare_timestamp
                ))),
                Some(ts) => Ok(CommitAction::CommitPrepared(ts)),
            },
            TxnState::Committed {
                commit_timestamp,
                was_prepared,
            } => match commit_ts {
                Some(ts) if *was_prepared && ts != *commit_timestamp => Err(Error::ConflictingDecision {
                    txn: self.txn,
                    existing: format!("commit at {}", commit_timestamp),
                    requested: format!("commit at {}", ts),
                }),
                _ => Ok(CommitAction::AlreadyCommitted(*commit_timestamp)),
            },
            TxnState::Aborted {
                reason,
                was_prepared: true,
            } => Err(Error::ConflictingDecision {
                txn: self.txn,
                existing: format!("abort ({})", reason),
                requested: "commit".into(),
            }),
            TxnState::Aborted { reason, .. } => Err(Error::no_such_transaction(
                self.txn,
                format!("transaction was aborted: {}", reason),
            )),
        }
    }

    /// Decide what an abort request means
    pub fn abort_action(&self) -> Result<AbortAction> {
        match &self.state {
            TxnState::InProgress => Ok(AbortAction::AbortInProgress),
            TxnState::Prepared { .. } => Ok(AbortAction::AbortPrepared),
            TxnState::Aborted { .. } => Ok(AbortAction::AlreadyAborted),
            TxnState::Committed {
                commit_timestamp,
                was_prepared: true,
            } => Err(Error::ConflictingDecision {
                txn: self.txn,
                existing: format!("commit at {}", commit_timestamp),
                requested: "abort".into(),
            }),
            TxnState::Committed { .. } => Err(Error::TransactionCommitted(self.txn)),
        }
    }

    /// InProgress -> Prepared
    pub fn mark_prepared(&mut self, prepare_timestamp: Timestamp) {
        debug_assert!(matches!(self.state, TxnState::InProgress));
        self.state = TxnState::Prepared { prepare_timestamp };
    }

    /// InProgress | Prepared -> Committed
    pub fn mark_committed(&mut self, commit_timestamp: Timestamp) {
        debug_assert!(!self.state.is_terminal());
        let was_prepared = self.was_prepared();
        self.state = TxnState::Committed {
            commit_timestamp,
            was_prepared,
        };
    }

    /// InProgress | Prepared -> Aborted
    pub fn mark_aborted(&mut self, reason: impl Into<String>) {
        debug_assert!(!self.state.is_terminal());
        let was_prepared = self.was_prepared();
        self.state = TxnState::Aborted {
            reason: reason.into(),
            was_prepared,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{Lsid, TxnNumber};

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_raw(n)
    }

    fn record() -> TransactionRecord {
        TransactionRecord::new(TxnId::new(Lsid::new(), TxnNumber(1)), ReadConcern::local(), ts(1))
    }

    #[test]
    fn test_buffer_tracks_latest_write_and_footprint() {
        let mut rec = record();
        rec.buffer(Mutation::put(Key::int(1), json!("a")));
        let first = rec.bytes();
        rec.buffer(Mutation::put(Key::int(1), json!("abcdef")));
        assert!(rec.bytes() > first);
        rec.buffer(Mutation::delete(Key::int(1)));
        assert_eq!(rec.bytes(), Key::int(1).footprint());
        assert_eq!(rec.buffered(&Key::int(1)), Some(None));
        assert_eq!(rec.buffered(&Key::int(2)), None);
        assert_eq!(rec.mutations(), vec![Mutation::delete(Key::int(1))]);
    }

    #[test]
    fn test_footprint_after_matches_buffer() {
        let mut rec = record();
        rec.buffer(Mutation::put(Key::int(1), json!({"x": 1})));
        let m = Mutation::put(Key::int(1), json!({"x": 100000}));
        let predicted = rec.footprint_after(&m);
        rec.buffer(m);
        assert_eq!(predicted, rec.bytes());
    }

    #[test]
    fn test_prepare_retry_returns_original_timestamp() {
        let mut rec = record();
        assert_eq!(rec.prepare_action().unwrap(), PrepareAction::Prepare);
        rec.mark_prepared(ts(7));
        assert_eq!(rec.prepare_action().unwrap(), PrepareAction::AlreadyPrepared(ts(7)));
    }

    #[test]
    fn test_commit_timestamp_rules() {
        let mut rec = record();
        assert!(matches!(rec.commit_action(Some(ts(3))), Err(Error::InvalidOptions(_))));
        assert_eq!(rec.commit_action(None).unwrap(), CommitAction::SinglePhase);

        rec.mark_prepared(ts(10));
        assert!(matches!(rec.commit_action(None), Err(Error::InvalidOptions(_))));
        assert!(matches!(rec.commit_action(Some(ts(9))), Err(Error::InvalidOptions(_))));
        assert_eq!(
            rec.commit_action(Some(ts(12))).unwrap(),
            CommitAction::CommitPrepared(ts(12))
        );
    }

    #[test]
    fn test_decided_prepared_transaction_refuses_other_decision() {
        let mut rec = record();
        rec.mark_prepared(ts(10));
        rec.mark_committed(ts(12));
        assert_eq!(
            rec.commit_action(Some(ts(12))).unwrap(),
            CommitAction::AlreadyCommitted(ts(12))
        );
        assert!(matches!(
            rec.commit_action(Some(ts(13))),
            Err(Error::ConflictingDecision { .. })
        ));
        assert!(matches!(rec.abort_action(), Err(Error::ConflictingDecision { .. })));

        let mut rec = record();
        rec.mark_prepared(ts(10));
        rec.mark_aborted("coordinator abort");
        assert_eq!(rec.abort_action().unwrap(), AbortAction::AlreadyAborted);
        assert!(matches!(
            rec.commit_action(Some(ts(10))),
            Err(Error::ConflictingDecision { .. })
        ));
    }

    #[test]
    fn test_unprepared_terminal_states_use_client_codes() {
        let mut rec = record();
        rec.mark_committed(ts(4));
        assert!(matches!(rec.abort_action(), Err(Error::TransactionCommitted(_))));
        assert!(matches!(rec.check_statement(), Err(Error::TransactionCommitted(_))));

        let mut rec = record();
        rec.mark_aborted("client abort");
        assert!(matches!(rec.commit_action(None), Err(Error::NoSuchTransaction { .. })));
        assert!(matches!(rec.check_statement(), Err(Error::NoSuchTransaction { .. })));
        assert!(!rec.was_prepared());
    }

    #[test]
    fn test_prepared_rejects_statements() {
        let mut rec = record();
        rec.mark_prepared(ts(2));
        assert!(matches!(
            rec.check_statement(),
            Err(Error::PreparedTransactionInProgress(_))
        ));
        assert_eq!(rec.abort_action().unwrap(), AbortAction::AbortPrepared);
    }
}
