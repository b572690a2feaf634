//! Prepare-conflict tracking
//!
//! When a participant prepares, every key it wrote is registered here with
//! the prepare timestamp. Until the transaction is decided:
//!
//! - a read at a timestamp at or after the prepare timestamp cannot know
//!   whether the prepared write is visible, so it waits;
//! - a write by any other transaction waits (the key is locked).
//!
//! Reads at earlier timestamps never conflict: the prepared transaction will
//! commit at or after its prepare timestamp.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tessera_core::{CancellationToken, Deadline, Error, Key, KeyRange, Result, Timestamp, TxnId};
use tracing::debug;

/// Slice used to re-check cancellation while blocked
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// How a caller wants to touch a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Snapshot read at the given timestamp
    Read(Timestamp),
    /// Write by the given transaction (None for non-transactional writers)
    Write(Option<TxnId>),
}

#[derive(Debug, Clone, Copy)]
struct PreparedKey {
    txn: TxnId,
    prepare_ts: Timestamp,
}

#[derive(Debug, Default)]
struct TrackerState {
    keys: BTreeMap<Key, PreparedKey>,
    by_txn: HashMap<TxnId, Vec<Key>>,
}

impl TrackerState {
    fn conflict(&self, key: &Key, access: Access) -> Option<PreparedKey> {
        let entry = self.keys.get(key)?;
        match access {
            Access::Read(ts) if entry.prepare_ts <= ts => Some(*entry),
            Access::Read(_) => None,
            Access::Write(Some(txn)) if txn == entry.txn => None,
            Access::Write(_) => Some(*entry),
        }
    }
}

/// Registry of keys locked by prepared transactions
#[derive(Debug, Default)]
pub struct PrepareConflictTracker {
    state: Mutex<TrackerState>,
    resolved: Condvar,
}

impl PrepareConflictTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `keys` for a prepared transaction
    pub fn register(&self, txn: TxnId, keys: impl IntoIterator<Item = Key>, prepare_ts: Timestamp) {
        let mut state = self.state.lock();
        let keys: Vec<Key> = keys.into_iter().collect();
        for key in &keys {
            state.keys.insert(key.clone(), PreparedKey { txn, prepare_ts });
        }
        state.by_txn.entry(txn).or_default().extend(keys);
    }

    /// Issue a prepare timestamp with `issue` and lock `keys` at it, atomically
    ///
    /// Readers consult the tracker under the same mutex, so a reader whose
    /// read timestamp is at or after the issued one can never miss the lock.
    pub fn register_with(
        &self,
        txn: TxnId,
        keys: impl IntoIterator<Item = Key>,
        issue: impl FnOnce() -> Timestamp,
    ) -> Timestamp {
        let mut state = self.state.lock();
        let prepare_ts = issue();
        let keys: Vec<Key> = keys.into_iter().collect();
        for key in &keys {
            state.keys.insert(key.clone(), PreparedKey { txn, prepare_ts });
        }
        state.by_txn.entry(txn).or_default().extend(keys);
        prepare_ts
    }

    /// Release every key of `txn` and wake all waiters
    pub fn release(&self, txn: &TxnId) -> Vec<Key> {
        let released = {
            let mut state = self.state.lock();
            let keys = state.by_txn.remove(txn).unwrap_or_default();
            for key in &keys {
                if state.keys.get(key).map_or(false, |e| e.txn == *txn) {
                    state.keys.remove(key);
                }
            }
            keys
        };
        self.resolved.notify_all();
        released
    }

    /// Prepared transaction that `access` to `key` would conflict with
    pub fn conflicting(&self, key: &Key, access: Access) -> Option<TxnId> {
        self.state.lock().conflict(key, access).map(|e| e.txn)
    }

    /// Block until `access` to `key` no longer conflicts
    ///
    /// Fails with `MaxTimeMSExpired` at the deadline, or with the token's
    /// error when cancelled.
    pub fn wait_until_clear(
        &self,
        key: &Key,
        access: Access,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let mut logged = false;
        loop {
            cancel.check("waiting on prepare conflict")?;
            let entry = match state.conflict(key, access) {
                None => return Ok(()),
                Some(entry) => entry,
            };
            if !logged {
                debug!(
                    target: "tessera::txn",
                    key = %key,
                    prepared_txn = %entry.txn,
                    prepare_ts = %entry.prepare_ts,
                    "Waiting on prepare conflict"
                );
                logged = true;
            }
            if deadline.expired() {
                return Err(Error::MaxTimeMSExpired(format!(
                    "prepare conflict on key {} with transaction {} prepared at {}",
                    key, entry.txn, entry.prepare_ts
                )));
            }
            self.resolved
                .wait_for(&mut state, deadline.remaining(WAIT_SLICE));
        }
    }

    /// Wake every waiter so it re-checks cancellation (used on stepdown)
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.resolved.notify_all();
    }

    /// Prepared keys intersecting `range`, with their owners
    pub fn prepared_in_range(&self, range: &KeyRange) -> Vec<(Key, TxnId)> {
        let state = self.state.lock();
        state
            .keys
            .range(range.start.clone()..)
            .take_while(|(k, _)| range.contains(k))
            .map(|(k, e)| (k.clone(), e.txn))
            .collect()
    }

    /// Number of prepared transactions holding keys
    pub fn prepared_count(&self) -> usize {
        self.state.lock().by_txn.len()
    }
}
