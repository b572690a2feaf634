//! Migration/transaction interlock
//!
//! Serializes range-ownership changes against transactions on one shard.
//!
//! ## Phases
//!
//! ```text
//! NotStarted -> Cloning -> Blocking -> Committed
//!                   \          \
//!                    `----------`---> Aborted
//! ```
//!
//! - `Cloning`: the range is copied out; statements and prepares proceed.
//! - Entering `Blocking` first stops new prepares on the range, then waits
//!   until no prepared lock set intersects it. The wait is bounded and
//!   cancellable; on timeout the migration gets `LockTimeout`.
//! - `Blocking`: new statements and prepares on the range wait for release.
//! - `Committed`: the range left this shard. Waiters and later requests
//!   fail with the kind-specific error.
//! - `Aborted`: waiters proceed as if nothing happened.
//!
//! The interlock also owns the shard's set of owned ranges, so ownership
//! checks and the critical section are decided under one mutex.
//!
//! Only the most recent finished migrations are remembered. Departed
//! ranges are kept disjoint, so neither map grows with the number of
//! migrations a long-lived shard has seen.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tessera_core::{
    CancellationToken, Deadline, Error, Key, KeyRange, Result, ShardId, TxnId,
};
use tracing::{debug, info, warn};

const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Finished migrations kept for `phase` lookups
const RETAINED_FINISHED: usize = 64;

/// Identity of one range-owning operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationId(pub u64);

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migration-{}", self.0)
    }
}

/// Kind of range-owning operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationKind {
    /// Moving a chunk between shards
    ChunkMigration,
    /// Handing a tenant's data to another replica set
    TenantMigration,
    /// Resharding critical section
    Resharding,
}

impl MigrationKind {
    /// Error seen by requests for a range this kind of operation moved away
    pub fn committed_error(&self, shard: &ShardId, range: &KeyRange) -> Error {
        match self {
            MigrationKind::ChunkMigration => Error::StaleConfig {
                shard: shard.clone(),
                message: format!("range {} migrated away", range),
            },
            MigrationKind::TenantMigration => Error::TenantMigrationCommitted(range.clone()),
            MigrationKind::Resharding => Error::ReshardCollectionCommitted(range.clone()),
        }
    }
}

/// Phase of a range-owning operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// Unknown to this shard
    NotStarted,
    /// Copying data; no blocking
    Cloning,
    /// Critical section held
    Blocking,
    /// Range handed over
    Committed,
    /// Given up; range stays
    Aborted,
}

impl MigrationPhase {
    /// True for Committed and Aborted
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Committed | MigrationPhase::Aborted)
    }
}

/// One range held by a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeLockEntry {
    /// Owner
    pub id: MigrationId,
    /// Locked range
    pub range: KeyRange,
    /// Kind of operation
    pub kind: MigrationKind,
    /// Current phase
    pub phase: MigrationPhase,
    /// When the critical section was entered
    pub blocked_since: Option<Instant>,
    /// Entering the critical section; new prepares on the range wait
    draining: bool,
}

impl RangeLockEntry {
    fn blocks_statements(&self) -> bool {
        self.phase == MigrationPhase::Blocking
    }

    fn blocks_prepares(&self) -> bool {
        self.phase == MigrationPhase::Blocking || (self.draining && self.phase == MigrationPhase::Cloning)
    }
}

#[derive(Debug, Default)]
struct InterlockState {
    owned: Vec<KeyRange>,
    migrations: BTreeMap<MigrationId, RangeLockEntry>,
    prepared: HashMap<TxnId, Vec<Key>>,
    departed: Vec<(KeyRange, MigrationKind)>,
}

impl InterlockState {
    fn prepared_intersects(&self, range: &KeyRange) -> Option<TxnId> {
        self.prepared
            .iter()
            .find(|(_, keys)| keys.iter().any(|k| range.contains(k)))
            .map(|(txn, _)| *txn)
    }

    fn blocking_entry(&self, keys: &[Key], for_prepare: bool) -> Option<&RangeLockEntry> {
        self.migrations.values().find(|e| {
            let blocks = if for_prepare {
                e.blocks_prepares()
            } else {
                e.blocks_statements()
            };
            blocks && keys.iter().any(|k| e.range.contains(k))
        })
    }

    fn ownership_error(&self, shard: &ShardId, key: &Key) -> Option<Error> {
        if self.owned.iter().any(|r| r.contains(key)) {
            return None;
        }
        if let Some((range, kind)) = self.departed.iter().find(|(r, _)| r.contains(key)) {
            return Some(kind.committed_error(shard, range));
        }
        Some(Error::StaleConfig {
            shard: shard.clone(),
            message: format!("key {} is not owned by this shard", key),
        })
    }

    fn prune_finished(&mut self) {
        let finished: Vec<MigrationId> = self
            .migrations
            .values()
            .filter(|e| e.phase.is_terminal())
            .map(|e| e.id)
            .collect();
        let excess = finished.len().saturating_sub(RETAINED_FINISHED);
        for id in &finished[..excess] {
            self.migrations.remove(id);
        }
    }

    fn depart(&mut self, range: &KeyRange, kind: MigrationKind) {
        let mut departed = cut_departed(&self.departed, range);
        departed.push((range.clone(), kind));
        self.departed = merge_departed(departed);
    }

    fn owns_range(&self, range: &KeyRange) -> bool {
        self.owned.iter().any(|r| {
            r.start <= range.start
                && match (&r.end, &range.end) {
                    (None, _) => true,
                    (Some(_), None) => false,
                    (Some(owned_end), Some(end)) => end <= owned_end,
                }
        })
    }
}

/// Remove `cut` from every range in `ranges`
fn subtract(ranges: &[KeyRange], cut: &KeyRange) -> Vec<KeyRange> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for r in ranges {
        if !r.intersects(cut) {
            out.push(r.clone());
            continue;
        }
        if r.start < cut.start {
            out.push(KeyRange::new(r.start.clone(), cut.start.clone()));
        }
        if let Some(cut_end) = &cut.end {
            let keeps_right = r.end.as_ref().map_or(true, |end| cut_end < end);
            if keeps_right {
                out.push(KeyRange {
                    start: cut_end.clone(),
                    end: r.end.clone(),
                });
            }
        }
    }
    out
}

/// Sort `ranges` and merge the ones that touch or overlap
fn normalize(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.sort_by(|a, b| a.start.cmp(&b.start));
    let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        if let Some(last) = out.last_mut() {
            let touches = last.end.as_ref().map_or(true, |end| r.start <= *end);
            if touches {
                last.end = match (&last.end, &r.end) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) => Some(a.max(b).clone()),
                };
                continue;
            }
        }
        out.push(r);
    }
    out
}

/// Remove `cut` from every departed range, keeping each piece's kind
fn cut_departed(departed: &[(KeyRange, MigrationKind)], cut: &KeyRange) -> Vec<(KeyRange, MigrationKind)> {
    departed
        .iter()
        .flat_map(|(r, kind)| {
            subtract(std::slice::from_ref(r), cut)
                .into_iter()
                .map(move |piece| (piece, *kind))
        })
        .collect()
}

/// Merge touching departed ranges of the same kind, ordered by start
fn merge_departed(departed: Vec<(KeyRange, MigrationKind)>) -> Vec<(KeyRange, MigrationKind)> {
    let mut by_kind: HashMap<MigrationKind, Vec<KeyRange>> = HashMap::new();
    for (r, kind) in departed {
        by_kind.entry(kind).or_default().push(r);
    }
    let mut out: Vec<(KeyRange, MigrationKind)> = by_kind
        .into_iter()
        .flat_map(|(kind, ranges)| normalize(ranges).into_iter().map(move |r| (r, kind)))
        .collect();
    out.sort_by(|a, b| a.0.start.cmp(&b.0.start));
    out
}

/// Per-shard interlock between migrations and transactions
#[derive(Debug)]
pub struct MigrationInterlock {
    shard: ShardId,
    state: Mutex<InterlockState>,
    changed: Condvar,
}

impl MigrationInterlock {
    /// Interlock for `shard`, which initially owns `owned`
    pub fn new(shard: ShardId, owned: Vec<KeyRange>) -> Self {
        Self {
            shard,
            state: Mutex::new(InterlockState {
                owned: normalize(owned),
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    // ========================================================================
    // Ownership
    // ========================================================================

    /// Ranges this shard owns
    pub fn owned_ranges(&self) -> Vec<KeyRange> {
        self.state.lock().owned.clone()
    }

    /// Replace the owned set (recovery)
    pub fn set_owned(&self, owned: Vec<KeyRange>) {
        self.state.lock().owned = normalize(owned);
        self.changed.notify_all();
    }

    /// True if `key` is owned here
    pub fn owns(&self, key: &Key) -> bool {
        self.state.lock().owned.iter().any(|r| r.contains(key))
    }

    /// Fail with the ownership error of the first key not owned here
    pub fn check_owned<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> Result<()> {
        let state = self.state.lock();
        for key in keys {
            if let Some(err) = state.ownership_error(&self.shard, key) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Take ownership of `range` (recipient side of a committed migration)
    pub fn gain(&self, range: KeyRange) {
        let mut state = self.state.lock();
        state.departed = cut_departed(&state.departed, &range);
        let mut owned = std::mem::take(&mut state.owned);
        owned.push(range.clone());
        state.owned = normalize(owned);
        drop(state);
        info!(target: "tessera::interlock", shard = %self.shard, range = %range, "Gained range ownership");
        self.changed.notify_all();
    }

    // ========================================================================
    // Migrations
    // ========================================================================

    /// Register a migration of `range`; it starts in `Cloning`
    pub fn begin(&self, id: MigrationId, range: KeyRange, kind: MigrationKind) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.migrations.get(&id) {
            if existing.range == range && !existing.phase.is_terminal() {
                return Ok(());
            }
            return Err(Error::BadValue(format!("{} was already used", id)));
        }
        if let Some(busy) = state
            .migrations
            .values()
            .find(|e| !e.phase.is_terminal() && e.range.intersects(&range))
        {
            return Err(Error::LockTimeout(format!(
                "range {} is held by {}",
                range, busy.id
            )));
        }
        if !state.owns_range(&range) {
            return Err(Error::StaleConfig {
                shard: self.shard.clone(),
                message: format!("cannot migrate {}: not owned", range),
            });
        }
        state.migrations.insert(
            id,
            RangeLockEntry {
                id,
                range: range.clone(),
                kind,
                phase: MigrationPhase::Cloning,
                blocked_since: None,
                draining: false,
            },
        );
        info!(
            target: "tessera::interlock",
            shard = %self.shard,
            migration = %id,
            range = %range,
            kind = ?kind,
            "Migration cloning"
        );
        Ok(())
    }

    /// True if no prepared lock set intersects `range`
    pub fn can_enter_blocking(&self, range: &KeyRange) -> bool {
        self.state.lock().prepared_intersects(range).is_none()
    }

    /// Enter the critical section for migration `id`
    ///
    /// Stops new prepares on the range, then waits until every prepared
    /// transaction touching it has been decided. Fails with `LockTimeout`
    /// at the deadline; the migration stays in `Cloning` and may be aborted.
    pub fn enter_blocking(&self, id: MigrationId, deadline: Deadline, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        let range = match state.migrations.get_mut(&id) {
            Some(entry) if entry.phase == MigrationPhase::Cloning => {
                entry.draining = true;
                entry.range.clone()
            }
            Some(entry) if entry.phase == MigrationPhase::Blocking => return Ok(()),
            Some(entry) => {
                return Err(Error::BadValue(format!(
                    "{} cannot enter blocking from {:?}",
                    id, entry.phase
                )))
            }
            None => return Err(Error::BadValue(format!("{} is not registered", id))),
        };

        let mut logged = false;
        loop {
            let stop = match cancel.check("entering migration critical section") {
                Err(e) => Some(e),
                Ok(()) => match state.prepared_intersects(&range) {
                    None => None,
                    Some(_) if deadline.expired() => Some(Error::LockTimeout(format!(
                        "{} timed out waiting for prepared transactions on {}",
                        id, range
                    ))),
                    Some(txn) => {
                        if !logged {
                            debug!(
                                target: "tessera::interlock",
                                migration = %id,
                                prepared_txn = %txn,
                                "Waiting for prepared transaction before blocking"
                            );
                            logged = true;
                        }
                        self.changed.wait_for(&mut state, deadline.remaining(WAIT_SLICE));
                        continue;
                    }
                },
            };
            let entry = match state.migrations.get_mut(&id) {
                Some(entry) => entry,
                None => return Err(Error::internal(format!("{} vanished", id))),
            };
            entry.draining = false;
            if let Some(err) = stop {
                warn!(target: "tessera::interlock", migration = %id, error = %err, "Could not enter blocking");
                drop(state);
                self.changed.notify_all();
                return Err(err);
            }
            entry.phase = MigrationPhase::Blocking;
            entry.blocked_since = Some(Instant::now());
            info!(target: "tessera::interlock", shard = %self.shard, migration = %id, range = %range, "Migration blocking");
            return Ok(());
        }
    }

    /// Commit migration `id`: the range leaves this shard
    pub fn commit(&self, id: MigrationId) -> Result<()> {
        let mut state = self.state.lock();
        let (range, kind) = match state.migrations.get_mut(&id) {
            Some(entry) if entry.phase == MigrationPhase::Blocking => {
                entry.phase = MigrationPhase::Committed;
                (entry.range.clone(), entry.kind)
            }
            Some(entry) if entry.phase == MigrationPhase::Committed => return Ok(()),
            Some(entry) => {
                return Err(Error::BadValue(format!(
                    "{} cannot commit from {:?}",
                    id, entry.phase
                )))
            }
            None => return Err(Error::BadValue(format!("{} is not registered", id))),
        };
        state.owned = subtract(&state.owned, &range);
        state.depart(&range, kind);
        state.prune_finished();
        drop(state);
        info!(target: "tessera::interlock", shard = %self.shard, migration = %id, range = %range, "Migration committed");
        self.changed.notify_all();
        Ok(())
    }

    /// Abort migration `id`: release the range and wake waiters
    pub fn abort(&self, id: MigrationId) -> Result<()> {
        let mut state = self.state.lock();
        match state.migrations.get_mut(&id) {
            Some(entry) if entry.phase == MigrationPhase::Committed => {
                return Err(Error::BadValue(format!("{} already committed", id)))
            }
            Some(entry) => {
                entry.phase = MigrationPhase::Aborted;
                entry.draining = false;
                entry.blocked_since = None;
            }
            None => return Ok(()),
        }
        state.prune_finished();
        drop(state);
        info!(target: "tessera::interlock", shard = %self.shard, migration = %id, "Migration aborted");
        self.changed.notify_all();
        Ok(())
    }

    /// Phase of migration `id`; `NotStarted` once a finished one is pruned
    pub fn phase(&self, id: MigrationId) -> MigrationPhase {
        self.state
            .lock()
            .migrations
            .get(&id)
            .map_or(MigrationPhase::NotStarted, |e| e.phase)
    }

    /// Migrations not yet committed or aborted
    pub fn active(&self) -> Vec<RangeLockEntry> {
        self.state
            .lock()
            .migrations
            .values()
            .filter(|e| !e.phase.is_terminal())
            .cloned()
            .collect()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Admit a statement touching `keys`
    ///
    /// Waits while a critical section covers any key, then checks
    /// ownership. Fails with `MaxTimeMSExpired` at the deadline.
    pub fn admit(&self, keys: &[Key], deadline: Deadline, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        self.wait_unblocked(&mut state, keys, false, deadline, cancel)?;
        for key in keys {
            if let Some(err) = state.ownership_error(&self.shard, key) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Admit a scan of `range`
    ///
    /// Waits while a critical section intersects the range, then requires
    /// the whole range to be owned here.
    pub fn admit_range(&self, range: &KeyRange, deadline: Deadline, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock();
        let mut logged = false;
        loop {
            cancel.check("waiting for migration critical section")?;
            let blocker = state
                .migrations
                .values()
                .find(|e| e.blocks_statements() && e.range.intersects(range))
                .map(|e| e.id);
            let id = match blocker {
                None => break,
                Some(id) => id,
            };
            if !logged {
                debug!(target: "tessera::interlock", migration = %id, range = %range, "Scan waiting on critical section");
                logged = true;
            }
            if deadline.expired() {
                return Err(Error::MaxTimeMSExpired(format!(
                    "waited for critical section of {} on {}",
                    id, range
                )));
            }
            self.changed.wait_for(&mut state, deadline.remaining(WAIT_SLICE));
        }
        if state.owns_range(range) {
            return Ok(());
        }
        if let Some((moved, kind)) = state.departed.iter().find(|(r, _)| r.intersects(range)) {
            return Err(kind.committed_error(&self.shard, moved));
        }
        Err(Error::StaleConfig {
            shard: self.shard.clone(),
            message: format!("range {} is not owned by this shard", range),
        })
    }

    /// Admit the prepare of `txn` and record its lock set, atomically
    ///
    /// Waits while a migration is blocking or draining an intersecting range,
    /// then checks ownership of every key.
    pub fn admit_prepare(
        &self,
        txn: TxnId,
        keys: &[Key],
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.wait_unblocked(&mut state, keys, true, deadline, cancel)?;
        for key in keys {
            if let Some(err) = state.ownership_error(&self.shard, key) {
                return Err(err);
            }
        }
        state.prepared.insert(txn, keys.to_vec());
        Ok(())
    }

    /// Record the lock set of a prepared transaction without waiting
    pub fn on_prepared(&self, txn: TxnId, keys: Vec<Key>) {
        if keys.is_empty() {
            return;
        }
        self.state.lock().prepared.insert(txn, keys);
    }

    /// Forget the lock set of a decided transaction and wake waiters
    pub fn on_prepared_txn_resolved(&self, txn: &TxnId) {
        let removed = self.state.lock().prepared.remove(txn).is_some();
        if removed {
            self.changed.notify_all();
        }
    }

    /// Number of prepared lock sets held
    pub fn prepared_count(&self) -> usize {
        self.state.lock().prepared.len()
    }

    /// Wake every waiter so it re-checks cancellation (stepdown)
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    fn wait_unblocked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, InterlockState>,
        keys: &[Key],
        for_prepare: bool,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut logged = false;
        loop {
            cancel.check("waiting for migration critical section")?;
            let (id, range) = match state.blocking_entry(keys, for_prepare) {
                None => return Ok(()),
                Some(entry) => (entry.id, entry.range.clone()),
            };
            if !logged {
                debug!(
                    target: "tessera::interlock",
                    shard = %self.shard,
                    migration = %id,
                    range = %range,
                    "Request waiting on migration critical section"
                );
                logged = true;
            }
            if deadline.expired() {
                return Err(Error::MaxTimeMSExpired(format!(
                    "waited for critical section of {} on {}",
                    id, range
                )));
            }
            self.changed.wait_for(state, deadline.remaining(WAIT_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tessera_core::{Lsid, TxnNumber};

    fn txn() -> TxnId {
        TxnId::new(Lsid::new(), TxnNumber(0))
    }

    fn range(a: i64, b: i64) -> KeyRange {
        KeyRange::new(Key::int(a), Key::int(b))
    }

    fn interlock() -> MigrationInterlock {
        MigrationInterlock::new(ShardId::new("s0"), vec![KeyRange::full()])
    }

    fn short() -> Deadline {
        Deadline::after(Duration::from_millis(40))
    }

    #[test]
    fn test_subtract_and_normalize() {
        let owned = vec![range(0, 100)];
        let left = subtract(&owned, &range(10, 20));
        assert_eq!(left, vec![range(0, 10), range(20, 100)]);
        assert_eq!(normalize(vec![range(20, 100), range(10, 20), range(0, 10)]), owned);

        let full = subtract(&[KeyRange::full()], &KeyRange::from(Key::int(5)));
        assert_eq!(full, vec![KeyRange::new(Key::min(), Key::int(5))]);
    }

    #[test]
    fn test_prepared_lock_set_prevents_blocking() {
        let lock = interlock();
        let t = txn();
        lock.admit_prepare(t, &[Key::int(15)], Deadline::none(), &CancellationToken::new())
            .unwrap();
        assert!(!lock.can_enter_blocking(&range(10, 20)));
        assert!(lock.can_enter_blocking(&range(20, 30)));

        let id = MigrationId(1);
        lock.begin(id, range(10, 20), MigrationKind::ChunkMigration).unwrap();
        let err = lock.enter_blocking(id, short(), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert_eq!(lock.phase(id), MigrationPhase::Cloning);

        lock.on_prepared_txn_resolved(&t);
        lock.enter_blocking(id, short(), &CancellationToken::new()).unwrap();
        assert_eq!(lock.phase(id), MigrationPhase::Blocking);
    }

    #[test]
    fn test_resolution_unblocks_waiting_migration() {
        let lock = Arc::new(interlock());
        let t = txn();
        lock.on_prepared(t, vec![Key::int(5)]);
        let id = MigrationId(2);
        lock.begin(id, range(0, 10), MigrationKind::ChunkMigration).unwrap();

        let handle = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.enter_blocking(id, Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            })
        };
        thread::sleep(Duration::from_millis(20));
        lock.on_prepared_txn_resolved(&t);
        handle.join().unwrap().unwrap();
        assert_eq!(lock.phase(id), MigrationPhase::Blocking);
    }

    #[test]
    fn test_draining_stops_new_prepares() {
        let lock = Arc::new(interlock());
        let holder = txn();
        lock.on_prepared(holder, vec![Key::int(1)]);
        let id = MigrationId(3);
        lock.begin(id, range(0, 10), MigrationKind::ChunkMigration).unwrap();

        let migration = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.enter_blocking(id, Deadline::after(Duration::from_millis(200)), &CancellationToken::new())
            })
        };
        thread::sleep(Duration::from_millis(20));
        // A newcomer may not prepare while the migration is draining
        let err = lock
            .admit_prepare(txn(), &[Key::int(2)], short(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::MaxTimeMSExpired(_)));
        // Statements are not blocked until the critical section is held
        lock.admit(&[Key::int(2)], short(), &CancellationToken::new()).unwrap();

        lock.on_prepared_txn_resolved(&holder);
        migration.join().unwrap().unwrap();
    }

    #[test]
    fn test_statements_fail_after_commit_with_kind_error() {
        let lock = Arc::new(interlock());
        let id = MigrationId(4);
        lock.begin(id, range(0, 10), MigrationKind::TenantMigration).unwrap();
        lock.enter_blocking(id, short(), &CancellationToken::new()).unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.admit(&[Key::int(3)], Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            })
        };
        thread::sleep(Duration::from_millis(20));
        lock.commit(id).unwrap();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::TenantMigrationCommitted(_)));
        assert!(!lock.owns(&Key::int(3)));
        assert!(lock.owns(&Key::int(10)));
    }

    #[test]
    fn test_statements_proceed_after_abort() {
        let lock = Arc::new(interlock());
        let id = MigrationId(5);
        lock.begin(id, range(0, 10), MigrationKind::Resharding).unwrap();
        lock.enter_blocking(id, short(), &CancellationToken::new()).unwrap();

        let err = lock
            .admit(&[Key::int(3)], short(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::MaxTimeMSExpired(_)));

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.admit(&[Key::int(3)], Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            })
        };
        thread::sleep(Duration::from_millis(20));
        lock.abort(id).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_resharding_commit_error() {
        let lock = interlock();
        let id = MigrationId(6);
        lock.begin(id, range(0, 10), MigrationKind::Resharding).unwrap();
        lock.enter_blocking(id, short(), &CancellationToken::new()).unwrap();
        lock.commit(id).unwrap();
        let err = lock.check_owned([&Key::int(1)]).unwrap_err();
        assert!(matches!(err, Error::ReshardCollectionCommitted(_)));

        lock.gain(range(0, 10));
        lock.check_owned([&Key::int(1)]).unwrap();
    }

    #[test]
    fn test_scan_needs_whole_range() {
        let lock = MigrationInterlock::new(ShardId::new("s0"), vec![range(0, 50)]);
        lock.admit_range(&range(10, 20), short(), &CancellationToken::new()).unwrap();
        let err = lock
            .admit_range(&range(40, 60), short(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::StaleConfig { .. }));
    }

    #[test]
    fn test_overlapping_migrations_are_refused() {
        let lock = interlock();
        lock.begin(MigrationId(7), range(0, 10), MigrationKind::ChunkMigration).unwrap();
        let err = lock
            .begin(MigrationId(8), range(5, 15), MigrationKind::ChunkMigration)
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[test]
    fn test_cancellation_stops_blocking_entry() {
        let lock = interlock();
        lock.on_prepared(txn(), vec![Key::int(1)]);
        let id = MigrationId(9);
        lock.begin(id, range(0, 10), MigrationKind::ChunkMigration).unwrap();
        let token = CancellationToken::new();
        token.cancel(tessera_core::CancelReason::Killed);
        let err = lock.enter_blocking(id, Deadline::none(), &token).unwrap_err();
        assert!(matches!(err, Error::Interrupted(_)));
        // Draining was undone, so prepares flow again
        lock.admit_prepare(txn(), &[Key::int(2)], short(), &CancellationToken::new())
            .unwrap();
    }

    fn move_away(lock: &MigrationInterlock, id: u64, moved: KeyRange, kind: MigrationKind) {
        let id = MigrationId(id);
        lock.begin(id, moved, kind).unwrap();
        lock.enter_blocking(id, short(), &CancellationToken::new()).unwrap();
        lock.commit(id).unwrap();
    }

    #[test]
    fn test_only_recent_finished_migrations_are_kept() {
        let lock = interlock();
        for n in 1..=100 {
            lock.begin(MigrationId(n), range(0, 10), MigrationKind::ChunkMigration).unwrap();
            lock.abort(MigrationId(n)).unwrap();
        }
        assert_eq!(lock.state.lock().migrations.len(), RETAINED_FINISHED);
        assert_eq!(lock.phase(MigrationId(100)), MigrationPhase::Aborted);
        assert_eq!(lock.phase(MigrationId(1)), MigrationPhase::NotStarted);

        // A running migration is never pruned
        lock.begin(MigrationId(101), range(0, 10), MigrationKind::ChunkMigration).unwrap();
        for n in 102..=200 {
            lock.begin(MigrationId(n), range(20, 30), MigrationKind::ChunkMigration).unwrap();
            lock.abort(MigrationId(n)).unwrap();
        }
        assert_eq!(lock.phase(MigrationId(101)), MigrationPhase::Cloning);
        assert_eq!(lock.state.lock().migrations.len(), RETAINED_FINISHED + 1);
    }

    #[test]
    fn test_range_moved_back_and_forth_leaves_one_departure() {
        let lock = interlock();
        for n in 0..50 {
            move_away(&lock, n, range(0, 10), MigrationKind::ChunkMigration);
            lock.gain(range(0, 10));
        }
        assert!(lock.state.lock().departed.is_empty());

        move_away(&lock, 50, range(0, 10), MigrationKind::ChunkMigration);
        move_away(&lock, 51, range(10, 20), MigrationKind::ChunkMigration);
        assert_eq!(
            lock.state.lock().departed,
            vec![(range(0, 20), MigrationKind::ChunkMigration)]
        );
    }

    #[test]
    fn test_partial_gain_keeps_rest_of_departure() {
        let lock = interlock();
        move_away(&lock, 1, range(0, 20), MigrationKind::Resharding);
        lock.gain(range(5, 15));

        assert!(matches!(
            lock.check_owned([&Key::int(3)]),
            Err(Error::ReshardCollectionCommitted(_))
        ));
        assert!(matches!(
            lock.check_owned([&Key::int(17)]),
            Err(Error::ReshardCollectionCommitted(_))
        ));
        lock.check_owned([&Key::int(7)]).unwrap();
        assert_eq!(
            lock.state.lock().departed,
            vec![
                (range(0, 5), MigrationKind::Resharding),
                (range(15, 20), MigrationKind::Resharding),
            ]
        );
    }

    #[test]
    fn test_neighbouring_departures_of_different_kinds_stay_apart() {
        let lock = interlock();
        move_away(&lock, 1, range(0, 10), MigrationKind::ChunkMigration);
        move_away(&lock, 2, range(10, 20), MigrationKind::Resharding);

        assert_eq!(
            lock.state.lock().departed,
            vec![
                (range(0, 10), MigrationKind::ChunkMigration),
                (range(10, 20), MigrationKind::Resharding),
            ]
        );
        assert!(matches!(lock.check_owned([&Key::int(5)]), Err(Error::StaleConfig { .. })));
        assert!(matches!(
            lock.check_owned([&Key::int(15)]),
            Err(Error::ReshardCollectionCommitted(_))
        ));
    }
}
