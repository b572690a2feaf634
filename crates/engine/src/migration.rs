//! Chunk migration driver
//!
//! Moves a key range from a donor shard to a recipient:
//!
//! 1. `begin` on the donor's interlock (phase `Cloning`).
//! 2. Copy the range's version history, timestamps included.
//! 3. Enter the critical section: new prepares on the range stop and the
//!    driver waits, bounded, for prepared transactions on it to resolve.
//! 4. Copy the history again; it replaces the first copy.
//! 5. Commit on the donor (the range leaves it), hand ownership to the
//!    recipient, delete the donor's copy, and bump the routing table.
//!
//! Any failure before the donor commit aborts the migration: the donor
//! keeps the range and the recipient's partial copy is deleted.

use crate::routing::Catalog;
use crate::shard::Shard;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_concurrency::{MigrationId, MigrationKind};
use tessera_core::{Deadline, Document, Error, Key, KeyRange, Mutation, Result, ShardId, Timestamp};
use tracing::{info, warn};

/// Outcome of a completed move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migration id on the donor
    pub id: MigrationId,
    /// Range moved
    pub range: KeyRange,
    /// Shard the range left
    pub donor: ShardId,
    /// Shard that owns the range now
    pub recipient: ShardId,
    /// Keys copied before the critical section
    pub cloned: usize,
    /// Keys whose history changed between the two copies
    pub caught_up: usize,
    /// Routing table version after the move
    pub routing_version: u64,
}

/// Runs range moves between in-process shards
#[derive(Debug)]
pub struct MigrationDriver {
    catalog: Arc<Catalog>,
    shards: BTreeMap<ShardId, Arc<Shard>>,
    blocking_timeout: Duration,
    next_id: AtomicU64,
}

impl MigrationDriver {
    /// Driver over `shards`; `blocking_timeout` bounds the wait for
    /// prepared transactions before the critical section
    pub fn new(catalog: Arc<Catalog>, shards: Vec<Arc<Shard>>, blocking_timeout: Duration) -> Self {
        Self {
            catalog,
            shards: shards.into_iter().map(|s| (s.id().clone(), s)).collect(),
            blocking_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, id: &ShardId) -> Result<&Arc<Shard>> {
        self.shards.get(id).ok_or_else(|| Error::ShardNotFound(id.clone()))
    }

    /// Move `range` from `donor` to `recipient`
    pub fn move_range(
        &self,
        range: &KeyRange,
        donor: &ShardId,
        recipient: &ShardId,
        kind: MigrationKind,
    ) -> Result<MigrationReport> {
        if donor == recipient {
            return Err(Error::BadValue(format!("cannot move {} onto its own shard", range)));
        }
        let from = self.shard(donor)?;
        let to = self.shard(recipient)?;
        let id = MigrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        from.interlock().begin(id, range.clone(), kind)?;
        info!(
            target: "tessera::migration",
            migration = %id,
            range = %range,
            donor = %donor,
            recipient = %recipient,
            "Moving range"
        );

        let copied = match self.copy(id, range, from, to) {
            Ok(copied) => copied,
            Err(e) => {
                warn!(target: "tessera::migration", migration = %id, range = %range, error = %e, "Migration aborted");
                if let Err(abort_err) = from.interlock().abort(id) {
                    warn!(target: "tessera::migration", migration = %id, error = %abort_err, "Could not release range");
                }
                if let Err(cleanup_err) = to.drop_range(range) {
                    warn!(target: "tessera::migration", migration = %id, error = %cleanup_err, "Recipient cleanup failed");
                }
                return Err(e);
            }
        };

        // Point of no return: the donor no longer serves the range.
        from.interlock().commit(id)?;
        to.gain_range(range)?;
        from.drop_range(range)?;
        let routing_version = self.catalog.move_range(range, recipient)?;

        let report = MigrationReport {
            id,
            range: range.clone(),
            donor: donor.clone(),
            recipient: recipient.clone(),
            cloned: copied.0,
            caught_up: copied.1,
            routing_version,
        };
        info!(
            target: "tessera::migration",
            migration = %id,
            range = %range,
            cloned = report.cloned,
            caught_up = report.caught_up,
            routing_version,
            "Range moved"
        );
        Ok(report)
    }

    /// Clone, enter the critical section, catch up; returns both copy sizes
    ///
    /// Both copies carry the donor's full version history so snapshot
    /// reads on the recipient see what they would have seen on the donor.
    fn copy(&self, id: MigrationId, range: &KeyRange, from: &Shard, to: &Shard) -> Result<(usize, usize)> {
        let clone_ts = from.cluster_time();
        let cloned = by_key(from.history_range(range));
        to.clock().advance_to(clone_ts);
        to.import_range(range, flatten(&cloned))?;

        from.interlock().enter_blocking(
            id,
            Deadline::after(self.blocking_timeout),
            &from.table().cancel_token(),
        )?;

        let final_ts = from.cluster_time();
        let latest = by_key(from.history_range(range));
        let caught_up = latest
            .keys()
            .chain(cloned.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|k| cloned.get(*k) != latest.get(*k))
            .count();
        to.clock().advance_to(final_ts);
        to.import_range(range, flatten(&latest))?;
        Ok((cloned.len(), caught_up))
    }
}

type History = BTreeMap<Key, Vec<(Timestamp, Option<Document>)>>;

fn by_key(versions: Vec<(Timestamp, Mutation)>) -> History {
    let mut history = History::new();
    for (ts, m) in versions {
        history.entry(m.key).or_default().push((ts, m.value));
    }
    history
}

fn flatten(history: &History) -> Vec<(Timestamp, Mutation)> {
    history
        .iter()
        .flat_map(|(key, versions)| {
            versions.iter().map(move |(ts, value)| {
                (
                    *ts,
                    Mutation {
                        key: key.clone(),
                        value: value.clone(),
                    },
                )
            })
        })
        .collect()
}
