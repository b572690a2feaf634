//! Multi-version document store
//!
//! Stands in for the storage engine: `write_at_timestamp` installs a batch
//! of mutations at one commit timestamp, `read_at` returns the newest
//! version at or before a read timestamp.
//!
//! # Design
//!
//! - `BTreeMap<Key, VersionChain>` behind a `parking_lot::RwLock`, so range
//!   scans (chunk cloning, scans) are ordered
//! - Version chains are newest-first; a snapshot read walks from the front
//!   until it finds a version at or before its timestamp
//! - Deletes are tombstones (`None`) so older snapshots still see the
//!   previous document

use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use tessera_core::{Document, Error, Key, KeyRange, Mutation, Result, Timestamp};

/// One version of a key
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVersion {
    /// Commit timestamp of the version
    pub ts: Timestamp,
    /// Document, or `None` for a tombstone
    pub value: Option<Document>,
}

/// Version chain for MVCC - stores multiple versions of a value
///
/// Versions are stored in descending order (newest first) for efficient
/// snapshot reads - we typically want the most recent version <= read ts.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: VecDeque<StoredVersion>,
}

impl VersionChain {
    /// Add a version; it must not be older than the newest one
    ///
    /// A version at the same timestamp replaces the newest one (a batch
    /// writing the same key twice).
    pub fn push(&mut self, version: StoredVersion) -> Result<()> {
        if let Some(front) = self.versions.front() {
            if version.ts < front.ts {
                return Err(Error::internal(format!(
                    "write at {} is older than the latest version at {}",
                    version.ts, front.ts
                )));
            }
            if version.ts == front.ts {
                self.versions[0] = version;
                return Ok(());
            }
        }
        self.versions.push_front(version);
        Ok(())
    }

    /// Newest version at or before `ts`
    pub fn get_at(&self, ts: Timestamp) -> Option<&StoredVersion> {
        self.versions.iter().find(|v| v.ts <= ts)
    }

    /// Newest version
    pub fn latest(&self) -> Option<&StoredVersion> {
        self.versions.front()
    }

    /// Drop versions no snapshot at or after `min_ts` can see
    ///
    /// Keeps the newest version at or before `min_ts` plus everything newer.
    pub fn gc(&mut self, min_ts: Timestamp) {
        while self.versions.len() > 1 {
            let second_oldest = self.versions[self.versions.len() - 2].ts;
            if second_oldest <= min_ts {
                self.versions.pop_back();
            } else {
                break;
            }
        }
    }

    /// Add a version at its place in the chain, replacing one at the same
    /// timestamp
    pub fn insert(&mut self, version: StoredVersion) {
        match self.versions.iter().position(|v| v.ts <= version.ts) {
            Some(i) if self.versions[i].ts == version.ts => self.versions[i] = version,
            Some(i) => self.versions.insert(i, version),
            None => self.versions.push_back(version),
        }
    }

    /// Versions oldest first
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = &StoredVersion> {
        self.versions.iter().rev()
    }

    /// Drop every version newer than `ts`
    pub fn truncate_after(&mut self, ts: Timestamp) {
        while self.versions.front().map_or(false, |v| v.ts > ts) {
            self.versions.pop_front();
        }
    }

    /// Number of stored versions
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True if no versions are stored
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Ordered multi-version store for one shard
#[derive(Debug, Default)]
pub struct VersionedStore {
    data: RwLock<BTreeMap<Key, VersionChain>>,
}

impl VersionedStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `mutations` atomically at `ts`
    ///
    /// Validation happens before any chain is touched, so either every
    /// mutation is installed or none is.
    pub fn write_at_timestamp(&self, ts: Timestamp, mutations: &[Mutation]) -> Result<()> {
        let mut data = self.data.write();
        check_order(&data, ts, mutations)?;
        for m in mutations {
            data.entry(m.key.clone()).or_default().push(StoredVersion {
                ts,
                value: m.value.clone(),
            })?;
        }
        Ok(())
    }

    /// Fail if `write_at_timestamp(ts, mutations)` would be refused now
    pub fn check_writable(&self, ts: Timestamp, mutations: &[Mutation]) -> Result<()> {
        check_order(&self.data.read(), ts, mutations)
    }

    /// Install `mutations` at `ts` wherever `ts` falls in each chain
    ///
    /// Log replay uses this: batches may be logged out of timestamp order.
    pub fn install(&self, ts: Timestamp, mutations: &[Mutation]) {
        let mut data = self.data.write();
        for m in mutations {
            data.entry(m.key.clone()).or_default().insert(StoredVersion {
                ts,
                value: m.value.clone(),
            });
        }
    }

    /// Every stored version in `range`, by key then oldest first
    ///
    /// Tombstones are included so the history can be installed elsewhere
    /// with [`VersionedStore::replace_range`] and read at any timestamp.
    pub fn history_range(&self, range: &KeyRange) -> Vec<(Timestamp, Mutation)> {
        let data = self.data.read();
        data.range(range.start.clone()..)
            .take_while(|(k, _)| range.contains(k))
            .flat_map(|(k, chain)| {
                chain.iter_oldest_first().map(move |v| {
                    (
                        v.ts,
                        Mutation {
                            key: k.clone(),
                            value: v.value.clone(),
                        },
                    )
                })
            })
            .collect()
    }

    /// Make `history` the complete contents of `range`
    ///
    /// Keys in `range` absent from `history` are removed. Versions outside
    /// `range` are refused. Nothing changes unless the whole history is
    /// valid.
    pub fn replace_range(&self, range: &KeyRange, history: &[(Timestamp, Mutation)]) -> Result<()> {
        let mut chains: BTreeMap<Key, VersionChain> = BTreeMap::new();
        for (ts, m) in history {
            if !range.contains(&m.key) {
                return Err(Error::internal(format!("version of key {} is outside {}", m.key, range)));
            }
            chains.entry(m.key.clone()).or_default().insert(StoredVersion {
                ts: *ts,
                value: m.value.clone(),
            });
        }
        let mut data = self.data.write();
        data.retain(|k, _| !range.contains(k));
        data.extend(chains);
        Ok(())
    }

    /// Document visible at `ts`, if any
    pub fn read_at(&self, key: &Key, ts: Timestamp) -> Option<Document> {
        self.data
            .read()
            .get(key)
            .and_then(|chain| chain.get_at(ts))
            .and_then(|v| v.value.clone())
    }

    /// Timestamp of the newest version of `key` (including tombstones)
    pub fn latest_timestamp(&self, key: &Key) -> Option<Timestamp> {
        self.data
            .read()
            .get(key)
            .and_then(|chain| chain.latest())
            .map(|v| v.ts)
    }

    /// Documents in `range` visible at `ts`, in key order
    pub fn scan_at(&self, range: &KeyRange, ts: Timestamp) -> Vec<(Key, Document)> {
        let data = self.data.read();
        data.range(range.start.clone()..)
            .take_while(|(k, _)| range.contains(k))
            .filter_map(|(k, chain)| {
                chain
                    .get_at(ts)
                    .and_then(|v| v.value.clone())
                    .map(|doc| (k.clone(), doc))
            })
            .collect()
    }

    /// Garbage-collect versions older than `min_ts` on every key
    pub fn gc(&self, min_ts: Timestamp) {
        let mut data = self.data.write();
        for chain in data.values_mut() {
            chain.gc(min_ts);
        }
        data.retain(|_, chain| {
            !(chain.len() == 1 && chain.latest().map_or(true, |v| v.value.is_none() && v.ts <= min_ts))
        });
    }

    /// Discard every version written after `ts`
    ///
    /// Used when a node rolls back to a common point with its peers.
    /// Returns the number of keys that lost at least one version.
    pub fn rollback_to(&self, ts: Timestamp) -> usize {
        let mut data = self.data.write();
        let mut touched = 0;
        for chain in data.values_mut() {
            let before = chain.len();
            chain.truncate_after(ts);
            if chain.len() != before {
                touched += 1;
            }
        }
        data.retain(|_, chain| !chain.is_empty());
        touched
    }

    /// Number of keys with at least one stored version
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }
}

fn check_order(data: &BTreeMap<Key, VersionChain>, ts: Timestamp, mutations: &[Mutation]) -> Result<()> {
    for m in mutations {
        if let Some(latest) = data.get(&m.key).and_then(|c| c.latest()) {
            if latest.ts > ts {
                return Err(Error::internal(format!(
                    "write of key {} at {} is older than the latest version at {}",
                    m.key, ts, latest.ts
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_raw(n)
    }

    #[test]
    fn test_snapshot_reads_see_versions_at_or_before() {
        let store = VersionedStore::new();
        store
            .write_at_timestamp(ts(5), &[Mutation::put(Key::int(1), json!({"v": 1}))])
            .unwrap();
        store
            .write_at_timestamp(ts(10), &[Mutation::put(Key::int(1), json!({"v": 2}))])
            .unwrap();

        assert_eq!(store.read_at(&Key::int(1), ts(4)), None);
        assert_eq!(store.read_at(&Key::int(1), ts(5)), Some(json!({"v": 1})));
        assert_eq!(store.read_at(&Key::int(1), ts(9)), Some(json!({"v": 1})));
        assert_eq!(store.read_at(&Key::int(1), ts(10)), Some(json!({"v": 2})));
    }

    #[test]
    fn test_delete_is_a_tombstone() {
        let store = VersionedStore::new();
        store
            .write_at_timestamp(ts(1), &[Mutation::put(Key::int(1), json!(1))])
            .unwrap();
        store
            .write_at_timestamp(ts(2), &[Mutation::delete(Key::int(1))])
            .unwrap();
        assert_eq!(store.read_at(&Key::int(1), ts(1)), Some(json!(1)));
        assert_eq!(store.read_at(&Key::int(1), ts(2)), None);
        assert_eq!(store.latest_timestamp(&Key::int(1)), Some(ts(2)));
    }

    #[test]
    fn test_out_of_order_write_is_rejected_atomically() {
        let store = VersionedStore::new();
        store
            .write_at_timestamp(ts(10), &[Mutation::put(Key::int(2), json!("b"))])
            .unwrap();
        let result = store.write_at_timestamp(
            ts(5),
            &[
                Mutation::put(Key::int(1), json!("a")),
                Mutation::put(Key::int(2), json!("stale")),
            ],
        );
        assert!(result.is_err());
        assert_eq!(store.read_at(&Key::int(1), ts(100)), None);
    }

    #[test]
    fn test_scan_respects_range_and_snapshot() {
        let store = VersionedStore::new();
        let batch: Vec<_> = (0..10).map(|i| Mutation::put(Key::int(i), json!(i))).collect();
        store.write_at_timestamp(ts(3), &batch).unwrap();
        store
            .write_at_timestamp(ts(4), &[Mutation::delete(Key::int(5))])
            .unwrap();

        let range = KeyRange::new(Key::int(3), Key::int(7));
        let at3: Vec<_> = store.scan_at(&range, ts(3)).into_iter().map(|(k, _)| k).collect();
        assert_eq!(at3, vec![Key::int(3), Key::int(4), Key::int(5), Key::int(6)]);
        let at4: Vec<_> = store.scan_at(&range, ts(4)).into_iter().map(|(k, _)| k).collect();
        assert_eq!(at4, vec![Key::int(3), Key::int(4), Key::int(6)]);
    }

    #[test]
    fn test_rollback_discards_newer_versions() {
        let store = VersionedStore::new();
        store
            .write_at_timestamp(ts(2), &[Mutation::put(Key::int(1), json!("old"))])
            .unwrap();
        store
            .write_at_timestamp(ts(8), &[
                Mutation::put(Key::int(1), json!("new")),
                Mutation::put(Key::int(2), json!("only-new")),
            ])
            .unwrap();
        assert_eq!(store.rollback_to(ts(5)), 2);
        assert_eq!(store.read_at(&Key::int(1), ts(100)), Some(json!("old")));
        assert_eq!(store.read_at(&Key::int(2), ts(100)), None);
        assert_eq!(store.key_count(), 1);
    }

    #[test]
    fn test_gc_keeps_visible_version() {
        let mut chain = VersionChain::default();
        for n in [1, 5, 9] {
            chain
                .push(StoredVersion {
                    ts: ts(n),
                    value: Some(json!(n)),
                })
                .unwrap();
        }
        chain.gc(ts(6));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get_at(ts(6)).unwrap().value, Some(json!(5)));
    }

    #[test]
    fn test_check_writable_matches_write_refusal() {
        let store = VersionedStore::new();
        store
            .write_at_timestamp(ts(10), &[Mutation::put(Key::int(1), json!("a"))])
            .unwrap();
        assert!(store.check_writable(ts(9), &[Mutation::put(Key::int(1), json!("b"))]).is_err());
        assert!(store.check_writable(ts(9), &[Mutation::put(Key::int(2), json!("b"))]).is_ok());
        store.check_writable(ts(10), &[Mutation::put(Key::int(1), json!("b"))]).unwrap();
    }

    #[test]
    fn test_history_moves_with_its_timestamps() {
        let donor = VersionedStore::new();
        donor
            .write_at_timestamp(ts(3), &[Mutation::put(Key::int(15), json!({"v": 1}))])
            .unwrap();
        donor
            .write_at_timestamp(ts(6), &[
                Mutation::put(Key::int(15), json!({"v": 2})),
                Mutation::put(Key::int(16), json!("gone soon")),
            ])
            .unwrap();
        donor.write_at_timestamp(ts(7), &[Mutation::delete(Key::int(16))]).unwrap();
        donor
            .write_at_timestamp(ts(8), &[Mutation::put(Key::int(30), json!("elsewhere"))])
            .unwrap();

        let range = KeyRange::new(Key::int(10), Key::int(20));
        let history = donor.history_range(&range);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].0, ts(3));

        let recipient = VersionedStore::new();
        recipient
            .write_at_timestamp(ts(1), &[Mutation::put(Key::int(12), json!("stale copy"))])
            .unwrap();
        recipient.replace_range(&range, &history).unwrap();
        assert_eq!(recipient.read_at(&Key::int(15), ts(2)), None);
        assert_eq!(recipient.read_at(&Key::int(15), ts(4)), Some(json!({"v": 1})));
        assert_eq!(recipient.read_at(&Key::int(15), ts(100)), Some(json!({"v": 2})));
        assert_eq!(recipient.read_at(&Key::int(16), ts(6)), Some(json!("gone soon")));
        assert_eq!(recipient.read_at(&Key::int(16), ts(7)), None);
        assert_eq!(recipient.read_at(&Key::int(12), ts(100)), None);
        assert_eq!(recipient.read_at(&Key::int(30), ts(100)), None);

        let outside = vec![(ts(1), Mutation::put(Key::int(50), json!(1)))];
        assert!(recipient.replace_range(&range, &outside).is_err());
        assert_eq!(recipient.read_at(&Key::int(15), ts(100)), Some(json!({"v": 2})));
    }

    #[test]
    fn test_install_places_late_batches_in_order() {
        let store = VersionedStore::new();
        store.install(ts(9), &[Mutation::put(Key::int(1), json!("late"))]);
        store.install(ts(4), &[Mutation::put(Key::int(1), json!("early"))]);
        store.install(ts(9), &[Mutation::put(Key::int(1), json!("late, rewritten"))]);
        assert_eq!(store.read_at(&Key::int(1), ts(5)), Some(json!("early")));
        assert_eq!(store.read_at(&Key::int(1), ts(9)), Some(json!("late, rewritten")));
        assert_eq!(store.latest_timestamp(&Key::int(1)), Some(ts(9)));
    }
}
