//! Routing table: which shard owns which key range
//!
//! The authoritative table lives in the [`Catalog`]. Routers keep a cached
//! `Arc<RoutingTable>` and refresh it when a shard reports that a range
//! moved. Tables are immutable; a move produces a new table with a higher
//! version.

use parking_lot::RwLock;
use std::sync::Arc;
use tessera_core::{Error, Key, KeyRange, Result, ShardId};

/// A contiguous key range and its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Keys covered
    pub range: KeyRange,
    /// Owning shard
    pub shard: ShardId,
}

/// Versioned set of non-overlapping chunks, sorted by start key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    version: u64,
    chunks: Vec<Chunk>,
}

impl RoutingTable {
    /// Build a table from chunks
    ///
    /// Chunks must not overlap.
    pub fn new(mut chunks: Vec<Chunk>) -> Result<Self> {
        chunks.sort_by(|a, b| a.range.start.cmp(&b.range.start));
        for pair in chunks.windows(2) {
            if pair[0].range.intersects(&pair[1].range) {
                return Err(Error::BadValue(format!(
                    "chunks {} and {} overlap",
                    pair[0].range, pair[1].range
                )));
            }
        }
        Ok(Self { version: 1, chunks })
    }

    /// Table version; bumped by every move
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All chunks in key order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Owner of `key`
    pub fn shard_for(&self, key: &Key) -> Result<&ShardId> {
        self.chunks
            .iter()
            .find(|c| c.range.contains(key))
            .map(|c| &c.shard)
            .ok_or_else(|| Error::BadValue(format!("no chunk covers key {}", key)))
    }

    /// Chunks intersecting `range`, in key order
    pub fn chunks_for_range(&self, range: &KeyRange) -> Vec<&Chunk> {
        self.chunks.iter().filter(|c| c.range.intersects(range)).collect()
    }

    /// Distinct shards owning part of `range`
    pub fn shards_for_range(&self, range: &KeyRange) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .chunks_for_range(range)
            .into_iter()
            .map(|c| c.shard.clone())
            .collect();
        shards.sort();
        shards.dedup();
        shards
    }

    /// Ranges owned by `shard`
    pub fn ranges_of(&self, shard: &ShardId) -> Vec<KeyRange> {
        self.chunks
            .iter()
            .filter(|c| &c.shard == shard)
            .map(|c| c.range.clone())
            .collect()
    }

    /// A new table where `range` belongs to `to`
    ///
    /// `range` must lie inside a single existing chunk; that chunk is split
    /// around it.
    pub fn with_move(&self, range: &KeyRange, to: &ShardId) -> Result<RoutingTable> {
        let idx = self
            .chunks
            .iter()
            .position(|c| covers(&c.range, range))
            .ok_or_else(|| Error::BadValue(format!("range {} does not lie inside one chunk", range)))?;
        let old = &self.chunks[idx];

        let mut replacement = Vec::with_capacity(3);
        if old.range.start < range.start {
            replacement.push(Chunk {
                range: KeyRange::new(old.range.start.clone(), range.start.clone()),
                shard: old.shard.clone(),
            });
        }
        replacement.push(Chunk {
            range: range.clone(),
            shard: to.clone(),
        });
        if let Some(end) = &range.end {
            if old.range.end.as_ref().map_or(true, |old_end| end < old_end) {
                replacement.push(Chunk {
                    range: KeyRange {
                        start: end.clone(),
                        end: old.range.end.clone(),
                    },
                    shard: old.shard.clone(),
                });
            }
        }

        let mut chunks = self.chunks.clone();
        chunks.splice(idx..=idx, replacement);
        Ok(RoutingTable {
            version: self.version + 1,
            chunks,
        })
    }
}

fn covers(outer: &KeyRange, inner: &KeyRange) -> bool {
    let end_ok = match (&outer.end, &inner.end) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(o), Some(i)) => i <= o,
    };
    outer.start <= inner.start && end_ok
}

/// Authoritative routing table
#[derive(Debug)]
pub struct Catalog {
    table: RwLock<Arc<RoutingTable>>,
}

impl Catalog {
    /// Catalog starting from `table`
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Current table
    pub fn current(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read())
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.table.read().version()
    }

    /// Record that `range` now belongs to `to`; returns the new version
    pub fn move_range(&self, range: &KeyRange, to: &ShardId) -> Result<u64> {
        let mut table = self.table.write();
        let next = table.with_move(range, to)?;
        let version = next.version();
        *table = Arc::new(next);
        Ok(version)
    }
}
