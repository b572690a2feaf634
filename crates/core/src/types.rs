//! Core identifiers and data types
//!
//! This module defines the foundational types:
//! - Lsid: Logical session identifier (optionally a child of a parent session)
//! - TxnNumber / TxnId: Per-session transaction numbering
//! - ShardId: Name of a shard (participant)
//! - Key / KeyRange: Order-preserving document keys and half-open ranges
//! - Mutation: A buffered write (put or delete)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Document payload stored under a key
pub type Document = serde_json::Value;

// ============================================================================
// Sessions
// ============================================================================

/// Child-session suffix carried by internal transactions
///
/// Internal transactions (for example the ones spawned to write a document
/// whose shard key changes) run on a child of the client's session. The
/// child shares the parent's `id` and adds a transaction-scoped UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildSession {
    /// Unique id of the internal transaction
    pub txn_uuid: Uuid,
    /// Transaction number of the parent retryable write, if any
    pub parent_txn_number: Option<TxnNumber>,
}

/// Logical session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lsid {
    id: Uuid,
    child: Option<ChildSession>,
}

impl Lsid {
    /// Create a new top-level session id
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            child: None,
        }
    }

    /// Create a session id from a known UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self { id, child: None }
    }

    /// Create a child session for an internal transaction of this session
    pub fn child(&self, parent_txn_number: Option<TxnNumber>) -> Self {
        Self {
            id: self.id,
            child: Some(ChildSession {
                txn_uuid: Uuid::new_v4(),
                parent_txn_number,
            }),
        }
    }

    /// UUID shared by the session and all of its children
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Child suffix, if this is an internal session
    pub fn child_session(&self) -> Option<&ChildSession> {
        self.child.as_ref()
    }

    /// True if this session was spawned by another session
    pub fn is_child(&self) -> bool {
        self.child.is_some()
    }

    /// The top-level session this one belongs to (itself if top-level)
    pub fn parent(&self) -> Lsid {
        Lsid {
            id: self.id,
            child: None,
        }
    }
}

impl Default for Lsid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Lsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.child {
            None => write!(f, "{}", self.id),
            Some(child) => write!(f, "{}/{}", self.id, child.txn_uuid),
        }
    }
}

/// Transaction number, monotonically increasing per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnNumber(pub i64);

impl TxnNumber {
    /// The following transaction number
    pub fn next(&self) -> TxnNumber {
        TxnNumber(self.0 + 1)
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one transaction: `(lsid, txnNumber)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId {
    /// Owning session
    pub lsid: Lsid,
    /// Number of the transaction within the session
    pub txn_number: TxnNumber,
}

impl TxnId {
    /// Create a transaction id
    pub fn new(lsid: Lsid, txn_number: TxnNumber) -> Self {
        Self { lsid, txn_number }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lsid, self.txn_number)
    }
}

// ============================================================================
// Shards
// ============================================================================

/// Name of a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Shard name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId::new(s)
    }
}

// ============================================================================
// Keys
// ============================================================================

const TAG_INT: u8 = 0x10;
const TAG_STR: u8 = 0x20;

/// Order-preserving document key
///
/// Integer keys sort numerically and before all string keys; string keys
/// sort bytewise.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Key for an integer `_id`
    pub fn int(v: i64) -> Self {
        let mut bytes = Vec::with_capacity(9);
        bytes.push(TAG_INT);
        bytes.extend_from_slice(&((v as u64) ^ (1 << 63)).to_be_bytes());
        Key(bytes)
    }

    /// Key for a string `_id`
    pub fn str(s: &str) -> Self {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.push(TAG_STR);
        bytes.extend_from_slice(s.as_bytes());
        Key(bytes)
    }

    /// Smallest possible key
    pub fn min() -> Self {
        Key(Vec::new())
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode an integer key
    pub fn as_int(&self) -> Option<i64> {
        if self.0.len() == 9 && self.0[0] == TAG_INT {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&self.0[1..]);
            Some((u64::from_be_bytes(buf) ^ (1 << 63)) as i64)
        } else {
            None
        }
    }

    /// Approximate in-memory footprint, used for cache accounting
    pub fn footprint(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(v) = self.as_int() {
            return write!(f, "{}", v);
        }
        match self.0.split_first() {
            None => f.write_str("MinKey"),
            Some((&TAG_STR, rest)) => write!(f, "{:?}", String::from_utf8_lossy(rest)),
            Some(_) => write!(f, "0x{}", self.0.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::int(v)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::str(s)
    }
}

/// Half-open key range `[start, end)`; `end = None` means unbounded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub start: Key,
    /// Exclusive upper bound (`None` = MaxKey)
    pub end: Option<Key>,
}

impl KeyRange {
    /// Create a bounded range
    pub fn new(start: Key, end: Key) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range from `start` to MaxKey
    pub fn from(start: Key) -> Self {
        Self { start, end: None }
    }

    /// The whole key space
    pub fn full() -> Self {
        Self {
            start: Key::min(),
            end: None,
        }
    }

    /// Range covering exactly one key
    pub fn point(key: &Key) -> Self {
        let mut end = key.as_bytes().to_vec();
        end.push(0);
        Self {
            start: key.clone(),
            end: Some(Key(end)),
        }
    }

    /// True if `key` falls within the range
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.start && self.end.as_ref().map_or(true, |end| key < end)
    }

    /// True if the two ranges share at least one key
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = other.end.as_ref().map_or(true, |end| self.start < *end);
        let other_starts_before_end = self.end.as_ref().map_or(true, |end| other.start < *end);
        starts_before_other_ends && other_starts_before_end
    }

    /// Compare a key against the range: Less if below, Greater if at/after end
    pub fn locate(&self, key: &Key) -> Ordering {
        if *key < self.start {
            Ordering::Less
        } else if self.end.as_ref().map_or(false, |end| key >= end) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, MaxKey)", self.start),
        }
    }
}

// ============================================================================
// Mutations
// ============================================================================

/// A buffered write: `Some` puts the document, `None` deletes the key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Target key
    pub key: Key,
    /// New document, or `None` for a delete
    pub value: Option<Document>,
}

impl Mutation {
    /// Put a document
    pub fn put(key: Key, value: Document) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    /// Delete a key
    pub fn delete(key: Key) -> Self {
        Self { key, value: None }
    }

    /// Approximate in-memory footprint, used for cache accounting
    pub fn footprint(&self) -> usize {
        self.key.footprint() + self.value.as_ref().map_or(0, |v| v.to_string().len())
    }
}
