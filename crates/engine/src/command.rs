//! Command surface of a shard
//!
//! Key-addressed CRUD statements and the request envelope that carries them
//! inside a transaction. `apply` executes one statement against a
//! [`StatementContext`], which gives it read-your-writes over the
//! transaction's buffered writes and its snapshot.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_concurrency::StatementContext;
use tessera_core::{
    Deadline, Document, Error, Key, KeyRange, Mutation, ReadConcern, Result, Timestamp, TxnId,
};

/// One CRUD statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Insert a new document; fails with `DuplicateKey` if the key exists
    Insert {
        /// Target key
        key: Key,
        /// Document
        doc: Document,
    },
    /// Merge `set` into an existing document (or create it with `upsert`)
    Update {
        /// Target key
        key: Key,
        /// Fields to set
        set: Document,
        /// Create the document if missing
        upsert: bool,
    },
    /// Delete a document
    Delete {
        /// Target key
        key: Key,
    },
    /// Read a document
    Find {
        /// Target key
        key: Key,
    },
    /// Update or remove a document and return its prior version
    FindAndModify {
        /// Target key
        key: Key,
        /// Fields to set; ignored when `remove` is true
        set: Option<Document>,
        /// Delete the document instead of updating it
        remove: bool,
        /// Create the document if missing
        upsert: bool,
    },
    /// Read every document in a range
    Scan {
        /// Range to read
        range: KeyRange,
    },
}

/// Where a statement needs to be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// One key, one owning shard
    Key(&'a Key),
    /// A range, possibly spanning shards
    Range(&'a KeyRange),
}

impl Statement {
    /// Routing target
    pub fn target(&self) -> Target<'_> {
        match self {
            Statement::Insert { key, .. }
            | Statement::Update { key, .. }
            | Statement::Delete { key }
            | Statement::Find { key }
            | Statement::FindAndModify { key, .. } => Target::Key(key),
            Statement::Scan { range } => Target::Range(range),
        }
    }

    /// True if the statement may buffer a write
    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Find { .. } | Statement::Scan { .. })
    }

    /// Command name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
            Statement::Find { .. } => "find",
            Statement::FindAndModify { .. } => "findAndModify",
            Statement::Scan { .. } => "scan",
        }
    }

    /// The same statement restricted to `range` (scans only)
    pub fn restricted_to(&self, range: &KeyRange) -> Statement {
        match self {
            Statement::Scan { range: wanted } => Statement::Scan {
                range: intersect(wanted, range),
            },
            other => other.clone(),
        }
    }
}

pub(crate) fn intersect(a: &KeyRange, b: &KeyRange) -> KeyRange {
    let start = a.start.clone().max(b.start.clone());
    let end = match (&a.end, &b.end) {
        (Some(x), Some(y)) => Some(x.clone().min(y.clone())),
        (Some(x), None) | (None, Some(x)) => Some(x.clone()),
        (None, None) => None,
    };
    KeyRange { start, end }
}

/// Result of one statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatementResult {
    /// Document inserted
    Inserted,
    /// Update outcome
    Updated {
        /// A document existed
        matched: bool,
        /// A document was created by upsert
        upserted: bool,
    },
    /// Delete outcome
    Deleted {
        /// A document was removed
        deleted: bool,
    },
    /// Document read
    Found(Option<Document>),
    /// Prior version returned by findAndModify
    Modified(Option<Document>),
    /// Documents read by a scan, in key order
    Scanned(Vec<(Key, Document)>),
}

/// A statement inside a transaction, as sent to a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRequest {
    /// Transaction
    pub txn: TxnId,
    /// Must be false: only multi-statement transactions are supported
    pub autocommit: bool,
    /// First statement of the transaction on this shard
    pub start_transaction: bool,
    /// Read concern; only allowed with `start_transaction`
    pub read_concern: Option<ReadConcern>,
    /// Cluster time gossiped by the sender
    pub cluster_time: Option<Timestamp>,
    /// Statement deadline
    pub max_time: Option<Duration>,
    /// The statement
    pub statement: Statement,
}

impl StatementRequest {
    /// A follow-up statement of `txn`
    pub fn new(txn: TxnId, statement: Statement) -> Self {
        Self {
            txn,
            autocommit: false,
            start_transaction: false,
            read_concern: None,
            cluster_time: None,
            max_time: None,
            statement,
        }
    }

    /// The first statement of `txn`, fixing its read concern
    pub fn start(txn: TxnId, read_concern: ReadConcern, statement: Statement) -> Self {
        Self {
            start_transaction: true,
            read_concern: Some(read_concern),
            ..Self::new(txn, statement)
        }
    }

    /// Attach gossiped cluster time
    pub fn with_cluster_time(mut self, ts: Timestamp) -> Self {
        self.cluster_time = Some(ts);
        self
    }

    /// Attach a deadline
    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Reject malformed envelopes
    pub fn validate(&self) -> Result<()> {
        if self.autocommit {
            return Err(Error::invalid_options("autocommit must be false"));
        }
        if self.read_concern.is_some() && !self.start_transaction {
            return Err(Error::invalid_options(
                "only the first command in a transaction may specify a readConcern",
            ));
        }
        if let Some(rc) = &self.read_concern {
            rc.validate().map_err(Error::InvalidOptions)?;
        }
        Ok(())
    }

    /// Read concern to start with, if this request starts the transaction
    pub fn start_read_concern(&self) -> Option<ReadConcern> {
        self.start_transaction
            .then(|| self.read_concern.unwrap_or_default())
    }

    /// Deadline of the statement, falling back to `default`
    pub fn deadline(&self, default: Duration) -> Deadline {
        Deadline::after(self.max_time.unwrap_or(default))
    }
}

/// Reply to a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementReply {
    /// Statement outcome
    pub result: StatementResult,
    /// The shard's cluster time after the statement
    pub cluster_time: Timestamp,
}

/// Execute `statement` inside the transaction behind `ctx`
pub fn apply(ctx: &mut StatementContext<'_>, statement: &Statement) -> Result<StatementResult> {
    match statement {
        Statement::Insert { key, doc } => {
            if ctx.read(key)?.is_some() {
                return Err(Error::DuplicateKey(key.clone()));
            }
            ctx.write(Mutation::put(key.clone(), doc.clone()))?;
            Ok(StatementResult::Inserted)
        }
        Statement::Update { key, set, upsert } => match ctx.read(key)? {
            Some(existing) => {
                ctx.write(Mutation::put(key.clone(), merge(existing, set)))?;
                Ok(StatementResult::Updated {
                    matched: true,
                    upserted: false,
                })
            }
            None if *upsert => {
                ctx.write(Mutation::put(key.clone(), set.clone()))?;
                Ok(StatementResult::Updated {
                    matched: false,
                    upserted: true,
                })
            }
            None => Ok(StatementResult::Updated {
                matched: false,
                upserted: false,
            }),
        },
        Statement::Delete { key } => {
            let deleted = ctx.read(key)?.is_some();
            if deleted {
                ctx.write(Mutation::delete(key.clone()))?;
            }
            Ok(StatementResult::Deleted { deleted })
        }
        Statement::Find { key } => Ok(StatementResult::Found(ctx.read(key)?)),
        Statement::FindAndModify {
            key,
            set,
            remove,
            upsert,
        } => {
            let before = ctx.read(key)?;
            match (&before, remove, set) {
                (Some(_), true, _) => ctx.write(Mutation::delete(key.clone()))?,
                (Some(existing), false, Some(set)) => {
                    ctx.write(Mutation::put(key.clone(), merge(existing.clone(), set)))?
                }
                (None, false, Some(set)) if *upsert => {
                    ctx.write(Mutation::put(key.clone(), set.clone()))?
                }
                _ => {}
            }
            Ok(StatementResult::Modified(before))
        }
        Statement::Scan { range } => Ok(StatementResult::Scanned(ctx.scan(range)?)),
    }
}

/// Shallow-merge the fields of `set` into `doc`; non-objects replace
pub fn merge(doc: Document, set: &Document) -> Document {
    match (doc, set) {
        (Document::Object(mut fields), Document::Object(updates)) => {
            for (k, v) in updates {
                fields.insert(k.clone(), v.clone());
            }
            Document::Object(fields)
        }
        (_, replacement) => replacement.clone(),
    }
}
