//! Coordinator document store
//!
//! Holds one document per distributed transaction the coordinator is
//! driving: the participant list and, once reached, the decision. The
//! document is durable before the first prepare is sent, and the decision
//! is durable before it is broadcast.
//!
//! ## Invariants
//!
//! - The decision is write-once. Recording an agreeing decision again is a
//!   no-op that returns the stored one; a different decision is refused
//!   with `ConflictingDecision`.
//! - Every mutation carries the term it was started under and is refused
//!   with `NotWritablePrimary` if the node stepped down or moved on.
//! - A document is removed only after every participant acknowledged the
//!   decision; `unfinished` lists what a new primary must resume.

use crate::error::LogError;
use crate::log::RecordLog;
use crate::mode::DurabilityMode;
use crate::term::ReplicationTerm;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tessera_core::{Decision, Error, Result, ShardId, TxnId};
use tracing::{debug, info};

/// File name of the coordinator log inside the coordinator's directory
pub const COORDINATOR_LOG_FILE: &str = "coordinator.log";

/// Removed documents accumulated before the log is rewritten
const COMPACT_AFTER_REMOVALS: usize = 1024;

/// Durable state of one coordinated transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorDocument {
    /// Transaction
    pub txn: TxnId,
    /// Writing participants (the ones that must prepare)
    pub participants: Vec<ShardId>,
    /// Read-only participants (told the decision, never prepared)
    pub read_only: Vec<ShardId>,
    /// Decision, once reached
    pub decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CoordinatorLogEntry {
    Created {
        txn: TxnId,
        participants: Vec<ShardId>,
        read_only: Vec<ShardId>,
    },
    Decided {
        txn: TxnId,
        decision: Decision,
    },
    Removed {
        txn: TxnId,
    },
}

struct StoreInner {
    docs: BTreeMap<TxnId, CoordinatorDocument>,
    log: RecordLog<CoordinatorLogEntry>,
    removals: usize,
}

impl StoreInner {
    fn append(&mut self, entry: &CoordinatorLogEntry) -> Result<()> {
        self.log.append(entry)?;
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let mut entries = Vec::with_capacity(self.docs.len() * 2);
        for doc in self.docs.values() {
            entries.push(CoordinatorLogEntry::Created {
                txn: doc.txn,
                participants: doc.participants.clone(),
                read_only: doc.read_only.clone(),
            });
            if let Some(decision) = &doc.decision {
                entries.push(CoordinatorLogEntry::Decided {
                    txn: doc.txn,
                    decision: decision.clone(),
                });
            }
        }
        self.log.rewrite(&entries)?;
        self.removals = 0;
        Ok(())
    }
}

/// Durable map of coordinator documents
pub struct CoordinatorStore {
    inner: Mutex<StoreInner>,
    term: Arc<ReplicationTerm>,
}

impl std::fmt::Debug for CoordinatorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorStore")
            .field("documents", &self.len())
            .field("term", &self.term.current())
            .finish()
    }
}

impl CoordinatorStore {
    /// Store that keeps nothing across restarts
    pub fn in_memory(term: Arc<ReplicationTerm>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                docs: BTreeMap::new(),
                log: RecordLog::in_memory(),
                removals: 0,
            }),
            term,
        }
    }

    /// Open the store in `dir`, rebuilding documents from its log
    pub fn open(
        dir: &Path,
        mode: DurabilityMode,
        term: Arc<ReplicationTerm>,
    ) -> std::result::Result<Self, LogError> {
        let (log, entries) = RecordLog::open(&dir.join(COORDINATOR_LOG_FILE), mode)?;
        let mut docs = BTreeMap::new();
        for entry in entries {
            match entry {
                CoordinatorLogEntry::Created {
                    txn,
                    participants,
                    read_only,
                } => {
                    docs.insert(
                        txn,
                        CoordinatorDocument {
                            txn,
                            participants,
                            read_only,
                            decision: None,
                        },
                    );
                }
                CoordinatorLogEntry::Decided { txn, decision } => {
                    if let Some(doc) = docs.get_mut(&txn) {
                        doc.decision = Some(decision);
                    }
                }
                CoordinatorLogEntry::Removed { txn } => {
                    docs.remove(&txn);
                }
            }
        }
        if !docs.is_empty() {
            info!(
                target: "tessera::durability",
                documents = docs.len(),
                "Recovered coordinator documents"
            );
        }
        Ok(Self {
            inner: Mutex::new(StoreInner {
                docs,
                log,
                removals: 0,
            }),
            term,
        })
    }

    /// Persist a new document, or return the existing one for `txn`
    ///
    /// A second coordinate-commit for the same transaction joins the stored
    /// document; the participant lists of the first call win.
    pub fn create(
        &self,
        term: u64,
        txn: TxnId,
        participants: Vec<ShardId>,
        read_only: Vec<ShardId>,
    ) -> Result<CoordinatorDocument> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.docs.get(&txn) {
            return Ok(existing.clone());
        }
        self.term.check(term)?;
        inner.append(&CoordinatorLogEntry::Created {
            txn,
            participants: participants.clone(),
            read_only: read_only.clone(),
        })?;
        let doc = CoordinatorDocument {
            txn,
            participants,
            read_only,
            decision: None,
        };
        inner.docs.insert(txn, doc.clone());
        debug!(
            target: "tessera::2pc",
            lsid = %txn.lsid,
            txn_number = %txn.txn_number,
            participants = doc.participants.len(),
            "Persisted coordinator document"
        );
        Ok(doc)
    }

    /// Durably record the decision for `txn`; returns the stored decision
    pub fn record_decision(&self, term: u64, txn: &TxnId, decision: Decision) -> Result<Decision> {
        let mut inner = self.inner.lock();
        let existing = match inner.docs.get(txn) {
            None => {
                return Err(Error::no_such_transaction(
                    *txn,
                    "no coordinator document for transaction",
                ))
            }
            Some(doc) => doc.decision.clone(),
        };
        if let Some(existing) = existing {
            if existing.agrees_with(&decision) {
                return Ok(existing);
            }
            return Err(Error::ConflictingDecision {
                txn: *txn,
                existing: existing.to_string(),
                requested: decision.to_string(),
            });
        }
        self.term.check(term)?;
        inner.append(&CoordinatorLogEntry::Decided {
            txn: *txn,
            decision: decision.clone(),
        })?;
        if let Some(doc) = inner.docs.get_mut(txn) {
            doc.decision = Some(decision.clone());
        }
        Ok(decision)
    }

    /// Forget a fully acknowledged document
    pub fn remove(&self, term: u64, txn: &TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.docs.contains_key(txn) {
            return Ok(());
        }
        self.term.check(term)?;
        inner.append(&CoordinatorLogEntry::Removed { txn: *txn })?;
        inner.docs.remove(txn);
        inner.removals += 1;
        if inner.removals >= COMPACT_AFTER_REMOVALS {
            inner.compact()?;
        }
        Ok(())
    }

    /// Document for `txn`
    pub fn get(&self, txn: &TxnId) -> Option<CoordinatorDocument> {
        self.inner.lock().docs.get(txn).cloned()
    }

    /// Every document not yet removed
    pub fn unfinished(&self) -> Vec<CoordinatorDocument> {
        self.inner.lock().docs.values().cloned().collect()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.inner.lock().docs.len()
    }

    /// True if no documents are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Term source shared with the owning coordinator
    pub fn term(&self) -> &Arc<ReplicationTerm> {
        &self.term
    }
}
