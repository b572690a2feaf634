//! Replication term fencing
//!
//! Each node owns one `ReplicationTerm`. Stepping up starts a new term;
//! stepping down revokes the right to write. Durable stores consult it
//! before every mutation so that work started under an older term cannot
//! land after a stepdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tessera_core::{Error, Result};

/// Current term and primary flag of a node
#[derive(Debug)]
pub struct ReplicationTerm {
    node: String,
    term: AtomicU64,
    primary: AtomicBool,
}

impl ReplicationTerm {
    /// A node that is primary in term 1
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            term: AtomicU64::new(1),
            primary: AtomicBool::new(true),
        }
    }

    /// Current term
    pub fn current(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// True if the node currently accepts writes
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Become primary in a new term; returns that term
    pub fn step_up(&self) -> u64 {
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        self.primary.store(true, Ordering::SeqCst);
        term
    }

    /// Stop accepting writes
    pub fn step_down(&self) {
        self.primary.store(false, Ordering::SeqCst);
    }

    /// Fail with `NotWritablePrimary` unless primary
    pub fn ensure_primary(&self) -> Result<()> {
        if self.is_primary() {
            Ok(())
        } else {
            Err(Error::NotWritablePrimary(format!("{} is not primary", self.node)))
        }
    }

    /// Fail with `NotWritablePrimary` unless primary in exactly `term`
    pub fn check(&self, term: u64) -> Result<()> {
        self.ensure_primary()?;
        let current = self.current();
        if current != term {
            return Err(Error::NotWritablePrimary(format!(
                "{} moved from term {} to term {}",
                self.node, term, current
            )));
        }
        Ok(())
    }
}
