//! Transaction-level value types shared by every layer
//!
//! - ReadConcern: how a transaction chooses its read timestamp
//! - Decision: outcome of a distributed transaction
//! - TxnState: participant-side lifecycle state

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Read concern level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReadConcernLevel {
    /// Read the latest data on each participant
    #[default]
    Local,
    /// Read majority-committed data
    Majority,
    /// Read one consistent snapshot across all participants
    Snapshot,
}

/// Read concern carried by the first statement of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ReadConcern {
    /// Level
    pub level: ReadConcernLevel,
    /// Explicit snapshot timestamp (`snapshot` level only)
    pub at_cluster_time: Option<Timestamp>,
    /// Causal bound: the read must observe at least this time
    pub after_cluster_time: Option<Timestamp>,
}

impl ReadConcern {
    /// `local` read concern
    pub fn local() -> Self {
        Self::default()
    }

    /// `majority` read concern
    pub fn majority() -> Self {
        Self {
            level: ReadConcernLevel::Majority,
            ..Self::default()
        }
    }

    /// `snapshot` read concern at the current cluster time
    pub fn snapshot() -> Self {
        Self {
            level: ReadConcernLevel::Snapshot,
            ..Self::default()
        }
    }

    /// `snapshot` read concern at a fixed timestamp
    pub fn snapshot_at(ts: Timestamp) -> Self {
        Self {
            level: ReadConcernLevel::Snapshot,
            at_cluster_time: Some(ts),
            after_cluster_time: None,
        }
    }

    /// Add an `afterClusterTime` bound
    pub fn with_after_cluster_time(mut self, ts: Timestamp) -> Self {
        self.after_cluster_time = Some(ts);
        self
    }

    /// `atClusterTime` is only meaningful with the snapshot level
    pub fn validate(&self) -> Result<(), String> {
        if self.at_cluster_time.is_some() && self.level != ReadConcernLevel::Snapshot {
            return Err("atClusterTime requires readConcern level 'snapshot'".to_string());
        }
        if let (Some(at), Some(after)) = (self.at_cluster_time, self.after_cluster_time) {
            if at < after {
                return Err(format!(
                    "atClusterTime {} is earlier than afterClusterTime {}",
                    at, after
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of a distributed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// All participants apply the writes at `commit_timestamp`
    Commit {
        /// Visibility timestamp on every participant
        commit_timestamp: Timestamp,
    },
    /// No participant applies the writes
    Abort {
        /// Human-readable reason
        reason: String,
    },
}

impl Decision {
    /// True for a commit decision
    pub fn is_commit(&self) -> bool {
        matches!(self, Decision::Commit { .. })
    }

    /// Commit timestamp, if committed
    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        match self {
            Decision::Commit { commit_timestamp } => Some(*commit_timestamp),
            Decision::Abort { .. } => None,
        }
    }

    /// Two decisions agree if they have the same kind (and commit timestamp)
    ///
    /// Abort reasons are informational and do not take part.
    pub fn agrees_with(&self, other: &Decision) -> bool {
        match (self, other) {
            (Decision::Commit { commit_timestamp: a }, Decision::Commit { commit_timestamp: b }) => {
                a == b
            }
            (Decision::Abort { .. }, Decision::Abort { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit { commit_timestamp } => write!(f, "commit at {}", commit_timestamp),
            Decision::Abort { reason } => write!(f, "abort ({})", reason),
        }
    }
}

/// Participant-side lifecycle state of one transaction
///
/// State transitions:
/// - `InProgress` → `Prepared` (prepareTransaction)
/// - `InProgress` → `Committed` (single-phase commit)
/// - `InProgress` → `Aborted` (abort, implicit abort, fatal statement error)
/// - `Prepared` → `Committed` (coordinator commit decision)
/// - `Prepared` → `Aborted` (coordinator abort decision)
///
/// Terminal states (no transitions allowed):
/// - `Committed`
/// - `Aborted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Accepting statements
    InProgress,
    /// Durably prepared, awaiting the coordinator's decision
    Prepared {
        /// Timestamp issued at prepare
        prepare_timestamp: Timestamp,
    },
    /// Writes visible at `commit_timestamp`
    Committed {
        /// Visibility timestamp
        commit_timestamp: Timestamp,
        /// True if the transaction went through prepare
        was_prepared: bool,
    },
    /// Writes discarded
    Aborted {
        /// Human-readable reason
        reason: String,
        /// True if the transaction went through prepare
        was_prepared: bool,
    },
}

impl TxnState {
    /// True for Committed and Aborted
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed { .. } | TxnState::Aborted { .. })
    }

    /// True for Prepared
    pub fn is_prepared(&self) -> bool {
        matches!(self, TxnState::Prepared { .. })
    }

    /// Short state name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TxnState::InProgress => "inProgress",
            TxnState::Prepared { .. } => "prepared",
            TxnState::Committed { .. } => "committed",
            TxnState::Aborted { .. } => "aborted",
        }
    }
}
