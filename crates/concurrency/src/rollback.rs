//! Rollback planning for decided transactions
//!
//! A node that diverged from its peers rolls back to a common point and
//! discards everything it wrote after it. Decided distributed transactions
//! in that window are only safe to discard if the decision never became
//! majority durable: a majority-committed decision may already have been
//! applied by other participants, and undoing it here would break
//! atomicity.

use tessera_core::{fatal::fatal_invariant, Timestamp, TxnId};
use thiserror::Error;
use tracing::{info, warn};

/// A decided transaction as recorded on a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecidedTxn {
    /// Transaction
    pub txn: TxnId,
    /// Timestamp the decision was applied at
    pub decided_at: Timestamp,
}

/// Transactions a rollback to `common_point` would discard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Point the node rolls back to
    pub common_point: Timestamp,
    /// Decided transactions applied after the common point
    pub undone: Vec<TxnId>,
}

/// A rollback would undo majority-committed decisions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rollback to {common_point} would undo {} majority-committed decision(s) (majority point {majority_point})", .txns.len())]
pub struct RollbackViolation {
    /// Requested rollback point
    pub common_point: Timestamp,
    /// Majority commit point
    pub majority_point: Timestamp,
    /// Offending transactions
    pub txns: Vec<TxnId>,
}

/// Compute which decided transactions a rollback to `common_point` undoes
///
/// Fails if any of them was decided at or before `majority_point`.
pub fn plan_rollback(
    decided: &[DecidedTxn],
    common_point: Timestamp,
    majority_point: Timestamp,
) -> Result<RollbackPlan, RollbackViolation> {
    let mut undone = Vec::new();
    let mut violating = Vec::new();
    for d in decided.iter().filter(|d| d.decided_at > common_point) {
        if d.decided_at <= majority_point {
            violating.push(d.txn);
        } else {
            undone.push(d.txn);
        }
    }
    if !violating.is_empty() {
        return Err(RollbackViolation {
            common_point,
            majority_point,
            txns: violating,
        });
    }
    Ok(RollbackPlan {
        common_point,
        undone,
    })
}

/// Plan a rollback and abort the process if it is unsafe
///
/// Never returns on a violation.
pub fn plan_or_abort(decided: &[DecidedTxn], common_point: Timestamp, majority_point: Timestamp) -> RollbackPlan {
    match plan_rollback(decided, common_point, majority_point) {
        Ok(plan) => {
            info!(
                target: "tessera::txn",
                common_point = %common_point,
                undone = plan.undone.len(),
                "Planned rollback"
            );
            plan
        }
        Err(violation) => {
            warn!(target: "tessera::txn", txns = ?violation.txns, "Refusing to undo majority-committed decisions");
            fatal_invariant(&violation.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_core::{Lsid, TxnNumber};

    fn decided(at: u64) -> DecidedTxn {
        DecidedTxn {
            txn: TxnId::new(Lsid::new(), TxnNumber(at as i64)),
            decided_at: Timestamp::from_raw(at),
        }
    }

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_raw(n)
    }

    #[test]
    fn test_only_decisions_after_common_point_are_undone() {
        let log = [decided(3), decided(8), decided(12)];
        let plan = plan_rollback(&log, ts(5), ts(5)).unwrap();
        assert_eq!(plan.undone, vec![log[1].txn, log[2].txn]);
    }

    #[test]
    fn test_undoing_majority_committed_decision_is_refused() {
        let log = [decided(3), decided(8), decided(12)];
        let violation = plan_rollback(&log, ts(5), ts(10)).unwrap_err();
        assert_eq!(violation.txns, vec![log[1].txn]);
        assert!(violation.to_string().contains("majority-committed"));
    }

    #[test]
    fn test_safe_plan_passes_through() {
        let log = [decided(2)];
        let plan = plan_or_abort(&log, ts(5), ts(5));
        assert!(plan.undone.is_empty());
    }

    proptest! {
        #[test]
        fn prop_plan_never_undoes_majority_committed(
            points in proptest::collection::vec(1u64..100, 0..20),
            common in 0u64..100,
            majority in 0u64..100,
        ) {
            let log: Vec<_> = points.iter().map(|&p| decided(p)).collect();
            if let Ok(plan) = plan_rollback(&log, ts(common), ts(majority)) {
                for d in &log {
                    if plan.undone.contains(&d.txn) {
                        prop_assert!(d.decided_at > ts(common));
                        prop_assert!(d.decided_at > ts(majority));
                    }
                }
            }
        }
    }
}
