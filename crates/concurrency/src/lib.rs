//! Participant-side transaction machinery for Tessera
//!
//! This crate implements what one shard does for distributed transactions:
//! - TransactionTable: sessions, statements, prepare/commit/abort, reaping
//! - TransactionRecord: the per-transaction state machine
//! - MigrationInterlock: range ownership and migration critical sections
//! - Rollback planning that refuses to undo majority-committed decisions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod interlock;
pub mod participant;
pub mod rollback;
pub mod table;

pub use interlock::{MigrationId, MigrationInterlock, MigrationKind, MigrationPhase, RangeLockEntry};
pub use participant::{AbortAction, CommitAction, PrepareAction, PreparedImage, TransactionRecord};
pub use rollback::{plan_or_abort, plan_rollback, DecidedTxn, RollbackPlan, RollbackViolation};
pub use table::{
    ReapStats, RecoveryStats, RollbackStats, StatementContext, TableConfig, TableMetrics, TableMetricsSnapshot,
    TransactionTable,
};
