//! Durability layer for Tessera
//!
//! This crate handles everything that touches disk:
//!
//! - Record logs: append-only, CRC-framed MessagePack records with torn-tail
//!   truncation on open
//! - Durability modes: Always, Standard (default), Cache
//! - Participant transaction log: prepare/commit/abort steps of a shard
//! - Coordinator document store: participant lists and write-once decisions
//! - Term fencing: durable mutations are refused after a stepdown

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator_store;
pub mod error;
pub mod log;
pub mod mode;
pub mod record;
pub mod term;
pub mod txn_log;

pub use coordinator_store::{CoordinatorDocument, CoordinatorStore};
pub use error::LogError;
pub use log::RecordLog;
pub use mode::DurabilityMode;
pub use term::ReplicationTerm;
pub use txn_log::{RecoveredLog, RecoveredPrepared, StoreChange, TransactionLog, TxnLogEntry};
