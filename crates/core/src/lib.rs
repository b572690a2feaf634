//! Core types for Tessera
//!
//! This crate defines the foundational types used throughout the system:
//! - Lsid, TxnNumber, TxnId: session and transaction identity
//! - ShardId: participant identity
//! - Key, KeyRange, Mutation: document addressing and buffered writes
//! - Timestamp: logical time
//! - ReadConcern, Decision, TxnState: transaction value types
//! - Error, ErrorKind, classify: error taxonomy
//! - CancellationToken, Deadline: bounded, cancellable waits
//! - fatal: crash-over-corruption primitive

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod fatal;
pub mod timestamp;
pub mod txn;
pub mod types;

pub use cancel::{CancelReason, CancellationToken, Deadline};
pub use error::{classify, CommandKind, Error, ErrorCode, ErrorKind, ErrorLabel, Result};
pub use timestamp::Timestamp;
pub use txn::{Decision, ReadConcern, ReadConcernLevel, TxnState};
pub use types::{ChildSession, Document, Key, KeyRange, Lsid, Mutation, ShardId, TxnId, TxnNumber};
