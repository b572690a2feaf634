//! Storage primitives for Tessera shards
//!
//! This crate stands in for the storage/replication layer and exposes the
//! three primitives the transaction core consumes:
//! - `VersionedStore::write_at_timestamp` / `read_at`: MVCC documents
//! - `PrepareConflictTracker`: "blocked" answers for reads and writes that
//!   touch keys of prepared transactions
//! - `LogicalClock::next_timestamp`: monotonic logical time

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod mvcc;
pub mod prepare;

pub use clock::LogicalClock;
pub use mvcc::{StoredVersion, VersionChain, VersionedStore};
pub use prepare::{Access, PrepareConflictTracker};
