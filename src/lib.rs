//! Tessera - distributed transaction coordination core
//!
//! Multi-document transactions across shards: a router drives statements,
//! shards buffer and prepare them, and a two-phase commit coordinator
//! records one durable decision per transaction. Range migrations are
//! interlocked with prepared transactions.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{Cluster, Key, KeyRange, Lsid, ReadConcern};
//!
//! let cluster = Cluster::builder()
//!     .shard("a", vec![KeyRange::new(Key::min(), Key::int(100))])
//!     .shard("b", vec![KeyRange::from(Key::int(100))])
//!     .open()?;
//!
//! let mut txn = cluster.router().begin(Lsid::new(), ReadConcern::snapshot());
//! txn.insert(Key::int(1), serde_json::json!({"balance": 100}))?;
//! txn.insert(Key::int(150), serde_json::json!({"balance": 100}))?;
//! txn.commit()?;
//! ```
//!
//! # Architecture
//!
//! - `tessera-core`: identities, keys, timestamps, errors and their labels
//! - `tessera-storage`: versioned store, logical clock, prepare conflicts
//! - `tessera-durability`: record logs, coordinator documents, term fencing
//! - `tessera-concurrency`: participant state machine, migration interlock
//! - `tessera-engine`: shards, router, coordinator, migrations, cluster

pub use tessera_core::*;
pub use tessera_engine::*;

pub use tessera_concurrency::{MigrationKind, MigrationPhase, ReapStats};
pub use tessera_durability::DurabilityMode;
