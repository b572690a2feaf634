//! Cluster engine for Tessera
//!
//! This crate wires the lower layers into a working cluster:
//! - Shard: one participant (store, clock, transaction table, interlock, log)
//! - Router: session-facing transactions spanning shards
//! - CoordinatorService: two-phase commit with durable decisions
//! - MigrationDriver: range moves between shards
//! - Cluster: builder, failover hooks, background reaping
//!
//! Shards are reached through the [`ParticipantClient`] trait so tests can
//! put a [`FaultyParticipant`] in front of any of them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod migration;
pub mod retry;
pub mod router;
pub mod routing;
pub mod shard;

pub use background::{BackgroundScheduler, BackpressureError, SchedulerStats, TaskPriority};
pub use client::{Fault, FaultyParticipant, LocalParticipant, Op, ParticipantClient, ShardRegistry};
pub use cluster::{Cluster, ClusterBuilder};
pub use command::{Statement, StatementReply, StatementRequest, StatementResult, Target};
pub use config::{ClusterConfig, MigrationConfig, MigrationRacePolicy, RetryConfig, CONFIG_FILE_NAME};
pub use coordinator::{CoordinatorMetrics, CoordinatorService};
pub use migration::{MigrationDriver, MigrationReport};
pub use retry::RetryPolicy;
pub use router::{Router, SessionLimits, Transaction};
pub use routing::{Catalog, Chunk, RoutingTable};
pub use shard::Shard;
