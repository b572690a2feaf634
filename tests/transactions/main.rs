//! Cross-shard transaction integration tests
//!
//! End-to-end scenarios through the router, coordinator, shards and
//! migration driver of an in-process cluster.

#[path = "../common/mod.rs"]
mod common;

mod failover;
mod lifecycle;
mod migration;
mod properties;
mod visibility;
