//! An in-process cluster: shards, coordinator, router and background work
//!
//! [`ClusterBuilder`] wires everything together. With a data directory the
//! layout is:
//!
//! ```text
//! <dir>/tessera.toml          cluster configuration (created on first open)
//! <dir>/shards/<name>/        participant log of each shard
//! <dir>/coordinator/          coordinator documents
//! ```
//!
//! On reopen, shards replay their logs (prepared transactions come back
//! prepared), the routing table is rebuilt from the ranges the shards
//! durably own, and the coordinator finishes any document left behind.

use crate::background::{BackgroundScheduler, TaskPriority};
use crate::client::{FaultyParticipant, LocalParticipant, ParticipantClient, ShardRegistry};
use crate::config::ClusterConfig;
use crate::coordinator::CoordinatorService;
use crate::migration::{MigrationDriver, MigrationReport};
use crate::router::Router;
use crate::routing::{Catalog, Chunk, RoutingTable};
use crate::shard::Shard;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tessera_concurrency::{MigrationKind, ReapStats};
use tessera_core::{Error, KeyRange, Result, ShardId};
use tessera_durability::{CoordinatorStore, DurabilityMode, ReplicationTerm};
use tracing::{info, warn};

const SCHEDULER_QUEUE_DEPTH: usize = 1024;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`Cluster`]
#[derive(Debug, Clone, Default)]
pub struct ClusterBuilder {
    shards: Vec<(ShardId, Vec<KeyRange>)>,
    path: Option<PathBuf>,
    config: Option<ClusterConfig>,
    fault_injection: bool,
}

impl ClusterBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard owning `ranges` on first open
    pub fn shard(mut self, name: &str, ranges: Vec<KeyRange>) -> Self {
        self.shards.push((ShardId::new(name), ranges));
        self
    }

    /// Persist state under `path`
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use `config` instead of the defaults or `tessera.toml`
    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Put a [`FaultyParticipant`] in front of every shard
    pub fn with_fault_injection(mut self) -> Self {
        self.fault_injection = true;
        self
    }

    /// Open the cluster
    pub fn open(self) -> Result<Cluster> {
        if self.shards.is_empty() {
            return Err(Error::BadValue("a cluster needs at least one shard".into()));
        }
        let config = match (&self.config, &self.path) {
            (Some(config), _) => config.clone(),
            (None, Some(path)) => ClusterConfig::load_or_create(path)?,
            (None, None) => ClusterConfig::default(),
        };
        let mode = config.durability_mode()?;

        let registry = Arc::new(ShardRegistry::new());
        let mut shards = BTreeMap::new();
        let mut faults = BTreeMap::new();
        let mut chunks = Vec::new();
        for (id, ranges) in self.shards {
            let shard = match &self.path {
                Some(path) => Shard::open(id.clone(), &path.join("shards").join(id.as_str()), ranges, &config)?,
                None => Shard::in_memory(id.clone(), ranges, &config),
            };
            let shard = Arc::new(shard);
            for range in shard.interlock().owned_ranges() {
                chunks.push(Chunk {
                    range,
                    shard: id.clone(),
                });
            }
            let local: Arc<dyn ParticipantClient> = Arc::new(LocalParticipant::new(Arc::clone(&shard)));
            if self.fault_injection {
                let faulty = Arc::new(FaultyParticipant::new(local));
                registry.register(Arc::clone(&faulty) as Arc<dyn ParticipantClient>);
                faults.insert(id.clone(), faulty);
            } else {
                registry.register(local);
            }
            shards.insert(id, shard);
        }
        let catalog = Arc::new(Catalog::new(RoutingTable::new(chunks)?));

        let term = Arc::new(ReplicationTerm::new("coordinator"));
        let store = match &self.path {
            Some(path) if mode != DurabilityMode::Cache => {
                let dir = path.join("coordinator");
                std::fs::create_dir_all(&dir)?;
                CoordinatorStore::open(&dir, mode, term)?
            }
            _ => CoordinatorStore::in_memory(term),
        };
        let coordinator = Arc::new(CoordinatorService::new(
            Arc::new(store),
            Arc::clone(&registry),
            config.retry_policy(),
        ));
        if !coordinator.store().is_empty() {
            let finished = coordinator.step_up();
            info!(target: "tessera::2pc", finished, "Finished coordinator documents left by the last run");
        }

        let router = Arc::new(Router::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            config.race_policy(),
        )
        .with_read_retry(config.retry_policy())
        .with_session_limits(config.session_limits()));
        let migrations = MigrationDriver::new(
            Arc::clone(&catalog),
            shards.values().cloned().collect(),
            config.migration_blocking_timeout(),
        );

        let scheduler = BackgroundScheduler::new(config.background_threads, SCHEDULER_QUEUE_DEPTH)?;
        let reaped: Vec<Arc<Shard>> = shards.values().cloned().collect();
        let reaped_router = Arc::clone(&router);
        let interval = Duration::from_millis((config.transaction_lifetime_limit_ms / 4).max(10));
        scheduler.schedule_every("reaper", TaskPriority::Low, interval, move || {
            reaped_router.reap();
            for shard in &reaped {
                if shard.is_primary() {
                    shard.reap();
                }
            }
        })?;

        info!(
            target: "tessera::txn",
            shards = shards.len(),
            durability = mode.description(),
            persistent = self.path.is_some(),
            "Cluster open"
        );
        Ok(Cluster {
            config,
            shards,
            faults,
            catalog,
            coordinator,
            router,
            migrations,
            scheduler,
            path: self.path,
        })
    }
}

/// Shards, coordinator and router of one process
pub struct Cluster {
    config: ClusterConfig,
    shards: BTreeMap<ShardId, Arc<Shard>>,
    faults: BTreeMap<ShardId, Arc<FaultyParticipant>>,
    catalog: Arc<Catalog>,
    coordinator: Arc<CoordinatorService>,
    router: Arc<Router>,
    migrations: MigrationDriver,
    scheduler: BackgroundScheduler,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .field("routing_version", &self.catalog.version())
            .field("path", &self.path)
            .finish()
    }
}

impl Cluster {
    /// Start building a cluster
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    /// Configuration in effect
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Router clients talk to
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// A shard by name
    pub fn shard(&self, name: &str) -> Result<&Arc<Shard>> {
        let id = ShardId::new(name);
        self.shards.get(&id).ok_or(Error::ShardNotFound(id))
    }

    /// All shards
    pub fn shards(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.values()
    }

    /// Fault injector in front of a shard, if enabled
    pub fn faults(&self, name: &str) -> Option<&Arc<FaultyParticipant>> {
        self.faults.get(&ShardId::new(name))
    }

    /// Commit coordinator
    pub fn coordinator(&self) -> &Arc<CoordinatorService> {
        &self.coordinator
    }

    /// Authoritative routing table
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Data directory, if persistent
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Move `range` to shard `to` from whichever shard owns it now
    pub fn move_range(&self, range: &KeyRange, to: &str, kind: MigrationKind) -> Result<MigrationReport> {
        let donor = self.catalog.current().shard_for(&range.start)?.clone();
        self.migrations.move_range(range, &donor, &ShardId::new(to), kind)
    }

    /// Simulate a coordinator failover; returns the documents finished
    pub fn fail_over_coordinator(&self) -> usize {
        self.coordinator.step_down();
        self.coordinator.step_up()
    }

    /// Step the coordinator down now and let a background worker resume it
    pub fn fail_over_coordinator_in_background(&self) -> Result<()> {
        self.coordinator.step_down();
        let coordinator = Arc::clone(&self.coordinator);
        self.scheduler
            .submit(TaskPriority::High, move || {
                coordinator.step_up();
            })
            .map_err(Error::from)
    }

    /// One reaper pass over the router and every primary shard
    pub fn reap(&self) -> ReapStats {
        let router = self.router.reap();
        self.shards
            .values()
            .filter(|s| s.is_primary())
            .map(|s| s.reap())
            .fold(router, |acc, s| ReapStats {
                expired: acc.expired + s.expired,
                reaped: acc.reaped + s.reaped,
            })
    }

    /// Wait for queued background work
    pub fn drain_background(&self) {
        self.scheduler.drain();
    }

    /// Wait for in-flight commits, then stop background work
    pub fn shutdown(&self) {
        if !self.coordinator.wait_for_idle(SHUTDOWN_TIMEOUT) {
            warn!(target: "tessera::2pc", "Shutting down with commits still in flight");
        }
        self.scheduler.shutdown();
    }
}
