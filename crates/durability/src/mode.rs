//! Durability mode configuration
//!
//! Controls record log sync behavior (Cache, Standard, Always).

/// Durability mode for record logs
///
/// # Modes
///
/// | Mode | fsync | Data Loss Window |
/// |------|-------|-----------------|
/// | Cache | Never | Everything (no files) |
/// | Always | Every append | Zero |
/// | Standard | Periodic | Up to interval/batch |
///
/// A shard stands in for a replica set, so "majority durable" is modelled
/// as "appended and synced under `Always`". Tests that simulate crashes
/// use `Always`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// In-memory only; all state lost on restart
    Cache,

    /// fsync after every append
    Always,

    /// fsync every N appends OR every T milliseconds
    Standard {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum appends between fsyncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Check if this mode writes files at all
    pub fn requires_log(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// Check if this mode requires immediate fsync on every append
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Cache => "Cache (no files, all state lost on restart)",
            DurabilityMode::Always => "Always sync (safest, slowest)",
            DurabilityMode::Standard { .. } => "Standard (balanced speed/safety)",
        }
    }

    /// Standard mode with 100ms / 1000 appends thresholds
    pub fn standard_default() -> Self {
        DurabilityMode::Standard {
            interval_ms: 100,
            batch_size: 1000,
        }
    }

    /// Parse the configuration spelling (`"cache"`, `"standard"`, `"always"`)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cache" => Some(DurabilityMode::Cache),
            "standard" => Some(DurabilityMode::standard_default()),
            "always" => Some(DurabilityMode::Always),
            _ => None,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::standard_default()
    }
}
