//! Runtime configuration shared by storage-core bootstrap code.

use thiserror::Error;

use crate::ids::ShardCount;

/// Configuration validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A config option holds a value the storage core does not support.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Storage-core configuration.
///
/// The command-layer pass-through lists (`rename_command` and friends) are carried verbatim so a
/// process embedding this core can hand them to its dispatch layer; the core itself does not
/// interpret them.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Number of shard owners used by shared-nothing execution.
    pub shard_count: ShardCount,
    /// Total memory limit in bytes. Zero disables the limit.
    pub max_memory_bytes: u64,
    /// Cache mode evicts under pressure; store mode rejects insertions at the hard limit.
    pub cache_mode: bool,
    /// Allocates the 16384-slot statistics array per database when enabled.
    pub cluster_slot_stats: bool,
    /// Upper bound of evicted entries per heartbeat eviction step.
    pub max_eviction_per_heartbeat: u32,
    /// Number of segments inspected by one heartbeat eviction step.
    pub max_segment_to_consider: u32,
    /// Conservative growth margin applied to projected free-slot memory estimates.
    pub table_growth_margin: f64,
    /// Keyspace notification classes. Only `""` (disabled) and `"Ex"` are supported.
    pub notify_keyspace_events: String,
    /// Decommit freed memory after cluster slot flushes.
    pub cluster_flush_decommit_memory: bool,
    /// Produce point-in-time snapshots; otherwise moved-entry tracking is used.
    pub point_in_time_snapshot: bool,
    /// Deduplicate keys inside MGET at the command layer.
    pub mget_dedup_keys: bool,
    /// Legacy SADDEX keeps the TTL of existing members.
    pub legacy_saddex_keepttl: bool,
    /// Record per-operation latency histograms.
    pub latency_tracking: bool,
    /// Command rename directives, carried for the dispatch layer.
    pub rename_command: Vec<String>,
    /// Commands restricted to admin connections, carried for the dispatch layer.
    pub restricted_commands: Vec<String>,
    /// Commands denied under memory pressure, carried for the dispatch layer.
    pub oom_deny_commands: Vec<String>,
    /// Command alias directives, carried for the dispatch layer.
    pub command_alias: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: ShardCount::new(4).expect("literal shard count must be non-zero"),
            max_memory_bytes: 0,
            cache_mode: false,
            cluster_slot_stats: false,
            max_eviction_per_heartbeat: 100,
            max_segment_to_consider: 4,
            table_growth_margin: 0.4,
            notify_keyspace_events: String::new(),
            cluster_flush_decommit_memory: false,
            point_in_time_snapshot: true,
            mget_dedup_keys: false,
            legacy_saddex_keepttl: false,
            latency_tracking: false,
            rename_command: Vec::new(),
            restricted_commands: Vec::new(),
            oom_deny_commands: Vec::new(),
            command_alias: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Validates option combinations the core cannot serve.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when `notify_keyspace_events` names an unsupported event
    /// class or the growth margin is outside `(0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.notify_keyspace_events.is_empty() && self.notify_keyspace_events != "Ex" {
            return Err(ConfigError::Invalid(
                "notify_keyspace_events supports only the Ex class",
            ));
        }
        if !(self.table_growth_margin > 0.0 && self.table_growth_margin <= 1.0) {
            return Err(ConfigError::Invalid(
                "table_growth_margin must be within (0, 1]",
            ));
        }
        Ok(())
    }

    /// Returns whether expired-key events should be recorded for the keyspace channel.
    #[must_use]
    pub fn expired_events_enabled(&self) -> bool {
        !self.notify_keyspace_events.is_empty()
    }
}
