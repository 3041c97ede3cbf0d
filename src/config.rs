//! Node Configuration
//!
//! Layered with `figment`: in-code defaults, then an optional TOML file, then
//! `SHARDSEARCH_`-prefixed environment variables (`__` separates sections,
//! e.g. `SHARDSEARCH_QUERY__DEADLINE_MS=500`).

use crate::error::{ClusterError, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub cluster: ClusterConfig,
    pub replication: ReplicationConfig,
    pub query: QueryConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

/// Membership, heartbeat and planner timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub heartbeat_interval_ms: u64,
    pub suspect_after_ms: u64,
    pub dead_after_ms: u64,
    pub planner_lock_ttl_ms: u64,
    pub planner_interval_ms: u64,
    /// How often a node without a local metadata store polls it for changes.
    pub directory_poll_ms: u64,
    /// Relative capacity advertised in heartbeats. Higher takes more shards.
    pub capacity: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            suspect_after_ms: 5_000,
            dead_after_ms: 10_000,
            planner_lock_ttl_ms: 6_000,
            planner_interval_ms: 2_000,
            directory_poll_ms: 250,
            capacity: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub write_timeout_ms: u64,
    /// Commits a replica may trail the primary by before it is marked STALE.
    pub stale_lag_threshold: u64,
    /// Operations kept by a primary for replay-based catch-up.
    pub retained_ops: usize,
    /// Out-of-order operations a replica buffers before giving up and resyncing.
    pub max_pending_ops: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 2_000,
            stale_lag_threshold: 100,
            retained_ops: 10_000,
            max_pending_ops: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub deadline_ms: u64,
    pub assignment_ttl_ms: u64,
    pub cache_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 3_000,
            assignment_ttl_ms: 5_000,
            cache_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 150,
            max_delay_ms: 1_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(NodeConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        let config: NodeConfig = figment
            .merge(Env::prefixed("SHARDSEARCH_").split("__"))
            .extract()
            .map_err(|e| ClusterError::FatalConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.cluster;
        if c.dead_after_ms <= c.suspect_after_ms {
            return Err(ClusterError::FatalConfig(format!(
                "cluster.dead_after_ms ({}) must exceed cluster.suspect_after_ms ({})",
                c.dead_after_ms, c.suspect_after_ms
            )));
        }
        if c.planner_lock_ttl_ms == 0 || c.heartbeat_interval_ms == 0 {
            return Err(ClusterError::FatalConfig(
                "cluster timings must be non-zero".to_string(),
            ));
        }
        if c.capacity <= 0.0 {
            return Err(ClusterError::FatalConfig(
                "cluster.capacity must be positive".to_string(),
            ));
        }
        if self.query.deadline_ms == 0 || self.replication.write_timeout_ms == 0 {
            return Err(ClusterError::FatalConfig(
                "query.deadline_ms and replication.write_timeout_ms must be non-zero"
                    .to_string(),
            ));
        }
        if self.query.cache_capacity == 0 {
            return Err(ClusterError::FatalConfig(
                "query.cache_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClusterConfig {
    pub fn suspect_after(&self) -> Duration {
        Duration::from_millis(self.suspect_after_ms)
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_millis(self.dead_after_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.planner_lock_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn directory_poll(&self) -> Duration {
        Duration::from_millis(self.directory_poll_ms.max(1))
    }
}

impl QueryConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn assignment_ttl(&self) -> Duration {
        Duration::from_millis(self.assignment_ttl_ms)
    }
}

impl ReplicationConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
