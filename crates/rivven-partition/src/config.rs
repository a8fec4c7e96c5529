//! Partition orchestration configuration

use crate::error::{PartitionError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Static configuration shared by all partitions of a node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Node identifier (unique across cluster)
    pub node_id: String,

    /// Capacity of each partition's command mailbox
    pub mailbox_capacity: usize,

    /// A transition step running longer than this is reported as stuck
    pub transition_stuck_timeout: Duration,

    /// Interval between periodic health re-evaluations
    pub health_check_interval: Duration,

    /// Period handed to the snapshot scheduler on install
    pub snapshot_period: Duration,

    /// Directory for persisted dynamic configuration (in-memory when unset)
    pub config_dir: Option<PathBuf>,

    /// Exporters configured on this node
    pub exporters: Vec<String>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            node_id: "standalone".to_string(),
            mailbox_capacity: 1024,
            transition_stuck_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(1),
            snapshot_period: Duration::from_secs(5 * 60),
            config_dir: None,
            exporters: Vec::new(),
        }
    }
}

impl PartitionConfig {
    /// Create configuration builder
    pub fn builder() -> PartitionConfigBuilder {
        PartitionConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(PartitionError::InvalidConfig("node_id must not be empty".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(PartitionError::InvalidConfig(
                "mailbox_capacity must be greater than 0".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PartitionError::InvalidConfig(
                "health_check_interval must be greater than 0".into(),
            ));
        }
        if self.transition_stuck_timeout.is_zero() {
            return Err(PartitionError::InvalidConfig(
                "transition_stuck_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for partition configuration
#[derive(Debug, Default)]
pub struct PartitionConfigBuilder {
    node_id: Option<String>,
    mailbox_capacity: Option<usize>,
    transition_stuck_timeout: Option<Duration>,
    health_check_interval: Option<Duration>,
    snapshot_period: Option<Duration>,
    config_dir: Option<PathBuf>,
    exporters: Vec<String>,
}

impl PartitionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = Some(capacity);
        self
    }

    pub fn transition_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.transition_stuck_timeout = Some(timeout);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot_period = Some(period);
        self
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn exporter(mut self, id: impl Into<String>) -> Self {
        self.exporters.push(id.into());
        self
    }

    pub fn build(self) -> PartitionConfig {
        let defaults = PartitionConfig::default();
        PartitionConfig {
            node_id: self.node_id.unwrap_or(defaults.node_id),
            mailbox_capacity: self.mailbox_capacity.unwrap_or(defaults.mailbox_capacity),
            transition_stuck_timeout: self
                .transition_stuck_timeout
                .unwrap_or(defaults.transition_stuck_timeout),
            health_check_interval: self
                .health_check_interval
                .unwrap_or(defaults.health_check_interval),
            snapshot_period: self.snapshot_period.unwrap_or(defaults.snapshot_period),
            config_dir: self.config_dir,
            exporters: self.exporters,
        }
    }
}
