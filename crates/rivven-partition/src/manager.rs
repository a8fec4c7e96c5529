//! Partition manager - owns every partition of a node
//!
//! The PartitionManager is the entry point for the broker:
//! - Bootstraps partitions with their persisted dynamic configuration
//! - Routes role notifications from consensus to the right partition
//! - Broadcasts disk space changes
//! - Rolls partition health up into a broker-wide [`HealthTree`]
//! - Closes all partitions on shutdown

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actor::{PartitionActor, PartitionDependencies, PartitionHandle};
use crate::admin::AdminAccess;
use crate::config::PartitionConfig;
use crate::config_manager::ConfigurationManager;
use crate::dynamic_config::{ConfigStore, FileConfigStore, InMemoryConfigStore};
use crate::error::{PartitionError, Result};
use crate::health::{HealthReport, HealthReporter, HealthTree};
use crate::listener::RoleObserver;
use crate::role::{PartitionId, RaftRole, Term};
use crate::services::{ConsensusHandle, ServiceFactory};

/// Registry of the partitions hosted by this node
pub struct PartitionManager {
    config: PartitionConfig,
    factory: Arc<dyn ServiceFactory>,
    config_store: Arc<dyn ConfigStore>,
    observers: Vec<Arc<dyn RoleObserver>>,
    partitions: DashMap<PartitionId, PartitionHandle>,
    health: Arc<HealthTree>,
}

impl PartitionManager {
    /// Create a manager; dynamic config is file-backed when `config_dir` is set
    pub async fn new(config: PartitionConfig, factory: Arc<dyn ServiceFactory>) -> Result<Self> {
        config.validate()?;
        let config_store: Arc<dyn ConfigStore> = match &config.config_dir {
            Some(dir) => Arc::new(FileConfigStore::open(dir).await?),
            None => Arc::new(InMemoryConfigStore::new()),
        };
        Ok(Self::with_config_store(config, factory, config_store))
    }

    /// Create a manager over an existing config store
    pub fn with_config_store(
        config: PartitionConfig,
        factory: Arc<dyn ServiceFactory>,
        config_store: Arc<dyn ConfigStore>,
    ) -> Self {
        let health = Arc::new(HealthTree::new(format!("broker-{}", config.node_id)));
        Self {
            config,
            factory,
            config_store,
            observers: Vec::new(),
            partitions: DashMap::new(),
            health,
        }
    }

    /// Observer added to every partition bootstrapped afterwards
    pub fn with_role_observer(mut self, observer: Arc<dyn RoleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Start a partition with its persisted dynamic configuration
    pub async fn bootstrap(
        &self,
        partition_id: PartitionId,
        consensus: Arc<dyn ConsensusHandle>,
    ) -> Result<PartitionHandle> {
        if self.partitions.contains_key(&partition_id) {
            return Err(PartitionError::PartitionAlreadyExists(partition_id));
        }

        let mut dynamic_config = ConfigurationManager::new(partition_id, self.config_store.clone())
            .load()
            .await?;
        for exporter_id in &self.config.exporters {
            dynamic_config.register_exporter(exporter_id);
        }

        let deps = PartitionDependencies {
            factory: self.factory.clone(),
            consensus,
            config_store: self.config_store.clone(),
            observers: self.observers.clone(),
        };
        let handle = PartitionActor::spawn(&self.config, partition_id, dynamic_config, deps);

        let inserted = match self.partitions.entry(partition_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(handle.clone());
                true
            }
        };
        if !inserted {
            // bootstrapped concurrently
            handle.close().await?;
            return Err(PartitionError::PartitionAlreadyExists(partition_id));
        }

        self.health.register(partition_id.to_string());
        handle.add_failure_listener(self.health.clone()).await?;

        info!(partition = %partition_id, node_id = %self.config.node_id, "Bootstrapped partition");
        Ok(handle)
    }

    pub fn partition(&self, partition_id: PartitionId) -> Option<PartitionHandle> {
        self.partitions.get(&partition_id).map(|e| e.value().clone())
    }

    fn require(&self, partition_id: PartitionId) -> Result<PartitionHandle> {
        self.partition(partition_id)
            .ok_or(PartitionError::PartitionNotFound(partition_id))
    }

    /// Identifiers of all hosted partitions, sorted
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Forward a role notification from consensus
    pub async fn on_role_changed(
        &self,
        partition_id: PartitionId,
        role: RaftRole,
        term: Term,
    ) -> Result<()> {
        self.require(partition_id)?
            .on_role_changed(role, term)
            .await
    }

    /// Tell every partition whether disk space is available
    pub async fn on_disk_space(&self, available: bool) -> Result<()> {
        let handles: Vec<_> = self.partitions.iter().map(|e| e.value().clone()).collect();
        debug!(available, partitions = handles.len(), "Broadcasting disk space change");
        for handle in handles {
            handle.on_disk_space(available).await?;
        }
        Ok(())
    }

    pub fn admin(&self, partition_id: PartitionId) -> Result<AdminAccess> {
        Ok(self.require(partition_id)?.admin())
    }

    /// Broker-wide health: the worst status of any partition
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn health_tree(&self) -> &Arc<HealthTree> {
        &self.health
    }

    /// Close one partition and forget it
    pub async fn close_partition(&self, partition_id: PartitionId) -> Result<()> {
        let (_, handle) = self
            .partitions
            .remove(&partition_id)
            .ok_or(PartitionError::PartitionNotFound(partition_id))?;
        handle.close().await?;
        self.health.remove(&partition_id.to_string());
        info!(partition = %partition_id, "Closed partition");
        Ok(())
    }

    /// Close every partition, waiting for their services to be torn down
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<_> = self.partitions.iter().map(|e| e.value().clone()).collect();
        self.partitions.clear();
        info!(node_id = %self.config.node_id, partitions = handles.len(), "Shutting down partitions");

        let results = join_all(handles.iter().map(|handle| handle.close())).await;

        let mut first_error = None;
        for (handle, result) in handles.iter().zip(results) {
            self.health.remove(&handle.partition_id().to_string());
            if let Err(e) = result {
                warn!(partition = %handle.partition_id(), error = %e, "Failed to close partition");
                first_error.get_or_insert(e);
            }
        }

        info!(node_id = %self.config.node_id, "Partition manager shutdown complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
