//! Partition runtime state
//!
//! Owned exclusively by the partition actor. Service slots are filled by the
//! transition engine once a transition has fully completed and emptied before
//! the asynchronous close of a teardown starts, so a slot never holds a
//! service of a half-installed role or one that is being closed.

use crate::dynamic_config::DynamicPartitionConfig;
use crate::error::Result;
use crate::health::{HealthInputs, HealthIssue};
use crate::role::{NodeId, PartitionId, PartitionRole, Term};
use crate::services::{
    Component, ExporterPipeline, PartitionStorage, SnapshotScheduler, StreamProcessor,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A dependent service held in one of the state's slots
#[derive(Clone)]
pub enum InstalledService {
    Storage(Arc<dyn PartitionStorage>),
    StreamProcessor(Arc<dyn StreamProcessor>),
    ExporterPipeline(Arc<dyn ExporterPipeline>),
    SnapshotScheduler(Arc<dyn SnapshotScheduler>),
}

impl InstalledService {
    pub fn component(&self) -> Component {
        match self {
            InstalledService::Storage(_) => Component::Storage,
            InstalledService::StreamProcessor(_) => Component::StreamProcessor,
            InstalledService::ExporterPipeline(_) => Component::ExporterPipeline,
            InstalledService::SnapshotScheduler(_) => Component::SnapshotScheduler,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            InstalledService::Storage(s) => s.close().await,
            InstalledService::StreamProcessor(s) => s.close().await,
            InstalledService::ExporterPipeline(s) => s.close().await,
            InstalledService::SnapshotScheduler(s) => s.close().await,
        }
    }
}

impl fmt::Debug for InstalledService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InstalledService")
            .field(&self.component())
            .finish()
    }
}

/// Mutable state of one partition replica
pub struct PartitionRuntimeState {
    partition_id: PartitionId,
    node_id: NodeId,

    /// Role of the latest transition; services are published once it settles
    pub role: PartitionRole,
    pub term: Term,

    /// Transition that installed the current services
    pub generation: u64,

    pub storage: Option<Arc<dyn PartitionStorage>>,
    pub stream_processor: Option<Arc<dyn StreamProcessor>>,
    pub exporter_pipeline: Option<Arc<dyn ExporterPipeline>>,
    pub snapshot_scheduler: Option<Arc<dyn SnapshotScheduler>>,

    /// Survives transitions
    pub dynamic_config: DynamicPartitionConfig,

    pub disk_space_available: bool,
    /// Set once a leader or follower transition has fully settled
    pub services_installed: bool,
    /// Runtime failure reported by an installed service
    pub failure: Option<HealthIssue>,
}

impl PartitionRuntimeState {
    pub fn new(
        partition_id: PartitionId,
        node_id: impl Into<NodeId>,
        dynamic_config: DynamicPartitionConfig,
    ) -> Self {
        Self {
            partition_id,
            node_id: node_id.into(),
            role: PartitionRole::Uninitialized,
            term: 0,
            generation: 0,
            storage: None,
            stream_processor: None,
            exporter_pipeline: None,
            snapshot_scheduler: None,
            dynamic_config,
            disk_space_available: true,
            services_installed: false,
            failure: None,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Put a service into its slot, returning whatever it replaced
    pub fn install(&mut self, service: InstalledService) -> Option<InstalledService> {
        match service {
            InstalledService::Storage(s) => self
                .storage
                .replace(s)
                .map(InstalledService::Storage),
            InstalledService::StreamProcessor(s) => self
                .stream_processor
                .replace(s)
                .map(InstalledService::StreamProcessor),
            InstalledService::ExporterPipeline(s) => self
                .exporter_pipeline
                .replace(s)
                .map(InstalledService::ExporterPipeline),
            InstalledService::SnapshotScheduler(s) => self
                .snapshot_scheduler
                .replace(s)
                .map(InstalledService::SnapshotScheduler),
        }
    }

    /// Empty a slot
    pub fn take(&mut self, component: Component) -> Option<InstalledService> {
        match component {
            Component::Storage => self.storage.take().map(InstalledService::Storage),
            Component::StreamProcessor => self
                .stream_processor
                .take()
                .map(InstalledService::StreamProcessor),
            Component::ExporterPipeline => self
                .exporter_pipeline
                .take()
                .map(InstalledService::ExporterPipeline),
            Component::SnapshotScheduler => self
                .snapshot_scheduler
                .take()
                .map(InstalledService::SnapshotScheduler),
        }
    }

    /// Empty every slot, dependents first
    pub fn take_all(&mut self) -> Vec<InstalledService> {
        Component::INSTALL_ORDER
            .iter()
            .rev()
            .filter_map(|component| self.take(*component))
            .collect()
    }

    pub fn is_installed(&self, component: Component) -> bool {
        match component {
            Component::Storage => self.storage.is_some(),
            Component::StreamProcessor => self.stream_processor.is_some(),
            Component::ExporterPipeline => self.exporter_pipeline.is_some(),
            Component::SnapshotScheduler => self.snapshot_scheduler.is_some(),
        }
    }

    pub fn installed_components(&self) -> Vec<Component> {
        Component::INSTALL_ORDER
            .iter()
            .copied()
            .filter(|component| self.is_installed(*component))
            .collect()
    }

    /// Whether the stream processor should currently be running
    pub fn processing_enabled(&self) -> bool {
        !self.dynamic_config.processing_paused && self.disk_space_available
    }

    pub fn health_inputs(&self, transition_issue: Option<HealthIssue>) -> HealthInputs {
        HealthInputs {
            disk_space_available: self.disk_space_available,
            transition_issue,
            failure: self.failure.clone(),
            services_installed: self.services_installed,
        }
    }
}

impl fmt::Debug for PartitionRuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRuntimeState")
            .field("partition_id", &self.partition_id)
            .field("role", &self.role)
            .field("term", &self.term)
            .field("installed", &self.installed_components())
            .field("services_installed", &self.services_installed)
            .field("disk_space_available", &self.disk_space_available)
            .finish()
    }
}

/// Point-in-time view of a partition, for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub partition_id: PartitionId,
    pub role: PartitionRole,
    pub term: Term,
    pub installed: Vec<Component>,
    pub services_installed: bool,
    pub disk_space_available: bool,
    pub dynamic_config: DynamicPartitionConfig,
    pub transition_in_progress: bool,
    pub dead: bool,
}

impl PartitionStatus {
    pub(crate) fn capture(state: &PartitionRuntimeState, transition_in_progress: bool, dead: bool) -> Self {
        Self {
            partition_id: state.partition_id,
            role: state.role,
            term: state.term,
            installed: state.installed_components(),
            services_installed: state.services_installed,
            disk_space_available: state.disk_space_available,
            dynamic_config: state.dynamic_config.clone(),
            transition_in_progress,
            dead,
        }
    }
}
