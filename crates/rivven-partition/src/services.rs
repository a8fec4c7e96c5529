//! Dependent services and external collaborators
//!
//! The orchestrator never implements storage, stream processing, exporting or
//! consensus itself. It drives them through the narrow traits in this module:
//!
//! - [`ServiceFactory`] opens the services a role needs
//! - [`PartitionStorage`], [`StreamProcessor`], [`ExporterPipeline`] and
//!   [`SnapshotScheduler`] are the installed services
//! - [`ConsensusHandle`] is the way back into the consensus layer
//!
//! Every service is owned by exactly one partition at a time and is only
//! touched from that partition's mailbox or from continuations it spawns.

use crate::actor::FailureNotifier;
use crate::dynamic_config::DynamicPartitionConfig;
use crate::error::Result;
use crate::role::{InstanceKey, NodeId, PartitionId, PartitionRole, Term};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Position of a record in the partition log
pub type Position = u64;

/// Dependent service installed by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Storage,
    StreamProcessor,
    ExporterPipeline,
    SnapshotScheduler,
}

impl Component {
    /// Order in which services are opened; teardown runs in reverse
    pub const INSTALL_ORDER: [Component; 4] = [
        Component::Storage,
        Component::StreamProcessor,
        Component::ExporterPipeline,
        Component::SnapshotScheduler,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Component::Storage => "storage",
            Component::StreamProcessor => "stream processor",
            Component::ExporterPipeline => "exporter pipeline",
            Component::SnapshotScheduler => "snapshot scheduler",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Records the orchestrator appends to the partition log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A process instance was banned from further processing
    InstanceBanned { instance_key: InstanceKey },
}

/// Identifier of a persisted snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    pub term: Term,
    pub position: Position,
    /// Milliseconds since the Unix epoch
    pub taken_at_ms: u64,
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.term, self.position, self.taken_at_ms)
    }
}

/// How a re-enabled exporter is initialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterInitialization {
    /// Version of the exporter metadata the exporter starts with
    pub metadata_version: u64,
    /// Exporter whose position and metadata are copied, if any
    pub initialize_from: Option<String>,
}

/// Appends records to the partition log
#[async_trait]
pub trait LogWriter: Send {
    /// Append a record, returning its position once it is durable
    async fn append(&mut self, record: LogRecord) -> Result<Position>;
}

/// Set of banned process instances kept in the state machine's on-disk index
pub trait BannedInstanceIndex: Send + Sync {
    fn ban(&self, instance_key: InstanceKey) -> Result<()>;

    fn is_banned(&self, instance_key: InstanceKey) -> bool;
}

/// Log storage and state-machine database of one partition
#[async_trait]
pub trait PartitionStorage: Send + Sync {
    /// Acquire a fresh writer for the partition log
    async fn new_log_writer(&self) -> Result<Box<dyn LogWriter>>;

    fn banned_instances(&self) -> &dyn BannedInstanceIndex;

    async fn close(&self) -> Result<()>;
}

/// Processes (leader) or replays (follower) the partition log
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Runs the configured exporters over the partition log
#[async_trait]
pub trait ExporterPipeline: Send + Sync {
    /// Stop exporting immediately
    async fn pause(&self) -> Result<()>;

    /// Keep exporting but stop acknowledging exported positions
    async fn soft_pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn disable_exporter(&self, exporter_id: &str) -> Result<()>;

    async fn enable_exporter(
        &self,
        exporter_id: &str,
        initialization: &ExporterInitialization,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Takes snapshots periodically and on demand
#[async_trait]
pub trait SnapshotScheduler: Send + Sync {
    async fn force_snapshot(&self) -> Result<SnapshotId>;

    async fn close(&self) -> Result<()>;
}

/// Calls from the orchestrator back into the consensus layer
#[async_trait]
pub trait ConsensusHandle: Send + Sync {
    /// Give up leadership for the current term
    async fn step_down(&self) -> Result<()>;

    /// Stop the raft partition for good
    async fn stop(&self) -> Result<()>;
}

/// Everything a service needs to know when it is opened
#[derive(Clone)]
pub struct InstallContext {
    pub partition_id: PartitionId,
    pub node_id: NodeId,
    pub role: PartitionRole,
    pub term: Term,
    /// Dynamic configuration at the time the step started
    pub dynamic_config: DynamicPartitionConfig,
    pub disk_space_available: bool,
    pub snapshot_period: Duration,
    /// Channel for failures the service hits after it is installed
    pub failures: FailureNotifier,
}

impl InstallContext {
    /// Whether a stream processor opened with this context must start paused
    pub fn processing_paused(&self) -> bool {
        self.dynamic_config.processing_paused || !self.disk_space_available
    }
}

impl fmt::Debug for InstallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallContext")
            .field("partition_id", &self.partition_id)
            .field("role", &self.role)
            .field("term", &self.term)
            .field("config_version", &self.dynamic_config.version)
            .finish_non_exhaustive()
    }
}

/// Opens the dependent services of a partition
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn open_storage(&self, ctx: &InstallContext) -> Result<Arc<dyn PartitionStorage>>;

    async fn open_stream_processor(
        &self,
        ctx: &InstallContext,
        storage: Arc<dyn PartitionStorage>,
    ) -> Result<Arc<dyn StreamProcessor>>;

    async fn open_exporter_pipeline(
        &self,
        ctx: &InstallContext,
        storage: Arc<dyn PartitionStorage>,
    ) -> Result<Arc<dyn ExporterPipeline>>;

    async fn open_snapshot_scheduler(
        &self,
        ctx: &InstallContext,
        storage: Arc<dyn PartitionStorage>,
    ) -> Result<Arc<dyn SnapshotScheduler>>;
}
