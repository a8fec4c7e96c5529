//! # Rivven Partition
//!
//! Partition lifecycle and role-transition orchestration for Rivven brokers:
//! - **Role transitions**: install and tear down the services a replica needs
//!   whenever consensus makes it leader, follower or inactive
//! - **Health**: a multi-factor, monotonic health report per partition,
//!   rolled up into a broker-wide health tree
//! - **Administration**: pause/resume processing and exporting, toggle
//!   exporters, force snapshots and ban process instances in any role
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PartitionManager                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  PartitionHandle ──► mailbox ──► PartitionActor (1 per part.)│
//! │                                  ├─ PartitionRuntimeState    │
//! │                                  ├─ TransitionEngine         │
//! │                                  ├─ HealthAggregator         │
//! │                                  └─ ConfigurationManager     │
//! ├───────────────┬────────────────┬──────────────┬──────────────┤
//! │    Storage    │Stream Processor│   Exporters  │  Snapshots   │
//! └───────────────┴────────────────┴──────────────┴──────────────┘
//! ```
//!
//! All mutations of a partition's state happen inside its actor; there is no
//! shared-memory locking. Slow work runs in spawned tasks that post their
//! continuation back to the mailbox.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use rivven_partition::prelude::*;
//!
//! let config = PartitionConfig::builder()
//!     .node_id("broker-1")
//!     .config_dir("/var/lib/rivven/partitions")
//!     .exporter("elastic")
//!     .build();
//! let manager = PartitionManager::new(config, factory).await?;
//!
//! let partition = manager.bootstrap(PartitionId::new(1), consensus).await?;
//! partition.transition_to(RaftRole::Leader, 1).await?;
//!
//! partition.admin().pause_exporting().await?;
//! assert!(partition.health_report().is_healthy());
//!
//! manager.shutdown().await?;
//! ```

pub mod actor;
pub mod admin;
pub mod config;
pub mod config_manager;
pub mod dynamic_config;
pub mod error;
pub mod health;
pub mod listener;
pub mod manager;
pub mod role;
pub mod services;
pub mod state;
pub mod transition;

// Re-export main types
pub use actor::{FailureNotifier, PartitionActor, PartitionDependencies, PartitionHandle};
pub use admin::{AdminAccess, AdminSurface};
pub use config::{PartitionConfig, PartitionConfigBuilder};
pub use config_manager::{ConfigChange, ConfigurationManager};
pub use dynamic_config::{
    ConfigStore, DynamicPartitionConfig, ExporterState, ExportingPhase, FileConfigStore,
    InMemoryConfigStore,
};
pub use error::{FailureKind, PartitionError, Result};
pub use health::{
    FailureListener, HealthAggregator, HealthInputs, HealthIssue, HealthReport, HealthReporter,
    HealthStatus, HealthSubscription, HealthTree, ListenerId,
};
pub use listener::{RoleEvent, RoleObserver};
pub use manager::PartitionManager;
pub use role::{InstanceKey, NodeId, PartitionId, PartitionRole, RaftRole, Term};
pub use services::{
    BannedInstanceIndex, Component, ConsensusHandle, ExporterInitialization, ExporterPipeline,
    InstallContext, LogRecord, LogWriter, PartitionStorage, Position, ServiceFactory, SnapshotId,
    SnapshotScheduler, StreamProcessor,
};
pub use state::{InstalledService, PartitionRuntimeState, PartitionStatus};
pub use transition::{TransitionEngine, TransitionStep};

/// Re-export common types
pub mod prelude {
    pub use crate::admin::{AdminAccess, AdminSurface};
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::health::{HealthReport, HealthReporter, HealthStatus};
    pub use crate::listener::*;
    pub use crate::manager::PartitionManager;
    pub use crate::role::*;
    pub use crate::services::*;
}
