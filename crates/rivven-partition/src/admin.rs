//! Administrative access to a partition
//!
//! Every operation is a message to the partition mailbox, so it is ordered
//! with role changes and never sees a half-finished transition. Operations
//! are safe to call in any role: changes to processing or exporting are
//! persisted and honored by the next installation when no service is running.
//! Calls on one partition complete in the order they were issued.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::actor::{Command, PartitionHandle};
use crate::config_manager::ConfigChange;
use crate::dynamic_config::ExportingPhase;
use crate::error::Result;
use crate::role::{InstanceKey, PartitionId};
use crate::services::{ExporterInitialization, SnapshotId};

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum AdminCommand {
    TakeSnapshot {
        reply: Reply<SnapshotId>,
    },
    ChangeConfig {
        change: ConfigChange,
        reply: Reply<()>,
    },
    BanInstance {
        instance_key: InstanceKey,
        reply: Reply<()>,
    },
}

/// Administrative operations on a partition
#[async_trait]
pub trait AdminSurface: Send + Sync {
    /// Force a snapshot; fails when no snapshot scheduler is installed
    async fn take_snapshot(&self) -> Result<SnapshotId>;

    async fn pause_processing(&self) -> Result<()>;

    async fn resume_processing(&self) -> Result<()>;

    async fn pause_exporting(&self) -> Result<()>;

    /// Keep exporting without acknowledging exported positions
    async fn soft_pause_exporting(&self) -> Result<()>;

    async fn resume_exporting(&self) -> Result<()>;

    async fn disable_exporter(&self, exporter_id: &str) -> Result<()>;

    async fn enable_exporter(
        &self,
        exporter_id: &str,
        metadata_version: u64,
        initialize_from: Option<&str>,
    ) -> Result<()>;

    /// Ban a process instance; the ban is written to the log before it is applied
    async fn ban_instance(&self, instance_key: InstanceKey) -> Result<()>;
}

/// Admin façade over a partition's mailbox
#[derive(Clone)]
pub struct AdminAccess {
    handle: PartitionHandle,
}

impl AdminAccess {
    pub(crate) fn new(handle: PartitionHandle) -> Self {
        Self { handle }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.handle.partition_id()
    }

    async fn send<T>(&self, make: impl FnOnce(Reply<T>) -> AdminCommand) -> Result<T> {
        self.handle
            .call(|reply| Command::Admin(make(reply)))
            .await?
    }

    async fn change_config(&self, change: ConfigChange) -> Result<()> {
        self.send(|reply| AdminCommand::ChangeConfig { change, reply })
            .await
    }
}

#[async_trait]
impl AdminSurface for AdminAccess {
    async fn take_snapshot(&self) -> Result<SnapshotId> {
        self.send(|reply| AdminCommand::TakeSnapshot { reply }).await
    }

    async fn pause_processing(&self) -> Result<()> {
        self.change_config(ConfigChange::ProcessingPaused(true)).await
    }

    async fn resume_processing(&self) -> Result<()> {
        self.change_config(ConfigChange::ProcessingPaused(false)).await
    }

    async fn pause_exporting(&self) -> Result<()> {
        self.change_config(ConfigChange::Exporting(ExportingPhase::Paused))
            .await
    }

    async fn soft_pause_exporting(&self) -> Result<()> {
        self.change_config(ConfigChange::Exporting(ExportingPhase::SoftPaused))
            .await
    }

    async fn resume_exporting(&self) -> Result<()> {
        self.change_config(ConfigChange::Exporting(ExportingPhase::Exporting))
            .await
    }

    async fn disable_exporter(&self, exporter_id: &str) -> Result<()> {
        self.change_config(ConfigChange::DisableExporter(exporter_id.to_string()))
            .await
    }

    async fn enable_exporter(
        &self,
        exporter_id: &str,
        metadata_version: u64,
        initialize_from: Option<&str>,
    ) -> Result<()> {
        let initialization = ExporterInitialization {
            metadata_version,
            initialize_from: initialize_from.map(str::to_string),
        };
        self.change_config(ConfigChange::EnableExporter {
            exporter_id: exporter_id.to_string(),
            initialization,
        })
        .await
    }

    async fn ban_instance(&self, instance_key: InstanceKey) -> Result<()> {
        self.send(|reply| AdminCommand::BanInstance {
            instance_key,
            reply,
        })
        .await
    }
}
