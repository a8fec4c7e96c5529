//! Dynamic configuration changes
//!
//! Every change follows the same pattern: apply it to a copy of the
//! committed configuration, persist the copy, and only once the store
//! acknowledged it commit the copy and apply it to the installed services.
//! The partition actor runs one change at a time, so later changes build on
//! what is durable. A failed persist leaves the committed configuration
//! untouched. When no service is installed the committed state is picked up
//! by the next transition.
//!
//! Live applies of one partition (configuration changes, disk space and
//! reconciliation after an install) run one after another on a
//! [`LiveApplier`], in the order the actor submitted them.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dynamic_config::{ConfigStore, DynamicPartitionConfig, ExportingPhase};
use crate::error::Result;
use crate::role::PartitionId;
use crate::services::{ExporterInitialization, ExporterPipeline, StreamProcessor};
use crate::state::PartitionRuntimeState;

/// Administrative change to the dynamic configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    ProcessingPaused(bool),
    Exporting(ExportingPhase),
    DisableExporter(String),
    EnableExporter {
        exporter_id: String,
        initialization: ExporterInitialization,
    },
}

impl ConfigChange {
    /// Apply to `config`, returning whether anything changed
    pub fn apply_to(&self, config: &mut DynamicPartitionConfig) -> Result<bool> {
        Ok(match self {
            ConfigChange::ProcessingPaused(paused) => config.set_processing_paused(*paused),
            ConfigChange::Exporting(phase) => config.set_exporting(*phase),
            ConfigChange::DisableExporter(exporter_id) => config.disable_exporter(exporter_id),
            ConfigChange::EnableExporter {
                exporter_id,
                initialization,
            } => config.enable_exporter(exporter_id, initialization)?,
        })
    }

    /// Bring the services published in `state` in line with this change
    ///
    /// `state` must already hold the committed configuration. Returns `None`
    /// when no affected service is installed.
    pub(crate) fn apply_live(
        self,
        state: &PartitionRuntimeState,
    ) -> Option<BoxFuture<'static, Result<()>>> {
        match self {
            ConfigChange::ProcessingPaused(_) => {
                let processor = state.stream_processor.clone()?;
                // without disk space the processor stays paused regardless
                let run = state.processing_enabled();
                Some(async move { apply_processing(processor.as_ref(), run).await }.boxed())
            }
            ConfigChange::Exporting(phase) => {
                let pipeline = state.exporter_pipeline.clone()?;
                Some(async move { apply_exporting(pipeline.as_ref(), phase).await }.boxed())
            }
            ConfigChange::DisableExporter(exporter_id) => {
                let pipeline = state.exporter_pipeline.clone()?;
                Some(async move { pipeline.disable_exporter(&exporter_id).await }.boxed())
            }
            ConfigChange::EnableExporter {
                exporter_id,
                initialization,
            } => {
                let pipeline = state.exporter_pipeline.clone()?;
                Some(
                    async move {
                        pipeline
                            .enable_exporter(&exporter_id, &initialization)
                            .await
                    }
                    .boxed(),
                )
            }
        }
    }
}

/// A change applied to a copy of the committed configuration, not yet persisted
#[derive(Debug, Clone)]
pub struct PreparedChange {
    pub change: ConfigChange,
    pub config: DynamicPartitionConfig,
    /// Whether the change altered the configuration; unchanged configs are
    /// only persisted to catch the store up
    pub changed: bool,
}

/// Persists dynamic configuration of one partition
pub struct ConfigurationManager {
    partition_id: PartitionId,
    store: Arc<dyn ConfigStore>,
    /// Highest version this manager saw acknowledged by the store
    persisted_version: u64,
}

impl ConfigurationManager {
    pub fn new(partition_id: PartitionId, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            partition_id,
            store,
            persisted_version: 0,
        }
    }

    /// Load the persisted configuration, or an empty one
    pub async fn load(&self) -> Result<DynamicPartitionConfig> {
        Ok(self
            .store
            .load(self.partition_id)
            .await?
            .unwrap_or_default())
    }

    pub fn persisted_version(&self) -> u64 {
        self.persisted_version
    }

    /// Apply `change` to a copy of `committed`
    ///
    /// Returns `None` when nothing changed and the store is up to date.
    pub fn prepare(
        &self,
        committed: &DynamicPartitionConfig,
        change: ConfigChange,
    ) -> Result<Option<PreparedChange>> {
        info!(partition = %self.partition_id, change = ?change, "Updating dynamic config");
        let mut config = committed.clone();
        let changed = change.apply_to(&mut config)?;

        if !changed && config.version <= self.persisted_version {
            debug!(partition = %self.partition_id, "Dynamic config unchanged");
            return Ok(None);
        }
        Ok(Some(PreparedChange {
            change,
            config,
            changed,
        }))
    }

    /// Persist a prepared configuration
    pub fn persist(&self, config: &DynamicPartitionConfig) -> BoxFuture<'static, Result<()>> {
        let store = self.store.clone();
        let partition = self.partition_id;
        let snapshot = config.clone();
        async move { store.store(partition, &snapshot).await }.boxed()
    }

    /// Record that the store acknowledged `version`
    pub fn mark_persisted(&mut self, version: u64) {
        self.persisted_version = self.persisted_version.max(version);
    }
}

/// Runs the live applies of one partition strictly one after another
#[derive(Debug, Clone)]
pub(crate) struct LiveApplier {
    partition_id: PartitionId,
    jobs: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl LiveApplier {
    /// Spawn the worker; it stops once every applier is dropped
    pub(crate) fn spawn(partition_id: PartitionId) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(partition = %partition_id, "Live applier stopped");
        });
        Self { partition_id, jobs }
    }

    /// Queue `apply`, logging its failure
    pub(crate) fn submit(&self, what: &'static str, apply: BoxFuture<'static, Result<()>>) {
        let partition = self.partition_id;
        self.push(
            async move {
                if let Err(e) = apply.await {
                    warn!(partition = %partition, error = %e, "Failed to {what}");
                }
            }
            .boxed(),
        );
    }

    /// Queue `apply` and answer `reply` with its result once it ran
    pub(crate) fn submit_with_reply(
        &self,
        apply: Option<BoxFuture<'static, Result<()>>>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        self.push(
            async move {
                let result = match apply {
                    Some(apply) => apply.await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            .boxed(),
        );
    }

    /// Answer `reply` once everything queued before it ran
    pub(crate) fn reply(&self, reply: oneshot::Sender<Result<()>>, result: Result<()>) {
        self.push(
            async move {
                let _ = reply.send(result);
            }
            .boxed(),
        );
    }

    fn push(&self, job: BoxFuture<'static, ()>) {
        if self.jobs.send(job).is_err() {
            debug!(partition = %self.partition_id, "Live applier stopped, dropping apply");
        }
    }
}

pub(crate) async fn apply_processing(processor: &dyn StreamProcessor, run: bool) -> Result<()> {
    if run {
        processor.resume().await
    } else {
        processor.pause().await
    }
}

pub(crate) async fn apply_exporting(
    pipeline: &dyn ExporterPipeline,
    phase: ExportingPhase,
) -> Result<()> {
    match phase {
        ExportingPhase::Exporting => pipeline.resume().await,
        ExportingPhase::Paused => pipeline.pause().await,
        ExportingPhase::SoftPaused => pipeline.soft_pause().await,
    }
}

/// Bring a pipeline opened with `opened_with` up to `current`
pub(crate) async fn reconcile_pipeline(
    pipeline: Arc<dyn ExporterPipeline>,
    opened_with: DynamicPartitionConfig,
    current: DynamicPartitionConfig,
) -> Result<()> {
    if opened_with.exporting != current.exporting {
        apply_exporting(pipeline.as_ref(), current.exporting).await?;
    }
    for (exporter_id, state) in &current.exporters {
        if opened_with.is_exporter_enabled(exporter_id) == state.enabled {
            continue;
        }
        if state.enabled {
            let initialization = ExporterInitialization {
                metadata_version: state.metadata_version,
                initialize_from: state.initialized_from.clone(),
            };
            pipeline
                .enable_exporter(exporter_id, &initialization)
                .await?;
        } else {
            pipeline.disable_exporter(exporter_id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamic_config::InMemoryConfigStore;
    use crate::error::PartitionError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingPipeline {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingPipeline {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: impl Into<String>) -> Result<()> {
            self.calls.lock().unwrap().push(call.into());
            Ok(())
        }
    }

    #[async_trait]
    impl ExporterPipeline for RecordingPipeline {
        async fn pause(&self) -> Result<()> {
            // slower than resume, so unordered applies would finish reversed
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.record("pause")
        }

        async fn soft_pause(&self) -> Result<()> {
            self.record("soft_pause")
        }

        async fn resume(&self) -> Result<()> {
            self.record("resume")
        }

        async fn disable_exporter(&self, exporter_id: &str) -> Result<()> {
            self.record(format!("disable {exporter_id}"))
        }

        async fn enable_exporter(
            &self,
            exporter_id: &str,
            _: &ExporterInitialization,
        ) -> Result<()> {
            self.record(format!("enable {exporter_id}"))
        }

        async fn close(&self) -> Result<()> {
            self.record("close")
        }
    }

    fn manager() -> (ConfigurationManager, Arc<InMemoryConfigStore>) {
        let store = Arc::new(InMemoryConfigStore::new());
        (
            ConfigurationManager::new(PartitionId::new(1), store.clone()),
            store,
        )
    }

    fn state_with(pipeline: Arc<RecordingPipeline>) -> PartitionRuntimeState {
        let mut state =
            PartitionRuntimeState::new(PartitionId::new(1), "node-1", DynamicPartitionConfig::new());
        state.exporter_pipeline = Some(pipeline);
        state
    }

    #[tokio::test]
    async fn test_prepare_leaves_committed_config_untouched() {
        let (mut manager, store) = manager();
        let committed = DynamicPartitionConfig::new();

        let prepared = manager
            .prepare(&committed, ConfigChange::DisableExporter("elastic".into()))
            .unwrap()
            .unwrap();
        assert!(prepared.changed);
        assert!(committed.is_exporter_enabled("elastic"));
        assert!(!prepared.config.is_exporter_enabled("elastic"));
        assert!(store.get(PartitionId::new(1)).is_none());

        manager.persist(&prepared.config).await.unwrap();
        manager.mark_persisted(prepared.config.version);
        assert_eq!(store.get(PartitionId::new(1)).unwrap(), prepared.config);
        assert_eq!(manager.persisted_version(), prepared.config.version);

        // the same change again has nothing to do
        assert!(manager
            .prepare(&prepared.config, ConfigChange::DisableExporter("elastic".into()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unchanged_config_is_persisted_while_store_lags() {
        let (mut manager, _) = manager();
        let mut committed = DynamicPartitionConfig::new();
        committed.register_exporter("elastic");

        let prepared = manager
            .prepare(&committed, ConfigChange::Exporting(ExportingPhase::Exporting))
            .unwrap()
            .unwrap();
        assert!(!prepared.changed);
        assert_eq!(prepared.config, committed);

        manager.mark_persisted(committed.version);
        assert!(manager
            .prepare(&committed, ConfigChange::Exporting(ExportingPhase::Exporting))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_invalid_enable_is_rejected() {
        let (manager, _) = manager();
        let mut committed = DynamicPartitionConfig::new();
        committed.disable_exporter("elastic");

        let err = manager
            .prepare(
                &committed,
                ConfigChange::EnableExporter {
                    exporter_id: "elastic".into(),
                    initialization: ExporterInitialization {
                        metadata_version: 2,
                        initialize_from: Some("missing".into()),
                    },
                },
            )
            .unwrap_err();
        assert!(matches!(err, PartitionError::ExporterNotFound(_)));
        assert!(!committed.is_exporter_enabled("elastic"));
    }

    #[tokio::test]
    async fn test_apply_live_targets_installed_pipeline() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let state = state_with(pipeline.clone());

        ConfigChange::Exporting(ExportingPhase::SoftPaused)
            .apply_live(&state)
            .unwrap()
            .await
            .unwrap();
        ConfigChange::DisableExporter("elastic".into())
            .apply_live(&state)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(pipeline.calls(), vec!["soft_pause", "disable elastic"]);

        // no processor installed
        assert!(ConfigChange::ProcessingPaused(true).apply_live(&state).is_none());
    }

    #[tokio::test]
    async fn test_live_applier_keeps_submission_order() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let state = state_with(pipeline.clone());
        let applier = LiveApplier::spawn(PartitionId::new(1));

        let (paused_tx, paused_rx) = oneshot::channel();
        let (resumed_tx, resumed_rx) = oneshot::channel();
        applier.submit_with_reply(
            ConfigChange::Exporting(ExportingPhase::Paused).apply_live(&state),
            paused_tx,
        );
        applier.submit_with_reply(
            ConfigChange::Exporting(ExportingPhase::Exporting).apply_live(&state),
            resumed_tx,
        );

        resumed_rx.await.unwrap().unwrap();
        paused_rx.await.unwrap().unwrap();
        assert_eq!(pipeline.calls(), vec!["pause", "resume"]);
    }

    #[tokio::test]
    async fn test_reconcile_pipeline_applies_differences_only() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let mut opened_with = DynamicPartitionConfig::new();
        opened_with.register_exporter("elastic");
        opened_with.register_exporter("kafka");

        let mut current = opened_with.clone();
        current.set_exporting(ExportingPhase::SoftPaused);
        current.disable_exporter("kafka");

        reconcile_pipeline(pipeline.clone(), opened_with, current)
            .await
            .unwrap();
        assert_eq!(pipeline.calls(), vec!["soft_pause", "disable kafka"]);
    }

    #[tokio::test]
    async fn test_load_defaults_when_nothing_stored() {
        let (manager, _) = manager();
        assert_eq!(manager.load().await.unwrap(), DynamicPartitionConfig::default());
    }
}
