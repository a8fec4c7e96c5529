//! Persisted, runtime-tunable partition configuration
//!
//! The dynamic configuration survives role transitions: admin operations
//! persist a changed copy through a [`ConfigStore`] before the partition
//! commits it, and the transition engine reads the committed configuration
//! whenever it installs a stream processor or exporter pipeline.
//!
//! Every mutation bumps [`DynamicPartitionConfig::version`]. Stores only accept
//! writes that are newer than what they hold, so a write that repeats a
//! version already on disk is a no-op.

use crate::error::{PartitionError, Result};
use crate::role::PartitionId;
use crate::services::ExporterInitialization;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Exporting state of the exporter pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportingPhase {
    #[default]
    Exporting,
    /// Exporting stopped entirely
    Paused,
    /// Exporting continues but exported positions are not acknowledged
    SoftPaused,
}

/// Runtime state of a single exporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterState {
    pub enabled: bool,
    pub metadata_version: u64,
    /// Exporter this one was initialized from when last enabled
    pub initialized_from: Option<String>,
}

impl Default for ExporterState {
    fn default() -> Self {
        Self {
            enabled: true,
            metadata_version: 0,
            initialized_from: None,
        }
    }
}

/// Versioned dynamic configuration of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DynamicPartitionConfig {
    /// Incremented on every change
    pub version: u64,
    /// Processing paused by an administrator
    pub processing_paused: bool,
    pub exporting: ExportingPhase,
    /// Exporters with non-default state, keyed by exporter id
    pub exporters: BTreeMap<String, ExporterState>,
}

impl DynamicPartitionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exporters without recorded state are enabled
    pub fn is_exporter_enabled(&self, exporter_id: &str) -> bool {
        self.exporters
            .get(exporter_id)
            .map(|state| state.enabled)
            .unwrap_or(true)
    }

    /// Set the processing flag, returning whether anything changed
    pub fn set_processing_paused(&mut self, paused: bool) -> bool {
        if self.processing_paused == paused {
            return false;
        }
        self.processing_paused = paused;
        self.version += 1;
        true
    }

    /// Set the exporting phase, returning whether anything changed
    pub fn set_exporting(&mut self, phase: ExportingPhase) -> bool {
        if self.exporting == phase {
            return false;
        }
        self.exporting = phase;
        self.version += 1;
        true
    }

    /// Mark an exporter disabled, returning whether anything changed
    pub fn disable_exporter(&mut self, exporter_id: &str) -> bool {
        let state = self.exporters.entry(exporter_id.to_string()).or_default();
        if !state.enabled {
            return false;
        }
        state.enabled = false;
        self.version += 1;
        true
    }

    /// Mark an exporter enabled, returning whether anything changed
    ///
    /// Fails if `initialize_from` names an exporter that is unknown or disabled.
    pub fn enable_exporter(
        &mut self,
        exporter_id: &str,
        initialization: &ExporterInitialization,
    ) -> Result<bool> {
        if self.is_exporter_enabled(exporter_id) {
            return Ok(false);
        }
        if let Some(source) = &initialization.initialize_from {
            let known = self
                .exporters
                .get(source)
                .map(|state| state.enabled)
                .unwrap_or(false);
            if !known {
                return Err(PartitionError::ExporterNotFound(source.clone()));
            }
        }

        self.exporters.insert(
            exporter_id.to_string(),
            ExporterState {
                enabled: true,
                metadata_version: initialization.metadata_version,
                initialized_from: initialization.initialize_from.clone(),
            },
        );
        self.version += 1;
        Ok(true)
    }

    /// Register an exporter that is configured statically on this node
    pub fn register_exporter(&mut self, exporter_id: &str) {
        if !self.exporters.contains_key(exporter_id) {
            self.exporters
                .insert(exporter_id.to_string(), ExporterState::default());
            self.version += 1;
        }
    }
}

/// Persists dynamic configuration per partition
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, partition: PartitionId) -> Result<Option<DynamicPartitionConfig>>;

    /// Persist `config` atomically unless a newer or equal version is stored
    async fn store(&self, partition: PartitionId, config: &DynamicPartitionConfig) -> Result<()>;
}

/// Config store that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    configs: DashMap<PartitionId, DynamicPartitionConfig>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently stored configuration (for inspection)
    pub fn get(&self, partition: PartitionId) -> Option<DynamicPartitionConfig> {
        self.configs.get(&partition).map(|c| c.clone())
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load(&self, partition: PartitionId) -> Result<Option<DynamicPartitionConfig>> {
        Ok(self.get(partition))
    }

    async fn store(&self, partition: PartitionId, config: &DynamicPartitionConfig) -> Result<()> {
        let mut entry = self
            .configs
            .entry(partition)
            .or_insert_with(|| config.clone());
        if entry.version < config.version {
            *entry = config.clone();
        }
        Ok(())
    }
}

/// Config store writing one postcard-encoded file per partition
#[derive(Debug)]
pub struct FileConfigStore {
    dir: PathBuf,
    /// Serializes read-compare-write cycles
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("{partition}.cfg"))
    }

    async fn read(&self, path: &Path) -> Result<Option<DynamicPartitionConfig>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let config = postcard::from_bytes(&bytes).map_err(|e| {
                    PartitionError::ConfigStore(format!(
                        "failed to decode {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self, partition: PartitionId) -> Result<Option<DynamicPartitionConfig>> {
        self.read(&self.path_for(partition)).await
    }

    async fn store(&self, partition: PartitionId, config: &DynamicPartitionConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(partition);

        if let Some(current) = self.read(&path).await? {
            if current.version >= config.version {
                debug!(
                    partition = %partition,
                    stored = current.version,
                    version = config.version,
                    "Skipping stale dynamic config write"
                );
                return Ok(());
            }
        }

        let bytes = postcard::to_allocvec(config)?;
        let tmp = path.with_extension("cfg.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(partition = %partition, version = config.version, "Persisted dynamic config");
        Ok(())
    }
}
