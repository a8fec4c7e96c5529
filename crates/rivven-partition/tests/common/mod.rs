//! In-memory collaborators for partition integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use rivven_partition::{
    AdminAccess, BannedInstanceIndex, Component, ConfigStore, ConsensusHandle,
    DynamicPartitionConfig, ExporterInitialization, ExporterPipeline, ExportingPhase,
    FailureListener, FailureNotifier, HealthReport, HealthReporter, HealthStatus,
    InMemoryConfigStore, InstallContext, InstanceKey, LogRecord,
    LogWriter, PartitionActor, PartitionConfig, PartitionDependencies, PartitionError,
    PartitionHandle, PartitionId, PartitionRole, PartitionStorage, Position, Result, RoleEvent,
    RoleObserver, ServiceFactory, SnapshotId, SnapshotScheduler, StreamProcessor, Term,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rivven_partition=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or the timeout expires
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Wait until the partition reports `status`
pub async fn wait_for_health(handle: &PartitionHandle, status: HealthStatus) -> Arc<HealthReport> {
    let mut subscription = handle.subscribe_health();
    let result =
        tokio::time::timeout(TIMEOUT, subscription.wait_for(|report| report.status == status)).await;
    match result {
        Ok(Ok(report)) => report,
        _ => panic!(
            "timed out waiting for {status}, last report: {:?}",
            handle.health_report()
        ),
    }
}

/// Ordered record of service lifecycle events
#[derive(Debug, Default, Clone)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Holds a factory call until opened
#[derive(Clone)]
pub struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    pub fn closed() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn open(&self) {
        self.0.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

fn label(role: PartitionRole, term: Term) -> String {
    format!("{role}@{term}")
}

// ==================== Services ====================

pub struct FakeStorage {
    pub label: String,
    journal: Journal,
    banned: Mutex<HashSet<InstanceKey>>,
    pub records: Arc<Mutex<Vec<LogRecord>>>,
    fail_writes: Arc<AtomicBool>,
    pub closed: AtomicBool,
}

impl FakeStorage {
    pub fn banned(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<_> = self.banned.lock().unwrap().iter().copied().collect();
        keys.sort();
        keys
    }
}

impl BannedInstanceIndex for FakeStorage {
    fn ban(&self, instance_key: InstanceKey) -> Result<()> {
        self.banned.lock().unwrap().insert(instance_key);
        Ok(())
    }

    fn is_banned(&self, instance_key: InstanceKey) -> bool {
        self.banned.lock().unwrap().contains(&instance_key)
    }
}

struct FakeLogWriter {
    records: Arc<Mutex<Vec<LogRecord>>>,
    fail: bool,
}

#[async_trait]
impl LogWriter for FakeLogWriter {
    async fn append(&mut self, record: LogRecord) -> Result<Position> {
        if self.fail {
            return Err(PartitionError::LogWrite("log is full".into()));
        }
        let mut records = self.records.lock().unwrap();
        records.push(record);
        Ok(records.len() as Position)
    }
}

#[async_trait]
impl PartitionStorage for FakeStorage {
    async fn new_log_writer(&self) -> Result<Box<dyn LogWriter>> {
        Ok(Box::new(FakeLogWriter {
            records: self.records.clone(),
            fail: self.fail_writes.load(Ordering::SeqCst),
        }))
    }

    fn banned_instances(&self) -> &dyn BannedInstanceIndex {
        self
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.journal.record(format!("close storage {}", self.label));
        Ok(())
    }
}

pub struct FakeProcessor {
    pub label: String,
    journal: Journal,
    pub paused: AtomicBool,
    pub closed: AtomicBool,
}

impl FakeProcessor {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamProcessor for FakeProcessor {
    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.journal
            .record(format!("close stream processor {}", self.label));
        Ok(())
    }
}

pub struct FakePipeline {
    pub label: String,
    journal: Journal,
    phase: Mutex<ExportingPhase>,
    exporters: Mutex<BTreeMap<String, bool>>,
    toggles: AtomicUsize,
    pub closed: AtomicBool,
}

impl FakePipeline {
    /// Number of enable and disable calls
    pub fn toggles(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ExportingPhase {
        *self.phase.lock().unwrap()
    }

    /// Exporters are enabled unless told otherwise
    pub fn is_exporter_enabled(&self, exporter_id: &str) -> bool {
        self.exporters
            .lock()
            .unwrap()
            .get(exporter_id)
            .copied()
            .unwrap_or(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExporterPipeline for FakePipeline {
    async fn pause(&self) -> Result<()> {
        *self.phase.lock().unwrap() = ExportingPhase::Paused;
        Ok(())
    }

    async fn soft_pause(&self) -> Result<()> {
        *self.phase.lock().unwrap() = ExportingPhase::SoftPaused;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        *self.phase.lock().unwrap() = ExportingPhase::Exporting;
        Ok(())
    }

    async fn disable_exporter(&self, exporter_id: &str) -> Result<()> {
        self.toggles.fetch_add(1, Ordering::SeqCst);
        self.exporters
            .lock()
            .unwrap()
            .insert(exporter_id.to_string(), false);
        Ok(())
    }

    async fn enable_exporter(
        &self,
        exporter_id: &str,
        _initialization: &ExporterInitialization,
    ) -> Result<()> {
        self.toggles.fetch_add(1, Ordering::SeqCst);
        self.exporters
            .lock()
            .unwrap()
            .insert(exporter_id.to_string(), true);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.journal
            .record(format!("close exporter pipeline {}", self.label));
        Ok(())
    }
}

pub struct FakeScheduler {
    pub label: String,
    term: Term,
    journal: Journal,
    snapshots: AtomicU64,
    pub closed: AtomicBool,
}

#[async_trait]
impl SnapshotScheduler for FakeScheduler {
    async fn force_snapshot(&self) -> Result<SnapshotId> {
        let position = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SnapshotId {
            term: self.term,
            position: position * 100,
            taken_at_ms: 0,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.journal
            .record(format!("close snapshot scheduler {}", self.label));
        Ok(())
    }
}

// ==================== Factory ====================

/// Service factory recording every service it opens
#[derive(Default)]
pub struct FakeFactory {
    pub journal: Journal,
    gates: Mutex<HashMap<Component, Gate>>,
    failures: Mutex<HashMap<Component, PartitionError>>,
    panics: Mutex<HashSet<Component>>,
    pub fail_log_writes: Arc<AtomicBool>,
    notifiers: Mutex<Vec<FailureNotifier>>,
    pub storages: Mutex<Vec<Arc<FakeStorage>>>,
    pub processors: Mutex<Vec<Arc<FakeProcessor>>>,
    pub pipelines: Mutex<Vec<Arc<FakePipeline>>>,
    pub schedulers: Mutex<Vec<Arc<FakeScheduler>>>,
    /// Context of every opened stream processor
    pub processor_contexts: Mutex<Vec<InstallContext>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold opening `component` until the returned gate is opened
    pub fn block(&self, component: Component) -> Gate {
        let gate = Gate::closed();
        self.gates.lock().unwrap().insert(component, gate.clone());
        gate
    }

    pub fn fail(&self, component: Component, error: PartitionError) {
        self.failures.lock().unwrap().insert(component, error);
    }

    pub fn clear_failure(&self, component: Component) {
        self.failures.lock().unwrap().remove(&component);
    }

    pub fn panic_on(&self, component: Component) {
        self.panics.lock().unwrap().insert(component);
    }

    pub fn open_count(&self, component: Component) -> usize {
        self.journal.count(&format!("open {component} "))
    }

    pub fn last_notifier(&self) -> Option<FailureNotifier> {
        self.notifiers.lock().unwrap().last().cloned()
    }

    pub fn notifiers(&self) -> Vec<FailureNotifier> {
        self.notifiers.lock().unwrap().clone()
    }

    pub fn last_storage(&self) -> Option<Arc<FakeStorage>> {
        self.storages.lock().unwrap().last().cloned()
    }

    pub fn last_processor(&self) -> Option<Arc<FakeProcessor>> {
        self.processors.lock().unwrap().last().cloned()
    }

    pub fn last_pipeline(&self) -> Option<Arc<FakePipeline>> {
        self.pipelines.lock().unwrap().last().cloned()
    }

    pub fn last_scheduler(&self) -> Option<Arc<FakeScheduler>> {
        self.schedulers.lock().unwrap().last().cloned()
    }

    async fn before_open(&self, component: Component, ctx: &InstallContext) -> Result<String> {
        let gate = self.gates.lock().unwrap().get(&component).cloned();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        if self.panics.lock().unwrap().contains(&component) {
            panic!("{component} exploded");
        }
        if let Some(error) = self.failures.lock().unwrap().get(&component).cloned() {
            return Err(error);
        }

        let label = label(ctx.role, ctx.term);
        self.journal.record(format!("open {component} {label}"));
        self.notifiers.lock().unwrap().push(ctx.failures.clone());
        Ok(label)
    }
}

#[async_trait]
impl ServiceFactory for FakeFactory {
    async fn open_storage(&self, ctx: &InstallContext) -> Result<Arc<dyn PartitionStorage>> {
        let label = self.before_open(Component::Storage, ctx).await?;
        let storage = Arc::new(FakeStorage {
            label,
            journal: self.journal.clone(),
            banned: Mutex::new(HashSet::new()),
            records: Arc::new(Mutex::new(Vec::new())),
            fail_writes: self.fail_log_writes.clone(),
            closed: AtomicBool::new(false),
        });
        self.storages.lock().unwrap().push(storage.clone());
        Ok(storage)
    }

    async fn open_stream_processor(
        &self,
        ctx: &InstallContext,
        _storage: Arc<dyn PartitionStorage>,
    ) -> Result<Arc<dyn StreamProcessor>> {
        let label = self.before_open(Component::StreamProcessor, ctx).await?;
        let processor = Arc::new(FakeProcessor {
            label,
            journal: self.journal.clone(),
            paused: AtomicBool::new(ctx.processing_paused()),
            closed: AtomicBool::new(false),
        });
        self.processors.lock().unwrap().push(processor.clone());
        self.processor_contexts.lock().unwrap().push(ctx.clone());
        Ok(processor)
    }

    async fn open_exporter_pipeline(
        &self,
        ctx: &InstallContext,
        _storage: Arc<dyn PartitionStorage>,
    ) -> Result<Arc<dyn ExporterPipeline>> {
        let label = self.before_open(Component::ExporterPipeline, ctx).await?;
        let exporters = ctx
            .dynamic_config
            .exporters
            .iter()
            .map(|(id, state)| (id.clone(), state.enabled))
            .collect();
        let pipeline = Arc::new(FakePipeline {
            label,
            journal: self.journal.clone(),
            phase: Mutex::new(ctx.dynamic_config.exporting),
            exporters: Mutex::new(exporters),
            toggles: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.pipelines.lock().unwrap().push(pipeline.clone());
        Ok(pipeline)
    }

    async fn open_snapshot_scheduler(
        &self,
        ctx: &InstallContext,
        _storage: Arc<dyn PartitionStorage>,
    ) -> Result<Arc<dyn SnapshotScheduler>> {
        let label = self.before_open(Component::SnapshotScheduler, ctx).await?;
        let scheduler = Arc::new(FakeScheduler {
            label,
            term: ctx.term,
            journal: self.journal.clone(),
            snapshots: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.schedulers.lock().unwrap().push(scheduler.clone());
        Ok(scheduler)
    }
}

// ==================== Config store ====================

/// In-memory config store with injectable latency and failures
#[derive(Default)]
pub struct ScriptedStore {
    inner: InMemoryConfigStore,
    slow: Mutex<Option<(u64, Duration)>>,
    failures: AtomicUsize,
}

impl ScriptedStore {
    pub fn get(&self, partition: PartitionId) -> Option<DynamicPartitionConfig> {
        self.inner.get(partition)
    }

    /// Delay writes of `version`
    pub fn delay_version(&self, version: u64, delay: Duration) {
        *self.slow.lock().unwrap() = Some((version, delay));
    }

    /// Fail the next `count` writes
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigStore for ScriptedStore {
    async fn load(&self, partition: PartitionId) -> Result<Option<DynamicPartitionConfig>> {
        self.inner.load(partition).await
    }

    async fn store(&self, partition: PartitionId, config: &DynamicPartitionConfig) -> Result<()> {
        let delay = match *self.slow.lock().unwrap() {
            Some((version, delay)) if version == config.version => Some(delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PartitionError::ConfigStore("disk full".into()));
        }
        self.inner.store(partition, config).await
    }
}

// ==================== Consensus and listeners ====================

#[derive(Default)]
pub struct FakeConsensus {
    pub step_downs: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeConsensus {
    pub fn step_downs(&self) -> usize {
        self.step_downs.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsensusHandle for FakeConsensus {
    async fn step_down(&self) -> Result<()> {
        self.step_downs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RoleEvent>>,
    fail_becoming_leader: AtomicBool,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<RoleEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&RoleEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }

    pub fn fail_becoming_leader(&self, fail: bool) {
        self.fail_becoming_leader.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoleObserver for RecordingObserver {
    async fn on_role_event(&self, event: RoleEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        if matches!(event, RoleEvent::BecameLeader { .. })
            && self.fail_becoming_leader.load(Ordering::SeqCst)
        {
            return Err(PartitionError::ListenerFailed("command api".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFailureListener {
    statuses: Mutex<Vec<HealthStatus>>,
}

impl RecordingFailureListener {
    pub fn statuses(&self) -> Vec<HealthStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl FailureListener for RecordingFailureListener {
    fn on_failure(&self, report: &HealthReport) {
        self.statuses.lock().unwrap().push(report.status);
    }

    fn on_recovered(&self, report: &HealthReport) {
        self.statuses.lock().unwrap().push(report.status);
    }

    fn on_unrecoverable_failure(&self, report: &HealthReport) {
        self.statuses.lock().unwrap().push(report.status);
    }
}

// ==================== Harness ====================

/// A single partition wired to fakes
pub struct TestPartition {
    pub handle: PartitionHandle,
    pub factory: Arc<FakeFactory>,
    pub consensus: Arc<FakeConsensus>,
    pub store: Arc<ScriptedStore>,
    pub observer: Arc<RecordingObserver>,
    pub failures: Arc<RecordingFailureListener>,
}

impl TestPartition {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: PartitionConfig) -> Self {
        init_tracing();
        let factory = FakeFactory::new();
        let consensus = Arc::new(FakeConsensus::default());
        let store = Arc::new(ScriptedStore::default());
        let observer = Arc::new(RecordingObserver::default());
        let failures = Arc::new(RecordingFailureListener::default());

        let mut dynamic_config = DynamicPartitionConfig::new();
        for exporter_id in &config.exporters {
            dynamic_config.register_exporter(exporter_id);
        }

        let handle = PartitionActor::spawn(
            &config,
            PartitionId::new(1),
            dynamic_config,
            PartitionDependencies {
                factory: factory.clone(),
                consensus: consensus.clone(),
                config_store: store.clone(),
                observers: vec![observer.clone()],
            },
        );
        handle
            .add_failure_listener(failures.clone())
            .await
            .expect("partition is running");

        Self {
            handle,
            factory,
            consensus,
            store,
            observer,
            failures,
        }
    }

    pub fn admin(&self) -> AdminAccess {
        self.handle.admin()
    }
}

pub fn test_config() -> PartitionConfig {
    PartitionConfig::builder()
        .node_id("node-1")
        .health_check_interval(Duration::from_millis(10))
        .exporter("elastic")
        .exporter("opensearch")
        .build()
}
