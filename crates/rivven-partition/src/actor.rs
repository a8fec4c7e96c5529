//! Partition actor
//!
//! One tokio task per partition owns the [`PartitionRuntimeState`], the
//! [`TransitionEngine`] and the [`HealthAggregator`]. Everything that touches
//! them is a [`Command`] on the partition's mailbox and is handled to
//! completion before the next command; handlers never await. Work that has
//! to wait (opening services, persisting configuration, notifying observers,
//! writing to the log) is spawned and posts its continuation back to the
//! mailbox. Changes to installed services run on the partition's
//! [`LiveApplier`] in the order the mailbox decided them.
//!
//! ```text
//! consensus ──► on_role_changed ─┐
//! admin ─────► AdminAccess ──────┤
//! services ──► FailureNotifier ──┼──► mailbox ──► PartitionActor
//! spawned steps ─► StepCompleted ┘                    │
//!                          HealthSubscription ◄───────┘
//! ```

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::admin::{AdminAccess, AdminCommand};
use crate::config::PartitionConfig;
use crate::config_manager::{
    apply_processing, reconcile_pipeline, ConfigChange, ConfigurationManager, LiveApplier,
    PreparedChange,
};
use crate::dynamic_config::{ConfigStore, DynamicPartitionConfig};
use crate::error::{PartitionError, Result};
use crate::health::{
    FailureListener, HealthAggregator, HealthIssue, HealthReport, HealthReporter,
    HealthSubscription, ListenerId,
};
use crate::listener::{notify_observers, RoleEvent, RoleObserver};
use crate::role::{InstanceKey, PartitionId, PartitionRole, RaftRole, Term};
use crate::services::{
    Component, ConsensusHandle, InstallContext, LogRecord, PartitionStorage, Position,
    ServiceFactory,
};
use crate::state::{InstalledService, PartitionRuntimeState, PartitionStatus};
use crate::transition::{StepResult, TransitionEngine, TransitionEvent};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages processed by the partition mailbox
pub(crate) enum Command {
    RoleChanged {
        role: RaftRole,
        term: Term,
        reply: Option<Reply<()>>,
    },
    DiskSpace {
        available: bool,
    },
    StepCompleted(StepResult),
    ObserversNotified {
        transition: u64,
        result: Result<()>,
    },
    ServiceFailed {
        generation: u64,
        error: PartitionError,
    },
    ConfigPersisted {
        prepared: PreparedChange,
        result: Result<()>,
        reply: Reply<()>,
    },
    InstanceBanWritten {
        storage: Arc<dyn PartitionStorage>,
        instance_key: InstanceKey,
        position: Position,
        reply: Reply<()>,
    },
    Admin(AdminCommand),
    AddFailureListener {
        listener: Arc<dyn FailureListener>,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveFailureListener {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    AddRoleObserver {
        observer: Arc<dyn RoleObserver>,
    },
    Status {
        reply: oneshot::Sender<PartitionStatus>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Post a command back to the mailbox, returning it if the partition is gone
pub(crate) async fn post(
    mailbox: &mpsc::WeakSender<Command>,
    command: Command,
) -> std::result::Result<(), Command> {
    match mailbox.upgrade() {
        Some(sender) => sender.send(command).await.map_err(|e| e.0),
        None => Err(command),
    }
}

/// Lets an installed service report a failure after installation
#[derive(Clone)]
pub struct FailureNotifier {
    mailbox: mpsc::WeakSender<Command>,
    generation: u64,
}

impl FailureNotifier {
    pub(crate) fn new(mailbox: mpsc::WeakSender<Command>, generation: u64) -> Self {
        Self {
            mailbox,
            generation,
        }
    }

    /// Report a failure; ignored once the reporting service was replaced
    pub async fn report(&self, error: PartitionError) {
        let command = Command::ServiceFailed {
            generation: self.generation,
            error,
        };
        if post(&self.mailbox, command).await.is_err() {
            debug!(generation = self.generation, "Partition stopped before failure was reported");
        }
    }
}

impl fmt::Debug for FailureNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureNotifier")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Collaborators a partition is wired to
#[derive(Clone)]
pub struct PartitionDependencies {
    pub factory: Arc<dyn ServiceFactory>,
    pub consensus: Arc<dyn ConsensusHandle>,
    pub config_store: Arc<dyn ConfigStore>,
    pub observers: Vec<Arc<dyn RoleObserver>>,
}

/// Serialization point of one partition
pub struct PartitionActor {
    state: PartitionRuntimeState,
    engine: TransitionEngine,
    health: HealthAggregator,
    config_manager: ConfigurationManager,
    /// Config changes waiting for the one being persisted
    config_changes: VecDeque<(ConfigChange, Reply<()>)>,
    persisting: bool,
    applier: LiveApplier,
    consensus: Arc<dyn ConsensusHandle>,
    observers: Vec<Arc<dyn RoleObserver>>,
    mailbox: mpsc::Receiver<Command>,
    self_sender: mpsc::WeakSender<Command>,
    health_check_interval: Duration,
    /// Highest term seen in a role notification
    highest_term: Term,
    closing: bool,
    close_waiters: Vec<Reply<()>>,
    stopped: bool,
}

impl PartitionActor {
    /// Spawn the actor of one partition on the current runtime
    pub fn spawn(
        config: &PartitionConfig,
        partition_id: PartitionId,
        dynamic_config: DynamicPartitionConfig,
        deps: PartitionDependencies,
    ) -> PartitionHandle {
        let (sender, mailbox) = mpsc::channel(config.mailbox_capacity);
        let self_sender = sender.downgrade();

        let health = HealthAggregator::new(partition_id.to_string());
        let subscription = health.subscribe();

        let actor = Self {
            state: PartitionRuntimeState::new(partition_id, config.node_id.clone(), dynamic_config),
            engine: TransitionEngine::new(deps.factory, self_sender.clone(), config),
            health,
            config_manager: ConfigurationManager::new(partition_id, deps.config_store),
            config_changes: VecDeque::new(),
            persisting: false,
            applier: LiveApplier::spawn(partition_id),
            consensus: deps.consensus,
            observers: deps.observers,
            mailbox,
            self_sender,
            health_check_interval: config.health_check_interval,
            highest_term: 0,
            closing: false,
            close_waiters: Vec::new(),
            stopped: false,
        };
        tokio::spawn(actor.run());

        PartitionHandle {
            partition_id,
            mailbox: sender,
            health: subscription,
        }
    }

    async fn run(mut self) {
        let partition = self.state.partition_id();
        info!(partition = %partition, node = %self.state.node_id(), "Partition actor started");

        let mut health_check = tokio::time::interval(self.health_check_interval);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.stopped {
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        warn!(partition = %partition, "All partition handles dropped, stopping");
                        break;
                    }
                },
                _ = health_check.tick() => {}
            }
            self.refresh_health();
        }

        // only reached with services still installed when the handles were dropped
        let mut leftovers = self.state.take_all();
        leftovers.extend(self.engine.take_unpublished());
        for service in leftovers {
            if let Err(e) = service.close().await {
                warn!(partition = %partition, component = %service.component(), error = %e, "Failed to close service");
            }
        }
        info!(partition = %partition, "Partition actor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RoleChanged { role, term, reply } => self.on_role_changed(role, term, reply),
            Command::DiskSpace { available } => self.on_disk_space(available),
            Command::StepCompleted(result) => self.on_step_completed(result),
            Command::ObserversNotified { transition, result } => {
                let event = self.engine.on_settled(&mut self.state, transition, result);
                self.drive(event);
            }
            Command::ServiceFailed { generation, error } => self.on_service_failed(generation, error),
            Command::ConfigPersisted {
                prepared,
                result,
                reply,
            } => self.on_config_persisted(prepared, result, reply),
            Command::InstanceBanWritten {
                storage,
                instance_key,
                position,
                reply,
            } => self.on_instance_ban_written(storage, instance_key, position, reply),
            Command::Admin(command) => self.on_admin(command),
            Command::AddFailureListener { listener, reply } => {
                let _ = reply.send(self.health.add_listener(listener));
            }
            Command::RemoveFailureListener { id, reply } => {
                let _ = reply.send(self.health.remove_listener(id));
            }
            Command::AddRoleObserver { observer } => self.observers.push(observer),
            Command::Status { reply } => {
                let status = PartitionStatus::capture(
                    &self.state,
                    !self.engine.is_idle(),
                    self.health.is_dead(),
                );
                let _ = reply.send(status);
            }
            Command::Close { reply } => self.on_close(reply),
        }
    }

    fn refresh_health(&mut self) {
        let inputs = self.state.health_inputs(self.engine.health_issue());
        self.health.update(&inputs);
    }

    // ==================== Role changes ====================

    fn on_role_changed(&mut self, raft_role: RaftRole, term: Term, reply: Option<Reply<()>>) {
        let partition = self.state.partition_id();
        let target = raft_role.partition_role();

        if self.closing || self.health.is_dead() {
            debug!(partition = %partition, role = %raft_role, term, "Ignoring role change, partition is closing or dead");
            if let Some(reply) = reply {
                let _ = reply.send(Err(if self.closing {
                    PartitionError::Closed
                } else {
                    PartitionError::unrecoverable(partition.to_string(), "partition is dead")
                }));
            }
            return;
        }

        if term < self.highest_term {
            debug!(partition = %partition, role = %raft_role, term, highest_term = self.highest_term, "Ignoring stale role change");
            if let Some(reply) = reply {
                let _ = reply.send(Err(PartitionError::TransitionCancelled { role: target, term }));
            }
            return;
        }
        self.highest_term = term;

        match self.engine.target() {
            Some(latest) if latest == (target, term) => {
                debug!(partition = %partition, role = %raft_role, term, "Role unchanged");
                if let Some(reply) = reply {
                    self.engine.attach_waiter(reply);
                }
                return;
            }
            Some((PartitionRole::Follower, _)) if target == PartitionRole::Follower => {
                debug!(partition = %partition, role = %raft_role, term, "Keeping follower services");
                self.engine.record_term(term);
                self.state.term = self.state.term.max(term);
                self.emit(RoleEvent::RaftRoleChanged {
                    partition,
                    role: raft_role,
                    term,
                });
                if let Some(reply) = reply {
                    self.engine.attach_waiter(reply);
                }
                return;
            }
            _ => {}
        }

        self.emit(RoleEvent::RaftRoleChanged {
            partition,
            role: raft_role,
            term,
        });
        let event = self.engine.request(&mut self.state, target, term, reply);
        self.drive(event);
    }

    fn on_step_completed(&mut self, result: StepResult) {
        let event = self.engine.on_step_completed(&mut self.state, result);
        self.drive(event);
    }

    fn drive(&mut self, mut event: Option<TransitionEvent>) {
        while let Some(current) = event.take() {
            event = match current {
                TransitionEvent::StepsCompleted {
                    transition,
                    role,
                    term,
                } => self.on_steps_completed(transition, role, term),
                TransitionEvent::Settled {
                    role,
                    term,
                    published,
                } => {
                    self.on_settled(role, term, published);
                    None
                }
                TransitionEvent::Failed { role, term, error } => {
                    self.route_failure(role, term, error)
                }
            };
        }
    }

    fn on_steps_completed(
        &mut self,
        transition: u64,
        role: PartitionRole,
        term: Term,
    ) -> Option<TransitionEvent> {
        let partition = self.state.partition_id();
        let event = match role {
            PartitionRole::Leader => RoleEvent::BecameLeader { partition, term },
            PartitionRole::Follower => RoleEvent::BecameFollower { partition, term },
            PartitionRole::Inactive | PartitionRole::Uninitialized => {
                self.emit(RoleEvent::BecameInactive { partition, term });
                return self.engine.on_settled(&mut self.state, transition, Ok(()));
            }
        };

        let observers = self.observers.clone();
        let mailbox = self.self_sender.clone();
        tokio::spawn(async move {
            let result = notify_observers(observers, event).await;
            let _ = post(&mailbox, Command::ObserversNotified { transition, result }).await;
        });
        None
    }

    fn on_settled(
        &mut self,
        role: PartitionRole,
        term: Term,
        published: Vec<(InstalledService, InstallContext)>,
    ) {
        if role.is_active() {
            self.state.failure = None;
        }
        for (service, ctx) in published {
            self.reconcile(service, &ctx);
        }
        debug!(partition = %self.state.partition_id(), role = %role, term, "Transition settled");

        if self.closing && self.engine.is_idle() && !role.is_active() {
            self.finish_close();
        }
    }

    fn emit(&self, event: RoleEvent) {
        if self.observers.is_empty() {
            return;
        }
        let observers = self.observers.clone();
        tokio::spawn(async move {
            let _ = notify_observers(observers, event).await;
        });
    }

    // ==================== Failures ====================

    fn route_failure(
        &mut self,
        role: PartitionRole,
        term: Term,
        error: PartitionError,
    ) -> Option<TransitionEvent> {
        let partition = self.state.partition_id();

        if error.is_cancelled() {
            debug!(partition = %partition, role = %role, term, "Transition superseded");
            return None;
        }
        if error.is_fatal() {
            return self.die(error);
        }

        match role {
            PartitionRole::Leader => {
                if term == self.state.term && !self.engine.has_queued() && !self.closing {
                    warn!(partition = %partition, term, error = %error, "Leader failed, stepping down");
                    let consensus = self.consensus.clone();
                    tokio::spawn(async move {
                        if let Err(e) = consensus.step_down().await {
                            warn!(partition = %partition, term, error = %e, "Failed to step down");
                        }
                    });
                }
                None
            }
            PartitionRole::Follower => {
                if self.closing {
                    return None;
                }
                warn!(partition = %partition, term, error = %error, "Follower failed, transitioning to inactive");
                self.engine
                    .request(&mut self.state, PartitionRole::Inactive, term, None)
            }
            // nothing left to step down from
            PartitionRole::Inactive | PartitionRole::Uninitialized => self.die(error),
        }
    }

    fn die(&mut self, error: PartitionError) -> Option<TransitionEvent> {
        if self.health.is_dead() {
            return None;
        }
        let partition = self.state.partition_id();
        error!(partition = %partition, term = self.state.term, error = %error, "Unrecoverable failure, partition is dead");

        self.health
            .mark_dead(HealthIssue::from_error("unrecoverable failure", &error));

        let consensus = self.consensus.clone();
        tokio::spawn(async move {
            if let Err(e) = consensus.stop().await {
                warn!(partition = %partition, error = %e, "Failed to stop raft partition");
            }
        });

        let term = self.state.term;
        self.engine
            .request(&mut self.state, PartitionRole::Inactive, term, None)
    }

    fn on_service_failed(&mut self, generation: u64, error: PartitionError) {
        let partition = self.state.partition_id();
        if generation != self.state.generation || self.closing || self.health.is_dead() {
            debug!(partition = %partition, generation, error = %error, "Ignoring failure of replaced service");
            return;
        }

        warn!(partition = %partition, role = %self.state.role, term = self.state.term, error = %error, "Service failed");
        self.state.failure = Some(HealthIssue::from_error("service failed", &error));
        let event = self.route_failure(self.state.role, self.state.term, error);
        self.drive(event);
    }

    // ==================== Services ====================

    /// Apply what changed between opening `service` and publishing it
    fn reconcile(&self, service: InstalledService, ctx: &InstallContext) {
        let partition = self.state.partition_id();
        match service {
            InstalledService::StreamProcessor(processor) => {
                let run = self.state.processing_enabled();
                if run == !ctx.processing_paused() {
                    return;
                }
                debug!(partition = %partition, run, "Reconciling stream processor");
                self.applier.submit(
                    "reconcile stream processor",
                    async move { apply_processing(processor.as_ref(), run).await }.boxed(),
                );
            }
            InstalledService::ExporterPipeline(pipeline) => {
                if ctx.dynamic_config.version == self.state.dynamic_config.version {
                    return;
                }
                debug!(partition = %partition, "Reconciling exporter pipeline");
                let opened_with = ctx.dynamic_config.clone();
                let current = self.state.dynamic_config.clone();
                self.applier.submit(
                    "reconcile exporter pipeline",
                    reconcile_pipeline(pipeline, opened_with, current).boxed(),
                );
            }
            InstalledService::Storage(_) | InstalledService::SnapshotScheduler(_) => {}
        }
    }

    fn on_disk_space(&mut self, available: bool) {
        let partition = self.state.partition_id();
        if self.state.disk_space_available == available {
            return;
        }
        self.state.disk_space_available = available;

        if available {
            info!(partition = %partition, "Disk space available again");
        } else {
            warn!(partition = %partition, "Disk space unavailable, pausing processing");
        }

        let Some(processor) = self.state.stream_processor.clone() else {
            return;
        };
        if available && self.state.dynamic_config.processing_paused {
            // paused by an administrator
            return;
        }
        self.applier.submit(
            "update stream processor",
            async move { apply_processing(processor.as_ref(), available).await }.boxed(),
        );
    }

    // ==================== Admin ====================

    fn on_admin(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::TakeSnapshot { reply } => match self.state.snapshot_scheduler.clone() {
                Some(scheduler) => {
                    tokio::spawn(async move {
                        let _ = reply.send(scheduler.force_snapshot().await);
                    });
                }
                None => {
                    let _ = reply.send(Err(PartitionError::ServiceNotInstalled(
                        Component::SnapshotScheduler,
                    )));
                }
            },
            AdminCommand::ChangeConfig { change, reply } => {
                self.config_changes.push_back((change, reply));
                self.next_config_change();
            }
            AdminCommand::BanInstance {
                instance_key,
                reply,
            } => self.ban_instance(instance_key, reply),
        }
    }

    /// Persist the next queued config change unless one is being persisted
    fn next_config_change(&mut self) {
        while !self.persisting {
            let Some((change, reply)) = self.config_changes.pop_front() else {
                return;
            };
            let prepared = match self
                .config_manager
                .prepare(&self.state.dynamic_config, change)
            {
                Ok(Some(prepared)) => prepared,
                Ok(None) => {
                    self.applier.reply(reply, Ok(()));
                    continue;
                }
                Err(e) => {
                    self.applier.reply(reply, Err(e));
                    continue;
                }
            };

            self.persisting = true;
            let persist = self.config_manager.persist(&prepared.config);
            let mailbox = self.self_sender.clone();
            tokio::spawn(async move {
                let result = persist.await;
                let command = Command::ConfigPersisted {
                    prepared,
                    result,
                    reply,
                };
                if let Err(Command::ConfigPersisted { result, reply, .. }) =
                    post(&mailbox, command).await
                {
                    // partition stopped; nothing left to apply to
                    let _ = reply.send(result);
                }
            });
        }
    }

    fn on_config_persisted(
        &mut self,
        prepared: PreparedChange,
        result: Result<()>,
        reply: Reply<()>,
    ) {
        self.persisting = false;
        let partition = self.state.partition_id();

        match result {
            Ok(()) => {
                let version = prepared.config.version;
                self.config_manager.mark_persisted(version);
                self.state.dynamic_config = prepared.config;
                debug!(partition = %partition, version, "Committed dynamic config");

                let apply = if prepared.changed {
                    prepared.change.apply_live(&self.state)
                } else {
                    None
                };
                self.applier.submit_with_reply(apply, reply);
            }
            Err(e) => {
                warn!(partition = %partition, version = prepared.config.version, error = %e, "Failed to persist dynamic config");
                self.applier.reply(reply, Err(e));
            }
        }
        self.next_config_change();
    }

    fn ban_instance(&mut self, instance_key: InstanceKey, reply: Reply<()>) {
        if self.state.role != PartitionRole::Leader {
            let _ = reply.send(Err(PartitionError::NotLeader {
                role: self.state.role,
            }));
            return;
        }
        let Some(storage) = self.state.storage.clone() else {
            let _ = reply.send(Err(PartitionError::ServiceNotInstalled(Component::Storage)));
            return;
        };

        let partition = self.state.partition_id();
        let mailbox = self.self_sender.clone();
        tokio::spawn(async move {
            let written: Result<Position> = async {
                let mut writer = storage.new_log_writer().await?;
                writer
                    .append(LogRecord::InstanceBanned { instance_key })
                    .await
            }
            .await;

            match written {
                Ok(position) => {
                    let command = Command::InstanceBanWritten {
                        storage,
                        instance_key,
                        position,
                        reply,
                    };
                    if let Err(Command::InstanceBanWritten { reply, .. }) = post(&mailbox, command).await {
                        // the record is durable and replayed on restart
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(e) => {
                    warn!(partition = %partition, instance_key, error = %e, "Failed to write instance ban");
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn on_instance_ban_written(
        &mut self,
        storage: Arc<dyn PartitionStorage>,
        instance_key: InstanceKey,
        position: Position,
        reply: Reply<()>,
    ) {
        let partition = self.state.partition_id();
        let still_installed = self
            .state
            .storage
            .as_ref()
            .is_some_and(|current| same_service(current, &storage));

        let result = if still_installed {
            storage.banned_instances().ban(instance_key)
        } else {
            debug!(partition = %partition, instance_key, "Storage replaced after ban was written");
            Ok(())
        };
        if result.is_ok() {
            info!(partition = %partition, instance_key, position, "Banned instance");
        }
        let _ = reply.send(result);
    }

    // ==================== Shutdown ====================

    fn on_close(&mut self, reply: Reply<()>) {
        self.close_waiters.push(reply);
        if self.closing {
            return;
        }
        self.closing = true;
        info!(partition = %self.state.partition_id(), "Closing partition");

        let nothing_installed =
            self.state.installed_components().is_empty() && !self.engine.has_unpublished();
        match self.engine.target() {
            // the inactive transition in flight finishes the close
            Some((PartitionRole::Inactive, _)) if !self.engine.is_idle() => {}
            _ if self.engine.is_idle() && !self.state.role.is_active() && nothing_installed => {
                self.finish_close();
            }
            _ => {
                let term = self.state.term;
                let event =
                    self.engine
                        .request(&mut self.state, PartitionRole::Inactive, term, None);
                self.drive(event);
            }
        }
    }

    fn finish_close(&mut self) {
        info!(partition = %self.state.partition_id(), "Partition closed");
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.stopped = true;
    }
}

fn same_service(a: &Arc<dyn PartitionStorage>, b: &Arc<dyn PartitionStorage>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Cloneable handle to a partition actor
#[derive(Clone)]
pub struct PartitionHandle {
    partition_id: PartitionId,
    mailbox: mpsc::Sender<Command>,
    health: HealthSubscription,
}

impl PartitionHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub(crate) async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.mailbox.send(make(reply)).await?;
        rx.await.map_err(|_| PartitionError::Closed)
    }

    /// Role notification from the consensus layer; does not wait for the transition
    pub async fn on_role_changed(&self, role: RaftRole, term: Term) -> Result<()> {
        self.mailbox
            .send(Command::RoleChanged {
                role,
                term,
                reply: None,
            })
            .await?;
        Ok(())
    }

    /// Change role and wait until the transition settles
    ///
    /// Fails with [`PartitionError::TransitionCancelled`] when a newer role
    /// change supersedes this one.
    pub async fn transition_to(&self, role: RaftRole, term: Term) -> Result<()> {
        self.call(|reply| Command::RoleChanged {
            role,
            term,
            reply: Some(reply),
        })
        .await?
    }

    pub async fn on_disk_space(&self, available: bool) -> Result<()> {
        self.mailbox.send(Command::DiskSpace { available }).await?;
        Ok(())
    }

    /// Follow the health report without going through the mailbox
    pub fn subscribe_health(&self) -> HealthSubscription {
        self.health.clone()
    }

    pub async fn add_role_observer(&self, observer: Arc<dyn RoleObserver>) -> Result<()> {
        self.mailbox
            .send(Command::AddRoleObserver { observer })
            .await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<PartitionStatus> {
        self.call(|reply| Command::Status { reply }).await
    }

    pub fn admin(&self) -> AdminAccess {
        AdminAccess::new(self.clone())
    }

    /// Close every service and stop the actor; closing twice succeeds
    pub async fn close(&self) -> Result<()> {
        match self.call(|reply| Command::Close { reply }).await {
            Ok(result) => result,
            Err(PartitionError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl HealthReporter for PartitionHandle {
    fn health_report(&self) -> Arc<HealthReport> {
        self.health.current()
    }

    async fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) -> Result<ListenerId> {
        self.call(|reply| Command::AddFailureListener { listener, reply })
            .await
    }

    async fn remove_failure_listener(&self, id: ListenerId) -> Result<bool> {
        self.call(|reply| Command::RemoveFailureListener { id, reply })
            .await
    }
}

impl fmt::Debug for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionHandle")
            .field("partition_id", &self.partition_id)
            .field("status", &self.health.current().status)
            .finish()
    }
}
