//! Role transitions
//!
//! The engine turns "become leader/follower/inactive at term T" requests into
//! a sequence of steps:
//!
//! ```text
//! teardown -> storage -> stream processor -> exporter pipeline -> snapshot scheduler
//! ```
//!
//! Teardown closes everything the previous role installed, dependents first.
//! Inactive transitions stop after teardown. Each step runs in its own tokio
//! task and posts its result back to the partition mailbox; the engine is
//! only ever touched from inside the mailbox, so it needs no locking.
//!
//! Opened services are staged on the transition and only published to the
//! partition state once it settles, so admin operations and status never see
//! a half-installed role.
//!
//! At most one transition is active. A newer request cancels the active one,
//! which stops at the next step boundary without rolling back what it already
//! opened; the newer transition's teardown closes those services. Only the
//! newest pending request is kept, older queued requests are cancelled.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actor::{post, Command, FailureNotifier};
use crate::config::PartitionConfig;
use crate::error::{PartitionError, Result};
use crate::health::HealthIssue;
use crate::role::{PartitionRole, Term};
use crate::services::{Component, InstallContext, PartitionStorage, ServiceFactory};
use crate::state::{InstalledService, PartitionRuntimeState};

type Waiter = oneshot::Sender<Result<()>>;

/// Unit of work within a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionStep {
    /// Close everything installed for the previous role
    Teardown,
    Install(Component),
    /// Role observers are being told about the new role
    NotifyObservers,
}

impl fmt::Display for TransitionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionStep::Teardown => f.write_str("teardown"),
            TransitionStep::Install(component) => write!(f, "install {component}"),
            TransitionStep::NotifyObservers => f.write_str("notify observers"),
        }
    }
}

pub(crate) enum StepOutput {
    TornDown,
    Installed(InstalledService),
}

/// Result of a step, posted back to the mailbox
pub(crate) struct StepResult {
    pub transition: u64,
    pub step: TransitionStep,
    /// Context the service was opened with; `None` for teardown
    pub context: Option<InstallContext>,
    pub output: Result<StepOutput>,
}

/// What the actor has to act on after the engine handled a message
#[derive(Debug)]
pub(crate) enum TransitionEvent {
    /// All steps finished; the actor settles the transition
    StepsCompleted {
        transition: u64,
        role: PartitionRole,
        term: Term,
    },
    /// The transition is complete, its services are published and its
    /// waiters were resolved
    Settled {
        role: PartitionRole,
        term: Term,
        /// Published services with the context they were opened with
        published: Vec<(InstalledService, InstallContext)>,
    },
    /// The transition failed and its waiters got the error
    Failed {
        role: PartitionRole,
        term: Term,
        error: PartitionError,
    },
}

struct TransitionRequest {
    role: PartitionRole,
    term: Term,
    waiters: Vec<Waiter>,
}

struct ActiveTransition {
    id: u64,
    role: PartitionRole,
    term: Term,
    steps: VecDeque<TransitionStep>,
    in_flight: Option<(TransitionStep, Instant)>,
    cancelled: bool,
    waiters: Vec<Waiter>,
    /// Opened services, in install order
    staged: Vec<(InstalledService, InstallContext)>,
}

impl ActiveTransition {
    fn staged_storage(&self) -> Option<Arc<dyn PartitionStorage>> {
        self.staged.iter().find_map(|(service, _)| match service {
            InstalledService::Storage(storage) => Some(storage.clone()),
            _ => None,
        })
    }

    fn take_staged(&mut self) -> impl Iterator<Item = InstalledService> + '_ {
        self.staged.drain(..).map(|(service, _)| service)
    }

    fn cancel_waiters(&mut self) {
        let error = PartitionError::TransitionCancelled {
            role: self.role,
            term: self.term,
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

/// Drives role transitions of one partition
pub struct TransitionEngine {
    factory: Arc<dyn ServiceFactory>,
    mailbox: mpsc::WeakSender<Command>,
    snapshot_period: Duration,
    stuck_timeout: Duration,
    next_id: u64,
    active: Option<ActiveTransition>,
    queued: Option<TransitionRequest>,
    /// Latest requested (role, term)
    target: Option<(PartitionRole, Term)>,
    last_failure: Option<HealthIssue>,
    /// Services of a failed or cancelled transition, in install order
    unpublished: Vec<InstalledService>,
}

impl TransitionEngine {
    pub(crate) fn new(
        factory: Arc<dyn ServiceFactory>,
        mailbox: mpsc::WeakSender<Command>,
        config: &PartitionConfig,
    ) -> Self {
        Self {
            factory,
            mailbox,
            snapshot_period: config.snapshot_period,
            stuck_timeout: config.transition_stuck_timeout,
            next_id: 1,
            active: None,
            queued: None,
            target: None,
            last_failure: None,
            unpublished: Vec::new(),
        }
    }

    /// Latest requested role and term
    pub fn target(&self) -> Option<(PartitionRole, Term)> {
        self.target
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn has_queued(&self) -> bool {
        self.queued.is_some()
    }

    /// Whether services opened by a failed or cancelled transition await teardown
    pub(crate) fn has_unpublished(&self) -> bool {
        !self.unpublished.is_empty()
    }

    /// Every opened service that was never published, dependents first
    pub(crate) fn take_unpublished(&mut self) -> Vec<InstalledService> {
        let mut services: Vec<_> = self.unpublished.drain(..).collect();
        if let Some(active) = self.active.as_mut() {
            services.extend(active.take_staged());
        }
        services.reverse();
        services
    }

    /// Record a newer term for the current target without reinstalling
    pub(crate) fn record_term(&mut self, term: Term) {
        if let Some((_, target_term)) = &mut self.target {
            *target_term = (*target_term).max(term);
        }
    }

    /// Issue of the active or last transition, if any
    pub fn health_issue(&self) -> Option<HealthIssue> {
        if let Some(active) = &self.active {
            if let Some((step, started)) = active.in_flight {
                if started.elapsed() > self.stuck_timeout {
                    return Some(HealthIssue::new(format!(
                        "transition to {} at term {} is stuck in {} for more than {:?}",
                        active.role, active.term, step, self.stuck_timeout
                    )));
                }
            }
        }
        self.last_failure.clone()
    }

    /// Request a transition; cancels the active one if there is any
    pub(crate) fn request(
        &mut self,
        state: &mut PartitionRuntimeState,
        role: PartitionRole,
        term: Term,
        waiter: Option<Waiter>,
    ) -> Option<TransitionEvent> {
        self.target = Some((role, term));
        let request = TransitionRequest {
            role,
            term,
            waiters: waiter.into_iter().collect(),
        };

        let Some(active) = self.active.as_mut() else {
            return self.start(state, request);
        };

        if !active.cancelled {
            debug!(
                partition = %state.partition_id(),
                role = %active.role,
                term = active.term,
                next_role = %role,
                next_term = term,
                "Cancelling transition"
            );
            active.cancelled = true;
        }
        if let Some(superseded) = self.queued.replace(request) {
            let error = PartitionError::TransitionCancelled {
                role: superseded.role,
                term: superseded.term,
            };
            for waiter in superseded.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        None
    }

    /// Wait for the latest requested transition
    pub(crate) fn attach_waiter(&mut self, waiter: Waiter) {
        if let Some(queued) = self.queued.as_mut() {
            queued.waiters.push(waiter);
        } else if let Some(active) = self.active.as_mut() {
            active.waiters.push(waiter);
        } else {
            let _ = waiter.send(Ok(()));
        }
    }

    pub(crate) fn on_step_completed(
        &mut self,
        state: &mut PartitionRuntimeState,
        result: StepResult,
    ) -> Option<TransitionEvent> {
        debug!(
            partition = %state.partition_id(),
            transition = result.transition,
            step = %result.step,
            ok = result.output.is_ok(),
            "Transition step completed"
        );
        let cancelled = match self.active.as_mut() {
            Some(active) if active.id == result.transition => {
                active.in_flight = None;
                active.cancelled
            }
            _ => {
                // steps are only spawned by the active transition
                if let Ok(StepOutput::Installed(service)) = result.output {
                    warn!(
                        partition = %state.partition_id(),
                        component = %service.component(),
                        "Closing service installed by an unknown transition"
                    );
                    close_in_background(service);
                }
                return None;
            }
        };

        match result.output {
            Ok(StepOutput::TornDown) => {
                debug!(partition = %state.partition_id(), "Closed services of previous role");
            }
            Ok(StepOutput::Installed(service)) => {
                debug!(
                    partition = %state.partition_id(),
                    component = %service.component(),
                    cancelled,
                    "Opened service"
                );
                match (result.context, self.active.as_mut()) {
                    (Some(ctx), Some(active)) => active.staged.push((service, ctx)),
                    _ => close_in_background(service),
                }
            }
            Err(error) => return self.fail(state, error),
        }

        if cancelled {
            return self.finish_cancelled(state);
        }
        self.advance(state)
    }

    /// Complete a transition whose steps are done
    pub(crate) fn on_settled(
        &mut self,
        state: &mut PartitionRuntimeState,
        transition: u64,
        result: Result<()>,
    ) -> Option<TransitionEvent> {
        let cancelled = match &self.active {
            Some(active) if active.id == transition => active.cancelled,
            _ => return None,
        };
        if cancelled {
            return self.finish_cancelled(state);
        }
        if let Err(error) = result {
            return self.fail(state, error);
        }

        let mut active = self.active.take()?;
        let published = std::mem::take(&mut active.staged);
        for (service, _) in &published {
            if let Some(replaced) = state.install(service.clone()) {
                close_in_background(replaced);
            }
        }
        state.services_installed = active.role.is_active();
        if active.role.is_active() {
            self.last_failure = None;
        }
        info!(
            partition = %state.partition_id(),
            role = %active.role,
            term = active.term,
            "Partition transition completed"
        );
        for waiter in active.waiters {
            let _ = waiter.send(Ok(()));
        }
        Some(TransitionEvent::Settled {
            role: active.role,
            term: active.term,
            published,
        })
    }

    fn start(
        &mut self,
        state: &mut PartitionRuntimeState,
        request: TransitionRequest,
    ) -> Option<TransitionEvent> {
        let id = self.next_id;
        self.next_id += 1;

        info!(
            partition = %state.partition_id(),
            from = %state.role,
            to = %request.role,
            term = request.term,
            "Transitioning partition"
        );

        state.role = request.role;
        state.term = state.term.max(request.term);
        state.generation = id;
        state.services_installed = false;

        let mut steps = VecDeque::new();
        if request.role.is_active() {
            steps.extend(
                Component::INSTALL_ORDER
                    .iter()
                    .map(|component| TransitionStep::Install(*component)),
            );
        }
        self.active = Some(ActiveTransition {
            id,
            role: request.role,
            term: request.term,
            steps,
            in_flight: None,
            cancelled: false,
            waiters: request.waiters,
            staged: Vec::new(),
        });

        let mut installed = state.take_all();
        installed.extend(self.unpublished.drain(..).rev());
        if installed.is_empty() {
            return self.advance(state);
        }

        if let Some(active) = self.active.as_mut() {
            active.in_flight = Some((TransitionStep::Teardown, Instant::now()));
        }
        let partition = state.partition_id();
        let teardown = async move {
            for service in installed {
                let component = service.component();
                if let Err(e) = service.close().await {
                    warn!(partition = %partition, component = %component, error = %e, "Failed to close service");
                }
            }
            Ok(StepOutput::TornDown)
        };
        self.spawn_step(id, TransitionStep::Teardown, None, teardown.boxed());
        None
    }

    fn advance(&mut self, state: &mut PartitionRuntimeState) -> Option<TransitionEvent> {
        let active = self.active.as_mut()?;

        let Some(step) = active.steps.pop_front() else {
            active.in_flight = Some((TransitionStep::NotifyObservers, Instant::now()));
            return Some(TransitionEvent::StepsCompleted {
                transition: active.id,
                role: active.role,
                term: active.term,
            });
        };
        active.in_flight = Some((step, Instant::now()));

        let TransitionStep::Install(component) = step else {
            return None;
        };
        let id = active.id;
        let storage = active.staged_storage();
        let ctx = InstallContext {
            partition_id: state.partition_id(),
            node_id: state.node_id().clone(),
            role: active.role,
            term: active.term,
            dynamic_config: state.dynamic_config.clone(),
            disk_space_available: state.disk_space_available,
            snapshot_period: self.snapshot_period,
            failures: FailureNotifier::new(self.mailbox.clone(), id),
        };

        debug!(partition = %ctx.partition_id, step = %step, term = ctx.term, "Starting transition step");
        let future = open_service(self.factory.clone(), component, ctx.clone(), storage);
        self.spawn_step(id, step, Some(ctx), future);
        None
    }

    fn fail(
        &mut self,
        state: &mut PartitionRuntimeState,
        error: PartitionError,
    ) -> Option<TransitionEvent> {
        let mut active = self.active.take()?;
        self.unpublished.extend(active.take_staged());

        if active.cancelled || error.is_cancelled() {
            debug!(
                partition = %state.partition_id(),
                role = %active.role,
                term = active.term,
                error = %error,
                "Ignoring failure of superseded transition"
            );
            active.cancel_waiters();
            return self.start_queued(state);
        }

        if error.is_fatal() {
            error!(
                partition = %state.partition_id(),
                role = %active.role,
                term = active.term,
                error = %error,
                "Transition failed unrecoverably"
            );
        } else {
            warn!(
                partition = %state.partition_id(),
                role = %active.role,
                term = active.term,
                error = %error,
                "Transition failed"
            );
        }

        self.last_failure = Some(HealthIssue::from_error(
            format!(
                "transition to {} at term {} failed",
                active.role, active.term
            ),
            &error,
        ));
        for waiter in active.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        Some(TransitionEvent::Failed {
            role: active.role,
            term: active.term,
            error,
        })
    }

    fn finish_cancelled(&mut self, state: &mut PartitionRuntimeState) -> Option<TransitionEvent> {
        if let Some(mut active) = self.active.take() {
            self.unpublished.extend(active.take_staged());
            debug!(
                partition = %state.partition_id(),
                role = %active.role,
                term = active.term,
                "Transition cancelled"
            );
            active.cancel_waiters();
        }
        self.start_queued(state)
    }

    fn start_queued(&mut self, state: &mut PartitionRuntimeState) -> Option<TransitionEvent> {
        let request = self.queued.take()?;
        self.start(state, request)
    }

    fn spawn_step(
        &self,
        transition: u64,
        step: TransitionStep,
        context: Option<InstallContext>,
        future: BoxFuture<'static, Result<StepOutput>>,
    ) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let output = match tokio::spawn(future).await {
                Ok(output) => output,
                Err(e) if e.is_panic() => Err(PartitionError::unrecoverable(
                    step.to_string(),
                    "transition step panicked",
                )),
                Err(_) => Err(PartitionError::unrecoverable(
                    step.to_string(),
                    "transition step was aborted",
                )),
            };

            let result = StepResult {
                transition,
                step,
                context,
                output,
            };
            if let Err(Command::StepCompleted(orphan)) =
                post(&mailbox, Command::StepCompleted(result)).await
            {
                // partition stopped while the step was running
                if let Ok(StepOutput::Installed(service)) = orphan.output {
                    let _ = service.close().await;
                }
            }
        });
    }
}

fn open_service(
    factory: Arc<dyn ServiceFactory>,
    component: Component,
    ctx: InstallContext,
    storage: Option<Arc<dyn PartitionStorage>>,
) -> BoxFuture<'static, Result<StepOutput>> {
    async move {
        let service = match component {
            Component::Storage => InstalledService::Storage(factory.open_storage(&ctx).await?),
            Component::StreamProcessor => InstalledService::StreamProcessor(
                factory
                    .open_stream_processor(&ctx, require_storage(storage, component)?)
                    .await?,
            ),
            Component::ExporterPipeline => InstalledService::ExporterPipeline(
                factory
                    .open_exporter_pipeline(&ctx, require_storage(storage, component)?)
                    .await?,
            ),
            Component::SnapshotScheduler => InstalledService::SnapshotScheduler(
                factory
                    .open_snapshot_scheduler(&ctx, require_storage(storage, component)?)
                    .await?,
            ),
        };
        Ok(StepOutput::Installed(service))
    }
    .boxed()
}

fn require_storage(
    storage: Option<Arc<dyn PartitionStorage>>,
    component: Component,
) -> Result<Arc<dyn PartitionStorage>> {
    storage.ok_or_else(|| PartitionError::Internal(format!("{component} requires storage")))
}

fn close_in_background(service: InstalledService) {
    tokio::spawn(async move {
        if let Err(e) = service.close().await {
            warn!(component = %service.component(), error = %e, "Failed to close service");
        }
    });
}
