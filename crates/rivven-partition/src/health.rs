//! Partition health aggregation
//!
//! A partition's health combines several independently reported factors into
//! one [`HealthReport`]. Inputs are evaluated in priority order:
//!
//! 1. once declared dead, the partition stays dead
//! 2. disk space unavailable
//! 3. the active transition is stuck or failed
//! 4. a recorded runtime failure
//! 5. services not installed
//! 6. otherwise healthy
//!
//! The current report is published as an immutable `Arc<HealthReport>` through
//! a `watch` channel, so any thread can read it without going through the
//! partition mailbox. Readers only ever see it through a [`HealthSubscription`],
//! which clones the `Arc` and releases the channel right away.
//! [`FailureListener`]s are called on status changes only.
//! [`HealthTree`] rolls many partitions up into a broker-wide status.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{PartitionError, Result};

/// Aggregated health status, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Permanent until the process restarts
    Dead,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Reason a component is not healthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub message: String,
    pub cause: Option<String>,
    pub since: SystemTime,
}

impl HealthIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            since: SystemTime::now(),
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn from_error(message: impl Into<String>, error: &PartitionError) -> Self {
        Self::new(message).with_cause(error)
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

/// Snapshot of a component's health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub component: String,
    pub status: HealthStatus,
    pub issue: Option<HealthIssue>,
    pub timestamp: SystemTime,
}

impl HealthReport {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy, None)
    }

    pub fn unhealthy(component: impl Into<String>, issue: HealthIssue) -> Self {
        Self::new(component, HealthStatus::Unhealthy, Some(issue))
    }

    pub fn dead(component: impl Into<String>, issue: HealthIssue) -> Self {
        Self::new(component, HealthStatus::Dead, Some(issue))
    }

    fn new(component: impl Into<String>, status: HealthStatus, issue: Option<HealthIssue>) -> Self {
        Self {
            component: component.into(),
            status,
            issue,
            timestamp: SystemTime::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn is_dead(&self) -> bool {
        self.status == HealthStatus::Dead
    }
}

/// Notified when a component's health status changes
pub trait FailureListener: Send + Sync {
    fn on_failure(&self, report: &HealthReport);

    fn on_recovered(&self, report: &HealthReport);

    fn on_unrecoverable_failure(&self, report: &HealthReport);
}

/// Read side of a partition's health
#[async_trait]
pub trait HealthReporter: Send + Sync {
    /// Latest report; never blocks on the partition
    fn health_report(&self) -> Arc<HealthReport>;

    async fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) -> Result<ListenerId>;

    async fn remove_failure_listener(&self, id: ListenerId) -> Result<bool>;
}

/// Handle for removing a registered failure listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Follows the health report of one component
///
/// Every read clones the current report, so a subscriber never holds the
/// channel while the component publishes a new one.
#[derive(Clone)]
pub struct HealthSubscription {
    rx: watch::Receiver<Arc<HealthReport>>,
}

impl HealthSubscription {
    fn new(rx: watch::Receiver<Arc<HealthReport>>) -> Self {
        Self { rx }
    }

    /// Latest report
    pub fn current(&self) -> Arc<HealthReport> {
        self.rx.borrow().clone()
    }

    /// Wait for the next report; fails once the component stopped
    pub async fn changed(&mut self) -> Result<Arc<HealthReport>> {
        self.rx.changed().await.map_err(|_| PartitionError::Closed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until a report matches `predicate`, starting with the current one
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&HealthReport) -> bool,
    ) -> Result<Arc<HealthReport>> {
        loop {
            let report = self.rx.borrow_and_update().clone();
            if predicate(&report) {
                return Ok(report);
            }
            self.rx.changed().await.map_err(|_| PartitionError::Closed)?;
        }
    }
}

impl fmt::Debug for HealthSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthSubscription")
            .field("status", &self.current().status)
            .finish()
    }
}

/// Health factors of a partition at one point in time
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub disk_space_available: bool,
    pub transition_issue: Option<HealthIssue>,
    pub failure: Option<HealthIssue>,
    pub services_installed: bool,
}

impl Default for HealthInputs {
    fn default() -> Self {
        Self {
            disk_space_available: true,
            transition_issue: None,
            failure: None,
            services_installed: false,
        }
    }
}

impl HealthInputs {
    /// Evaluate the inputs, ignoring dead state
    pub fn evaluate(&self) -> (HealthStatus, Option<HealthIssue>) {
        if !self.disk_space_available {
            return (
                HealthStatus::Unhealthy,
                Some(HealthIssue::new("not enough disk space available")),
            );
        }
        if let Some(issue) = &self.transition_issue {
            return (HealthStatus::Unhealthy, Some(issue.clone()));
        }
        if let Some(issue) = &self.failure {
            return (HealthStatus::Unhealthy, Some(issue.clone()));
        }
        if !self.services_installed {
            return (
                HealthStatus::Unhealthy,
                Some(HealthIssue::new("services not installed")),
            );
        }
        (HealthStatus::Healthy, None)
    }
}

/// Combines partition health factors into one monotonic report
pub struct HealthAggregator {
    component: String,
    dead: Option<HealthIssue>,
    current: Arc<HealthReport>,
    publisher: watch::Sender<Arc<HealthReport>>,
    listeners: Vec<(ListenerId, Arc<dyn FailureListener>)>,
    next_listener_id: u64,
}

impl HealthAggregator {
    /// Create an aggregator; the partition starts without services
    pub fn new(component: impl Into<String>) -> Self {
        let component = component.into();
        let (status, issue) = HealthInputs::default().evaluate();
        let current = Arc::new(HealthReport::new(component.clone(), status, issue));
        let (publisher, _) = watch::channel(current.clone());

        Self {
            component,
            dead: None,
            current,
            publisher,
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// Latest report
    pub fn report(&self) -> Arc<HealthReport> {
        self.current.clone()
    }

    pub fn subscribe(&self) -> HealthSubscription {
        HealthSubscription::new(self.publisher.subscribe())
    }

    pub fn is_dead(&self) -> bool {
        self.dead.is_some()
    }

    /// Re-evaluate health from the given inputs
    pub fn update(&mut self, inputs: &HealthInputs) -> Arc<HealthReport> {
        if let Some(issue) = &self.dead {
            // dead absorbs every later input
            let issue = issue.clone();
            return self.publish(HealthStatus::Dead, Some(issue));
        }
        let (status, issue) = inputs.evaluate();
        self.publish(status, issue)
    }

    /// Declare the partition dead; irreversible
    pub fn mark_dead(&mut self, issue: HealthIssue) -> Arc<HealthReport> {
        if self.dead.is_none() {
            error!(component = %self.component, issue = %issue, "Marking component as dead");
            self.dead = Some(issue.clone());
        }
        let issue = self.dead.clone().unwrap_or(issue);
        self.publish(HealthStatus::Dead, Some(issue))
    }

    /// Register a listener; it is told about a current failure right away
    pub fn add_listener(&mut self, listener: Arc<dyn FailureListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;

        notify(listener.as_ref(), &self.current);
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    fn publish(&mut self, status: HealthStatus, issue: Option<HealthIssue>) -> Arc<HealthReport> {
        let unchanged = self.current.status == status
            && self.current.issue.as_ref().map(|i| &i.message) == issue.as_ref().map(|i| &i.message);
        if unchanged {
            return self.current.clone();
        }

        let previous = self.current.status;
        let report = Arc::new(HealthReport::new(self.component.clone(), status, issue));
        self.current = report.clone();
        self.publisher.send_replace(report.clone());

        if previous != status {
            match status {
                HealthStatus::Healthy => debug!(component = %self.component, "Component recovered"),
                HealthStatus::Unhealthy => warn!(
                    component = %self.component,
                    issue = ?report.issue.as_ref().map(|i| i.to_string()),
                    "Component became unhealthy"
                ),
                HealthStatus::Dead => {}
            }
            for (_, listener) in &self.listeners {
                notify(listener.as_ref(), &report);
            }
        }

        report
    }
}

fn notify(listener: &dyn FailureListener, report: &HealthReport) {
    match report.status {
        HealthStatus::Healthy => listener.on_recovered(report),
        HealthStatus::Unhealthy => listener.on_failure(report),
        HealthStatus::Dead => listener.on_unrecoverable_failure(report),
    }
}

/// Broker-wide roll-up of component health
#[derive(Debug)]
pub struct HealthTree {
    name: String,
    children: DashMap<String, HealthReport>,
}

impl HealthTree {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: DashMap::new(),
        }
    }

    /// Track a child before it reports for the first time
    pub fn register(&self, component: impl Into<String>) {
        let component = component.into();
        self.children.entry(component.clone()).or_insert_with(|| {
            HealthReport::unhealthy(component, HealthIssue::new("no health reported yet"))
        });
    }

    pub fn remove(&self, component: &str) {
        self.children.remove(component);
    }

    /// Latest report of one child
    pub fn child(&self, component: &str) -> Option<HealthReport> {
        self.children.get(component).map(|r| r.clone())
    }

    /// Worst status across all children
    pub fn report(&self) -> HealthReport {
        let worst = self
            .children
            .iter()
            .filter(|child| !child.is_healthy())
            .max_by_key(|child| child.status)
            .map(|child| child.value().clone());

        match worst {
            None => HealthReport::healthy(self.name.clone()),
            Some(child) => {
                let message = match &child.issue {
                    Some(issue) => format!("{} is {}: {}", child.component, child.status, issue),
                    None => format!("{} is {}", child.component, child.status),
                };
                HealthReport::new(self.name.clone(), child.status, Some(HealthIssue::new(message)))
            }
        }
    }

    fn record(&self, report: &HealthReport) {
        let mut entry = self
            .children
            .entry(report.component.clone())
            .or_insert_with(|| report.clone());
        // a dead child is never resurrected
        if !entry.is_dead() {
            *entry = report.clone();
        }
    }
}

impl FailureListener for HealthTree {
    fn on_failure(&self, report: &HealthReport) {
        self.record(report);
    }

    fn on_recovered(&self, report: &HealthReport) {
        self.record(report);
    }

    fn on_unrecoverable_failure(&self, report: &HealthReport) {
        self.record(report);
    }
}
