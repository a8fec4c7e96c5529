//! Partition error types and failure classification

use crate::role::{PartitionId, PartitionRole, Term};
use crate::services::Component;
use thiserror::Error;

/// Result type for partition operations
pub type Result<T> = std::result::Result<T, PartitionError>;

/// How the orchestrator reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Superseded by a newer transition; not an error
    Cancelled,
    /// Expected to be transient: step down or go inactive
    Recoverable,
    /// Invariant violation or corruption: the partition is dead
    Unrecoverable,
}

/// Partition errors
#[derive(Debug, Clone, Error)]
pub enum PartitionError {
    // ==================== Transition Errors ====================
    #[error("transition to {role} at term {term} was cancelled")]
    TransitionCancelled { role: PartitionRole, term: Term },

    #[error("failed to install {component}: {reason}")]
    InstallFailed { component: Component, reason: String },

    #[error("role listener failed: {0}")]
    ListenerFailed(String),

    // ==================== Fatal Errors ====================
    #[error("unrecoverable failure in {component}: {reason}")]
    Unrecoverable { component: String, reason: String },

    #[error("corrupt data: {0}")]
    CorruptData(String),

    // ==================== Service Errors ====================
    #[error("{0} is not installed")]
    ServiceNotInstalled(Component),

    #[error("{component} failed: {reason}")]
    Service { component: Component, reason: String },

    #[error("not leader: partition is {role}")]
    NotLeader { role: PartitionRole },

    #[error("exporter not found: {0}")]
    ExporterNotFound(String),

    #[error("log write failed: {0}")]
    LogWrite(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    // ==================== Consensus Errors ====================
    #[error("consensus error: {0}")]
    Consensus(String),

    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config store error: {0}")]
    ConfigStore(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    // ==================== Registry Errors ====================
    #[error("partition not found: {0}")]
    PartitionNotFound(PartitionId),

    #[error("partition already exists: {0}")]
    PartitionAlreadyExists(PartitionId),

    // ==================== Internal Errors ====================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("partition closed")]
    Closed,
}

impl PartitionError {
    /// Shorthand for a failure reported by an installed service
    pub fn service(component: Component, reason: impl Into<String>) -> Self {
        PartitionError::Service {
            component,
            reason: reason.into(),
        }
    }

    /// Shorthand for a failure while installing a service
    pub fn install(component: Component, reason: impl Into<String>) -> Self {
        PartitionError::InstallFailed {
            component,
            reason: reason.into(),
        }
    }

    /// Shorthand for an unrecoverable failure
    pub fn unrecoverable(component: impl Into<String>, reason: impl Into<String>) -> Self {
        PartitionError::Unrecoverable {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Classify this error for failure routing
    pub fn classify(&self) -> FailureKind {
        match self {
            PartitionError::TransitionCancelled { .. } => FailureKind::Cancelled,
            PartitionError::Unrecoverable { .. }
            | PartitionError::CorruptData(_)
            | PartitionError::Internal(_) => FailureKind::Unrecoverable,
            _ => FailureKind::Recoverable,
        }
    }

    /// Check if this is a cancellation marker rather than a failure
    pub fn is_cancelled(&self) -> bool {
        self.classify() == FailureKind::Cancelled
    }

    /// Check if the partition can recover from this error by changing role
    pub fn is_recoverable(&self) -> bool {
        self.classify() == FailureKind::Recoverable
    }

    /// Check if this is a fatal error requiring the partition to die
    pub fn is_fatal(&self) -> bool {
        self.classify() == FailureKind::Unrecoverable
    }
}

impl From<std::io::Error> for PartitionError {
    fn from(e: std::io::Error) -> Self {
        PartitionError::Io(e.to_string())
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for PartitionError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        PartitionError::Closed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for PartitionError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        PartitionError::ChannelClosed
    }
}

// Conversion from postcard for the persisted configuration
impl From<postcard::Error> for PartitionError {
    fn from(e: postcard::Error) -> Self {
        PartitionError::Serialization(e.to_string())
    }
}
