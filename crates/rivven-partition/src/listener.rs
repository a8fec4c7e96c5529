//! Role observers
//!
//! Other broker subsystems (request routing, metrics, the consensus
//! bridge) learn about role changes through a single observer API. Events
//! are tagged variants rather than one callback per role.

use crate::error::Result;
use crate::role::{PartitionId, RaftRole, Term};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Role change of a partition replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleEvent {
    /// Consensus accepted a new role; fires before services are touched
    RaftRoleChanged {
        partition: PartitionId,
        role: RaftRole,
        term: Term,
    },
    /// Leader services are installed
    BecameLeader { partition: PartitionId, term: Term },
    /// Follower services are installed
    BecameFollower { partition: PartitionId, term: Term },
    /// Every service is closed
    BecameInactive { partition: PartitionId, term: Term },
}

impl RoleEvent {
    pub fn partition(&self) -> PartitionId {
        match self {
            RoleEvent::RaftRoleChanged { partition, .. }
            | RoleEvent::BecameLeader { partition, .. }
            | RoleEvent::BecameFollower { partition, .. }
            | RoleEvent::BecameInactive { partition, .. } => *partition,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            RoleEvent::RaftRoleChanged { term, .. }
            | RoleEvent::BecameLeader { term, .. }
            | RoleEvent::BecameFollower { term, .. }
            | RoleEvent::BecameInactive { term, .. } => *term,
        }
    }
}

/// Observer of partition role changes
///
/// An error returned for `BecameLeader` or `BecameFollower` fails the
/// transition exactly like a service that could not be installed.
#[async_trait]
pub trait RoleObserver: Send + Sync {
    async fn on_role_event(&self, event: RoleEvent) -> Result<()>;
}

/// Deliver an event to every observer concurrently, returning the first error
pub(crate) async fn notify_observers(
    observers: Vec<Arc<dyn RoleObserver>>,
    event: RoleEvent,
) -> Result<()> {
    let results = join_all(
        observers
            .iter()
            .map(|observer| observer.on_role_event(event)),
    )
    .await;

    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            warn!(partition = %event.partition(), event = ?event, error = %e, "Role observer failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PartitionError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RoleEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl RoleObserver for Recorder {
        async fn on_role_event(&self, event: RoleEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            if self.fail {
                return Err(PartitionError::ListenerFailed("routing table".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_all_observers_receive_event() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let event = RoleEvent::BecameLeader {
            partition: PartitionId::new(1),
            term: 4,
        };

        notify_observers(vec![first.clone(), second.clone()], event)
            .await
            .unwrap();

        assert_eq!(first.events.lock().unwrap().as_slice(), &[event]);
        assert_eq!(second.events.lock().unwrap().as_slice(), &[event]);
    }

    #[tokio::test]
    async fn test_failing_observer_fails_notification() {
        let healthy = Arc::new(Recorder::default());
        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let event = RoleEvent::BecameFollower {
            partition: PartitionId::new(2),
            term: 1,
        };

        let err = notify_observers(vec![failing, healthy.clone()], event)
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::ListenerFailed(_)));
        // the others are still told
        assert_eq!(healthy.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_accessors() {
        let event = RoleEvent::RaftRoleChanged {
            partition: PartitionId::new(9),
            role: RaftRole::Candidate,
            term: 12,
        };
        assert_eq!(event.partition(), PartitionId::new(9));
        assert_eq!(event.term(), 12);
    }
}
