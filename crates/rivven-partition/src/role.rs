//! Partition identifiers, raft roles and partition roles

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique node identifier (UUID or human-readable string)
pub type NodeId = String;

/// Consensus epoch, monotonically non-decreasing per partition
pub type Term = u64;

/// Key of a process instance that can be banned
pub type InstanceKey = i64;

/// Unique partition identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Role reported by the consensus layer for this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
    Promotable,
    Passive,
    Inactive,
}

impl RaftRole {
    /// Local partition role the replica should run as
    pub fn partition_role(&self) -> PartitionRole {
        match self {
            RaftRole::Leader => PartitionRole::Leader,
            RaftRole::Inactive => PartitionRole::Inactive,
            RaftRole::Follower | RaftRole::Candidate | RaftRole::Promotable | RaftRole::Passive => {
                PartitionRole::Follower
            }
        }
    }
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaftRole::Leader => "leader",
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Promotable => "promotable",
            RaftRole::Passive => "passive",
            RaftRole::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// Role the partition's dependent services are installed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    /// No role notification received yet
    #[default]
    Uninitialized,
    Leader,
    Follower,
    /// Terminal for services; nothing is installed
    Inactive,
}

impl PartitionRole {
    /// Check if services are installed for this role
    pub fn is_active(&self) -> bool {
        matches!(self, PartitionRole::Leader | PartitionRole::Follower)
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionRole::Uninitialized => "uninitialized",
            PartitionRole::Leader => "leader",
            PartitionRole::Follower => "follower",
            PartitionRole::Inactive => "inactive",
        };
        f.write_str(name)
    }
}
