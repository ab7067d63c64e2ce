//! State Management Module
//!
//! Node role, operation mode and cluster membership bookkeeping,
//! plus the deterministic primary election used during failover.

mod membership;
pub mod election;

pub use membership::{ClusterMembership, ClusterSummary};
pub use election::elect_primary;

use serde::{Deserialize, Serialize};

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeRole {
    /// No session running
    #[default]
    None,
    /// Authoritative node, every other node replicates from it
    Primary,
    /// Replicating node
    Secondary,
    /// Reserved, no transition leads here yet
    Backup,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::None => write!(f, "NONE"),
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Secondary => write!(f, "SECONDARY"),
            NodeRole::Backup => write!(f, "BACKUP"),
        }
    }
}

/// Session operation mode, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Disabled,
    /// In-process preview, only event servers run
    Editor,
    /// Full cluster
    Cluster,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Disabled => write!(f, "disabled"),
            OperationMode::Editor => write!(f, "editor"),
            OperationMode::Cluster => write!(f, "cluster"),
        }
    }
}

/// Why a node is being dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Operator asked for the node to leave
    UserRequest,
    /// The node stopped responding
    Failed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::UserRequest => write!(f, "user request"),
            DropReason::Failed => write!(f, "failure"),
        }
    }
}
