//! Cluster Membership Management
//!
//! Tracks the node sets, the primary node and this node's role. Each
//! piece of state sits behind its own lock so that frame producers and
//! RPC-servicing threads never serialize on one another.

use std::collections::BTreeSet;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::NodeRole;

/// Cluster membership tracker
#[derive(Default)]
pub struct ClusterMembership {
    /// This node's ID
    node_id: RwLock<String>,
    /// Every node of the session topology
    all_nodes: RwLock<BTreeSet<String>>,
    /// Nodes that have not been dropped
    active_nodes: RwLock<BTreeSet<String>>,
    /// Current primary
    primary_node_id: RwLock<String>,
    /// This node's role
    role: Mutex<NodeRole>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate membership for a new session
    pub fn init(&self, node_id: &str, nodes: &[String], primary_node_id: &str) {
        *self.node_id.write() = node_id.to_string();
        *self.all_nodes.write() = nodes.iter().cloned().collect();
        *self.active_nodes.write() = nodes.iter().cloned().collect();
        *self.primary_node_id.write() = primary_node_id.to_string();

        let role = if node_id == primary_node_id {
            NodeRole::Primary
        } else {
            NodeRole::Secondary
        };
        *self.role.lock() = role;
    }

    /// Forget everything about the session
    pub fn clear(&self) {
        self.node_id.write().clear();
        self.all_nodes.write().clear();
        self.active_nodes.write().clear();
        self.primary_node_id.write().clear();
        *self.role.lock() = NodeRole::None;
    }

    /// Get this node's ID
    pub fn node_id(&self) -> String {
        self.node_id.read().clone()
    }

    pub fn role(&self) -> NodeRole {
        *self.role.lock()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == NodeRole::Primary
    }

    pub fn primary_node_id(&self) -> String {
        self.primary_node_id.read().clone()
    }

    /// Sorted ids of every configured node
    pub fn all_nodes(&self) -> Vec<String> {
        self.all_nodes.read().iter().cloned().collect()
    }

    /// Sorted ids of the active nodes
    pub fn active_nodes(&self) -> Vec<String> {
        self.active_nodes.read().iter().cloned().collect()
    }

    pub fn is_active(&self, node_id: &str) -> bool {
        self.active_nodes.read().contains(node_id)
    }

    pub fn active_count(&self) -> usize {
        self.active_nodes.read().len()
    }

    /// Remove a node from the active set. Returns false if it was not active.
    pub fn deactivate(&self, node_id: &str) -> bool {
        self.active_nodes.write().remove(node_id)
    }

    /// Make `node_id` the primary. Returns false when nothing changed.
    ///
    /// Only promotion happens here, there is no demotion path.
    pub fn set_primary(&self, node_id: &str) -> bool {
        if !self.is_active(node_id) {
            return false;
        }

        {
            let mut primary = self.primary_node_id.write();
            if *primary == node_id {
                return false;
            }
            *primary = node_id.to_string();
        }

        if *self.node_id.read() == node_id {
            *self.role.lock() = NodeRole::Primary;
        }

        true
    }

    /// Get cluster summary
    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            node_id: self.node_id(),
            role: self.role(),
            primary_node_id: self.primary_node_id(),
            total_nodes: self.all_nodes.read().len(),
            active_nodes: self.active_nodes(),
        }
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub node_id: String,
    pub role: NodeRole,
    pub primary_node_id: String,
    pub total_nodes: usize,
    pub active_nodes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        vec!["node-a".into(), "node-b".into(), "node-c".into()]
    }

    #[test]
    fn test_initial_roles() {
        let primary = ClusterMembership::new();
        primary.init("node-a", &nodes(), "node-a");
        assert_eq!(primary.role(), NodeRole::Primary);

        let secondary = ClusterMembership::new();
        secondary.init("node-b", &nodes(), "node-a");
        assert_eq!(secondary.role(), NodeRole::Secondary);
        assert_eq!(secondary.active_count(), 3);
    }

    #[test]
    fn test_set_primary_promotes_self() {
        let cluster = ClusterMembership::new();
        cluster.init("node-b", &nodes(), "node-a");

        // Already current
        assert!(!cluster.set_primary("node-a"));

        assert!(cluster.deactivate("node-a"));
        assert!(cluster.set_primary("node-b"));
        assert_eq!(cluster.role(), NodeRole::Primary);
        assert_eq!(cluster.primary_node_id(), "node-b");
    }

    #[test]
    fn test_set_primary_ignores_inactive() {
        let cluster = ClusterMembership::new();
        cluster.init("node-b", &nodes(), "node-a");
        cluster.deactivate("node-c");

        assert!(!cluster.set_primary("node-c"));
        assert_eq!(cluster.primary_node_id(), "node-a");
        assert_eq!(cluster.role(), NodeRole::Secondary);
    }

    #[test]
    fn test_clear() {
        let cluster = ClusterMembership::new();
        cluster.init("node-a", &nodes(), "node-a");
        cluster.clear();

        assert_eq!(cluster.role(), NodeRole::None);
        assert!(cluster.active_nodes().is_empty());
        assert!(cluster.all_nodes().is_empty());
    }
}
