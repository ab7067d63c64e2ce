//! Hooks the host application plugs into the coordinator.

/// Notified about topology changes
pub trait ClusterObserver: Send + Sync {
    fn on_node_failed(&self, _node_id: &str) {}

    fn on_primary_changed(&self, _primary_node_id: &str) {}
}

/// Called when this node must stop: unrecoverable failure, being dropped
/// as failed, or a drop requested by the primary
pub trait TerminationHandler: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// Default handler: log and exit the process
pub struct ProcessExit;

impl TerminationHandler for ProcessExit {
    fn terminate(&self, reason: &str) {
        tracing::error!("Terminating node: {}", reason);
        std::process::exit(1);
    }
}
