//! Node Controller
//!
//! Owns the services and clients of this node. The variant is picked by
//! the operation mode at session start and never changes afterwards.

mod clients;
mod editor_mode;
mod main_mode;
mod registry;
mod services;

pub use clients::{ClientSet, RetryPolicy};
pub use editor_mode::EditorController;
pub use main_mode::MainController;
pub use registry::ServiceRegistry;
pub use services::{ServerContext, ServiceHandler};

use std::sync::{Arc, Weak};

use crate::cluster::ClusterCoordinator;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::protocol::{NodeHostingInfo, Request, Response, ServiceKind};
use crate::state::{ClusterMembership, OperationMode};

/// Per-mode node controller
pub enum NodeController {
    /// Rejects everything with `NotAllowed`
    Disabled,
    Editor(EditorController),
    Main(MainController),
}

impl NodeController {
    pub fn new(
        mode: OperationMode,
        node_id: &str,
        config: Arc<ClusterConfig>,
        transport: Arc<dyn Transport>,
        membership: Arc<ClusterMembership>,
        coordinator: Weak<ClusterCoordinator>,
    ) -> Self {
        match mode {
            OperationMode::Disabled => NodeController::Disabled,
            OperationMode::Editor => {
                let context = ServerContext::new(node_id, &config, coordinator);
                NodeController::Editor(EditorController::new(node_id, config, transport, context))
            }
            OperationMode::Cluster => {
                let context = ServerContext::new(node_id, &config, coordinator);
                NodeController::Main(MainController::new(
                    node_id, config, transport, context, membership,
                ))
            }
        }
    }

    pub fn mode(&self) -> OperationMode {
        match self {
            NodeController::Disabled => OperationMode::Disabled,
            NodeController::Editor(_) => OperationMode::Editor,
            NodeController::Main(_) => OperationMode::Cluster,
        }
    }

    pub fn start_session(&self) -> Result<()> {
        match self {
            NodeController::Disabled => Ok(()),
            NodeController::Editor(editor) => editor.start_session(),
            NodeController::Main(main) => main.start_session(),
        }
    }

    pub fn end_session(&self) {
        match self {
            NodeController::Disabled => {}
            NodeController::Editor(editor) => editor.end_session(),
            NodeController::Main(main) => main.end_session(),
        }
    }

    /// Call a specific node
    pub fn call(&self, node_id: &str, request: Request) -> Result<Response> {
        match self {
            NodeController::Main(main) => main.call(node_id, request),
            _ => Err(self.reject(&request)),
        }
    }

    /// Call whoever is primary right now
    pub fn call_primary(&self, request: Request) -> Result<Response> {
        match self {
            NodeController::Main(main) => main.call_primary(request),
            _ => Err(self.reject(&request)),
        }
    }

    fn reject(&self, request: &Request) -> Error {
        let what = format!("{} in {} mode", request.type_name(), self.mode());
        match (self, request.service()) {
            (
                NodeController::Editor(_),
                ServiceKind::GenericBarrier | ServiceKind::InternalComm,
            ) => Error::NotImplemented(what),
            _ => Error::NotAllowed(what),
        }
    }

    pub fn drop_node_resources(&self, node_id: &str) {
        if let NodeController::Main(main) = self {
            main.drop_node_resources(node_id);
        }
    }

    pub fn local_hosting_info(&self) -> Option<NodeHostingInfo> {
        match self {
            NodeController::Main(main) => Some(main.local_hosting_info()),
            _ => None,
        }
    }

    /// Bound address of a live service on this node
    pub fn service_address(&self, service: ServiceKind) -> Option<String> {
        match self {
            NodeController::Disabled => None,
            NodeController::Editor(editor) => editor.services().address(service.name()),
            NodeController::Main(main) => main.services().address(service.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use crate::protocol::ResultCode;

    fn controller(mode: OperationMode) -> NodeController {
        let network = LocalNetwork::new();
        NodeController::new(
            mode,
            "node-a",
            Arc::new(ClusterConfig::sample()),
            Arc::new(network.transport("127.0.0.1")),
            Arc::new(ClusterMembership::new()),
            Weak::new(),
        )
    }

    fn code(result: Result<Response>) -> Option<ResultCode> {
        result.err().and_then(|e| e.result_code())
    }

    #[test]
    fn test_disabled_rejects_everything() {
        let controller = controller(OperationMode::Disabled);
        assert!(controller.start_session().is_ok());

        for request in [
            Request::GetTimeData,
            Request::IsBarrierAvailable { barrier_id: "b".into() },
            Request::GatherServicesHostingInfo { info: NodeHostingInfo::default() },
        ] {
            assert_eq!(code(controller.call_primary(request)), Some(ResultCode::NotAllowed));
        }
    }

    #[test]
    fn test_editor_result_codes() {
        let controller = controller(OperationMode::Editor);

        assert_eq!(
            code(controller.call_primary(Request::GetTimeData)),
            Some(ResultCode::NotAllowed)
        );
        assert_eq!(
            code(controller.call_primary(Request::SynchronizeOnBarrier { node_id: "node-a".into() })),
            Some(ResultCode::NotAllowed)
        );
        assert_eq!(
            code(controller.call("node-a", Request::ReleaseBarrier { barrier_id: "b".into() })),
            Some(ResultCode::NotImplemented)
        );
        assert_eq!(
            code(controller.call(
                "node-a",
                Request::RequestNodeDrop {
                    node_id: "node-b".into(),
                    reason: crate::state::DropReason::UserRequest
                }
            )),
            Some(ResultCode::NotImplemented)
        );
    }

    #[test]
    fn test_editor_starts_only_event_servers() {
        let controller = controller(OperationMode::Editor);
        controller.start_session().unwrap();

        assert!(controller.service_address(ServiceKind::EventsJson).is_some());
        assert!(controller.service_address(ServiceKind::EventsBinary).is_some());
        assert!(controller.service_address(ServiceKind::ClusterSync).is_none());

        controller.end_session();
        assert!(controller.service_address(ServiceKind::EventsJson).is_none());
    }
}
