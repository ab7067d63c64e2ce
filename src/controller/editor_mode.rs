//! Editor preview controller: event servers only.

use std::sync::Arc;

use super::clients::RetryPolicy;
use super::registry::{start_server_with_logs, ServiceRegistry};
use super::services::ServerContext;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::protocol::ServiceKind;

/// Hosts the event servers so tooling can inject events into a
/// single-process session
pub struct EditorController {
    node_id: String,
    config: Arc<ClusterConfig>,
    transport: Arc<dyn Transport>,
    context: Arc<ServerContext>,
    services: Arc<ServiceRegistry>,
}

impl EditorController {
    pub fn new(
        node_id: &str,
        config: Arc<ClusterConfig>,
        transport: Arc<dyn Transport>,
        context: Arc<ServerContext>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            config,
            transport,
            context,
            services: ServiceRegistry::new(),
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn start_session(&self) -> Result<()> {
        let policy = RetryPolicy::for_servers(&self.config);

        for kind in ServiceKind::EXTERNAL {
            let address = self
                .config
                .service_address(&self.node_id, kind)
                .ok_or_else(|| Error::UnknownNode(self.node_id.clone()))?;

            if !start_server_with_logs(
                &self.transport,
                &self.services,
                &self.context,
                kind,
                &address,
                policy,
            ) {
                return Err(Error::Network(format!(
                    "could not start {} server on {}",
                    kind, address
                )));
            }
        }
        Ok(())
    }

    pub fn end_session(&self) {
        self.context.terminate();
        self.services.stop_all();
    }
}
