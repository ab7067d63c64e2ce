//! Full cluster mode controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;

use super::clients::{ClientSet, RetryPolicy};
use super::registry::{start_server_with_logs, ServiceRegistry};
use super::services::{hosting_ports, ServerContext};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::{Connection, Transport};
use crate::protocol::{NodeHostingInfo, Request, Response, ServiceKind};
use crate::state::ClusterMembership;

/// Controller running every service and a client set per cluster node
pub struct MainController {
    node_id: String,
    config: Arc<ClusterConfig>,
    transport: Arc<dyn Transport>,
    context: Arc<ServerContext>,
    membership: Arc<ClusterMembership>,
    services: Arc<ServiceRegistry>,
    /// node id -> clients, this node included
    clients: RwLock<HashMap<String, Arc<ClientSet>>>,
}

impl MainController {
    pub fn new(
        node_id: &str,
        config: Arc<ClusterConfig>,
        transport: Arc<dyn Transport>,
        context: Arc<ServerContext>,
        membership: Arc<ClusterMembership>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            config,
            transport,
            context,
            membership,
            services: ServiceRegistry::new(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    fn address(&self, node_id: &str, service: ServiceKind) -> Result<String> {
        self.config
            .service_address(node_id, service)
            .ok_or_else(|| Error::UnknownNode(node_id.to_string()))
    }

    pub fn start_session(&self) -> Result<()> {
        let policy = RetryPolicy::for_servers(&self.config);

        for kind in ServiceKind::INTERNAL {
            let address = self.address(&self.node_id, kind)?;
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

        self.start_external_servers()?;

        for node_id in self.config.node_ids() {
            if !self.start_client_with_logs(&node_id) {
                return Err(Error::ConnectionFailed {
                    address: node_id,
                    reason: "client set could not connect".to_string(),
                });
            }
        }

        tracing::info!(
            "Node {} started {} service(s) and {} client set(s)",
            self.node_id,
            self.services.kinds().len(),
            self.clients.read().len()
        );
        Ok(())
    }

    /// External servers get one immediate attempt; the rest of the bind
    /// retries continue in the background.
    fn start_external_servers(&self) -> Result<()> {
        let mut pending = Vec::new();
        let single = RetryPolicy {
            attempts: 1,
            ..RetryPolicy::for_servers(&self.config)
        };

        for kind in ServiceKind::EXTERNAL {
            let address = self.address(&self.node_id, kind)?;
            if !start_server_with_logs(
                &self.transport,
                &self.services,
                &self.context,
                kind,
                &address,
                single,
            ) {
                pending.push((kind, address));
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            "Deferring {} external server(s) to background retry",
            pending.len()
        );

        let transport = Arc::clone(&self.transport);
        let services = Arc::clone(&self.services);
        let context = Arc::clone(&self.context);
        let policy = RetryPolicy::for_servers(&self.config);

        thread::Builder::new()
            .name("wolfsync-external".to_string())
            .spawn(move || {
                for (kind, address) in pending {
                    if context.is_terminating() {
                        return;
                    }
                    start_server_with_logs(&transport, &services, &context, kind, &address, policy);
                }
                if context.is_terminating() {
                    services.stop_all();
                }
            })?;

        Ok(())
    }

    /// Connect a client set with retries. Failure is reported as `false`.
    pub fn start_client_with_logs(&self, node_id: &str) -> bool {
        let policy = RetryPolicy::for_clients(&self.config);
        let result = policy.run(&format!("client set for {}", node_id), || {
            ClientSet::connect(Arc::clone(&self.transport), Arc::clone(&self.config), node_id)
        });

        match result {
            Ok(set) => {
                tracing::info!("Connected client set for node {}", node_id);
                self.clients.write().insert(node_id.to_string(), Arc::new(set));
                true
            }
            Err(e) => {
                tracing::error!(
                    "Failed to connect to node {} after {} attempt(s): {}",
                    node_id,
                    policy.attempts,
                    e
                );
                false
            }
        }
    }

    pub fn end_session(&self) {
        self.context.terminate();
        self.services.stop_all();
        self.clients.write().clear();
    }

    fn client_set(&self, node_id: &str) -> Result<Arc<ClientSet>> {
        self.clients
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeFailed {
                node_id: node_id.to_string(),
                reason: "no client set for node".to_string(),
            })
    }

    /// Client set of whoever is primary right now
    pub fn get_active_client_set(&self) -> Result<Arc<ClientSet>> {
        self.client_set(&self.membership.primary_node_id())
    }

    /// Per-call generic barrier client to the primary
    pub fn get_barrier_client_from_context(&self) -> Result<(String, Arc<dyn Connection>)> {
        let primary = self.membership.primary_node_id();
        let connection = self.barrier_client(&primary)?;
        Ok((primary, connection))
    }

    fn barrier_client(&self, node_id: &str) -> Result<Arc<dyn Connection>> {
        let address = self.address(node_id, ServiceKind::GenericBarrier)?;
        self.transport
            .connect(ServiceKind::GenericBarrier, &address)
            .map_err(|e| node_failure(node_id, e))
    }

    /// Call a specific node
    pub fn call(&self, node_id: &str, request: Request) -> Result<Response> {
        if self.context.is_terminating() {
            return Err(Error::ShuttingDown);
        }

        let connection = match request.service() {
            ServiceKind::GenericBarrier => self.barrier_client(node_id)?,
            service => self
                .client_set(node_id)?
                .connection(service)
                .map_err(|e| node_failure(node_id, e))?,
        };

        finish(node_id, connection.call(request))
    }

    /// Call the current primary
    pub fn call_primary(&self, request: Request) -> Result<Response> {
        if self.context.is_terminating() {
            return Err(Error::ShuttingDown);
        }

        match request.service() {
            ServiceKind::GenericBarrier => {
                let (primary, connection) = self.get_barrier_client_from_context()?;
                finish(&primary, connection.call(request))
            }
            service => {
                let set = self.get_active_client_set()?;
                let connection = set
                    .connection(service)
                    .map_err(|e| node_failure(set.node_id(), e))?;
                finish(set.node_id(), connection.call(request))
            }
        }
    }

    /// Forget a dropped node's clients and barrier seats
    pub fn drop_node_resources(&self, node_id: &str) {
        self.clients.write().remove(node_id);
        self.context.remove_node(node_id);
        tracing::info!("Released resources of node {}", node_id);
    }

    pub fn local_hosting_info(&self) -> NodeHostingInfo {
        NodeHostingInfo {
            node_id: self.node_id.clone(),
            host: self
                .config
                .node(&self.node_id)
                .map(|n| n.host.clone())
                .unwrap_or_default(),
            ports: hosting_ports(&self.services.addresses()),
        }
    }
}

fn finish(node_id: &str, result: Result<Response>) -> Result<Response> {
    result.map_err(|e| node_failure(node_id, e))?.into_result()
}

/// Transport-level errors mean the remote node is gone
fn node_failure(node_id: &str, error: Error) -> Error {
    match error {
        Error::ConnectionFailed { .. }
        | Error::ConnectionTimeout(_)
        | Error::Network(_)
        | Error::Io(_)
        | Error::Serialization(_) => Error::NodeFailed {
            node_id: node_id.to_string(),
            reason: error.to_string(),
        },
        other => other,
    }
}
