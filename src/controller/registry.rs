//! Live services of a node, by service name.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::clients::RetryPolicy;
use super::services::{ServerContext, ServiceHandler};
use crate::network::{ServerHandle, Transport};
use crate::protocol::ServiceKind;

struct RunningService {
    kind: ServiceKind,
    handle: Box<dyn ServerHandle>,
}

/// Name -> running service, so other subsystems can find a live service
/// without knowing how it was started
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<BTreeMap<&'static str, RunningService>>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, kind: ServiceKind, handle: Box<dyn ServerHandle>) {
        let previous = self
            .services
            .write()
            .insert(kind.name(), RunningService { kind, handle });
        if let Some(previous) = previous {
            previous.handle.stop();
        }
    }

    /// Bound address of a service
    pub fn address(&self, name: &str) -> Option<String> {
        self.services
            .read()
            .get(name)
            .map(|service| service.handle.address().to_string())
    }

    pub fn kinds(&self) -> Vec<ServiceKind> {
        self.services.read().values().map(|s| s.kind).collect()
    }

    pub fn addresses(&self) -> BTreeMap<&'static str, String> {
        self.services
            .read()
            .iter()
            .map(|(name, service)| (*name, service.handle.address().to_string()))
            .collect()
    }

    pub fn stop_all(&self) {
        let services = std::mem::take(&mut *self.services.write());
        for (name, service) in services {
            service.handle.stop();
            tracing::debug!("{} service stopped", name);
        }
    }
}

/// Start a server with bind retries. Failure is reported as `false`.
pub fn start_server_with_logs(
    transport: &Arc<dyn Transport>,
    registry: &ServiceRegistry,
    context: &Arc<ServerContext>,
    kind: ServiceKind,
    address: &str,
    policy: RetryPolicy,
) -> bool {
    let result = policy.run(&format!("{} server on {}", kind, address), || {
        let handler = Arc::new(ServiceHandler::new(kind, Arc::clone(context)));
        transport.start_server(kind, address, handler)
    });

    match result {
        Ok(handle) => {
            tracing::info!("{} server started on {}", kind, handle.address());
            registry.insert(kind, handle);
            true
        }
        Err(e) => {
            tracing::error!(
                "Failed to start {} server on {} after {} attempt(s): {}",
                kind,
                address,
                policy.attempts,
                e
            );
            false
        }
    }
}
