//! Per-node client sets.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::{Connection, Transport};
use crate::protocol::ServiceKind;

/// Connection retry policy for clients
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn for_clients(config: &ClusterConfig) -> Self {
        Self {
            attempts: config.network.connect_retries.max(1),
            delay: config.connect_retry_delay(),
        }
    }

    pub fn for_servers(config: &ClusterConfig) -> Self {
        Self {
            attempts: config.network.bind_retries.max(1),
            delay: config.bind_retry_delay(),
        }
    }

    /// Run `op` until it succeeds or attempts run out
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::debug!("{} attempt {}/{} failed: {}", what, attempt, self.attempts, e);
                    last_error = Some(e);
                    if attempt < self.attempts {
                        std::thread::sleep(self.delay);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Network(format!("{}: no attempts made", what))))
    }
}

/// Clients this node holds for one cluster node
///
/// ClusterSync is driven from the game thread and RenderSync from the
/// render thread. Event and internal clients may be used from any thread.
/// Event servers are external and may start late, so those clients
/// connect on first use.
pub struct ClientSet {
    node_id: String,
    cluster_sync: Arc<dyn Connection>,
    render_sync: Arc<dyn Connection>,
    internal_comm: Arc<dyn Connection>,
    events_json: Mutex<Option<Arc<dyn Connection>>>,
    events_binary: Mutex<Option<Arc<dyn Connection>>>,
    transport: Arc<dyn Transport>,
    config: Arc<ClusterConfig>,
}

impl ClientSet {
    /// Connect the internal services of `node_id`
    pub fn connect(
        transport: Arc<dyn Transport>,
        config: Arc<ClusterConfig>,
        node_id: &str,
    ) -> Result<Self> {
        let open = |service: ServiceKind| -> Result<Arc<dyn Connection>> {
            let address = config
                .service_address(node_id, service)
                .ok_or_else(|| Error::UnknownNode(node_id.to_string()))?;
            transport.connect(service, &address)
        };

        Ok(Self {
            node_id: node_id.to_string(),
            cluster_sync: open(ServiceKind::ClusterSync)?,
            render_sync: open(ServiceKind::RenderSync)?,
            internal_comm: open(ServiceKind::InternalComm)?,
            events_json: Mutex::new(None),
            events_binary: Mutex::new(None),
            transport,
            config,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Connection for a service. GenericBarrier has no long-lived client.
    pub fn connection(&self, service: ServiceKind) -> Result<Arc<dyn Connection>> {
        match service {
            ServiceKind::ClusterSync => Ok(Arc::clone(&self.cluster_sync)),
            ServiceKind::RenderSync => Ok(Arc::clone(&self.render_sync)),
            ServiceKind::InternalComm => Ok(Arc::clone(&self.internal_comm)),
            ServiceKind::EventsJson => self.lazy(&self.events_json, service),
            ServiceKind::EventsBinary => self.lazy(&self.events_binary, service),
            ServiceKind::GenericBarrier => Err(Error::Internal(
                "generic barrier calls use a per-call client".to_string(),
            )),
        }
    }

    fn lazy(
        &self,
        slot: &Mutex<Option<Arc<dyn Connection>>>,
        service: ServiceKind,
    ) -> Result<Arc<dyn Connection>> {
        let mut slot = slot.lock();
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }

        let address = self
            .config
            .service_address(&self.node_id, service)
            .ok_or_else(|| Error::UnknownNode(self.node_id.clone()))?;
        let connection = RetryPolicy::for_clients(&self.config).run(
            &format!("{} client to {}", service, address),
            || self.transport.connect(service, &address),
        )?;

        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }
}
