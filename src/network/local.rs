//! In-process transport.
//!
//! Every node of a single-process cluster shares one `LocalNetwork`; a
//! server is a handler registered under its address, and a call runs the
//! handler on the caller's thread. Severing a host makes every call to or
//! from it fail, which is how tests crash a node.
//!
//! A transport built with `transport_with_timeout` runs each handler on its
//! own thread and gives up after the request timeout, the same way a TCP
//! client does.

use std::collections::{HashMap, HashSet};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use super::{address_host, Connection, RequestHandler, ServerHandle, Transport};
use crate::error::{Error, Result};
use crate::protocol::{Request, Response, ServiceKind};

#[derive(Default)]
struct NetworkState {
    /// address -> handler
    servers: HashMap<String, Arc<dyn RequestHandler>>,
    severed: HashSet<String>,
}

/// Shared in-process hub
#[derive(Default)]
pub struct LocalNetwork {
    state: RwLock<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node living on `host`
    pub fn transport(self: &Arc<Self>, host: &str) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            host: host.to_string(),
            request_timeout: None,
        }
    }

    /// Transport whose calls fail with a timeout after `request_timeout`
    pub fn transport_with_timeout(
        self: &Arc<Self>,
        host: &str,
        request_timeout: Duration,
    ) -> LocalTransport {
        LocalTransport {
            request_timeout: Some(request_timeout),
            ..self.transport(host)
        }
    }

    /// Cut a host off the network
    pub fn sever_host(&self, host: &str) {
        tracing::info!("Severing host {}", host);
        self.state.write().severed.insert(host.to_string());
    }

    pub fn restore_host(&self, host: &str) {
        self.state.write().severed.remove(host);
    }

    pub fn is_severed(&self, host: &str) -> bool {
        self.state.read().severed.contains(host)
    }

    pub fn server_count(&self) -> usize {
        self.state.read().servers.len()
    }

    fn route(&self, from_host: &str, address: &str) -> Result<Arc<dyn RequestHandler>> {
        let state = self.state.read();
        let unreachable = |reason: &str| Error::ConnectionFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if state.severed.contains(from_host) || state.severed.contains(address_host(address)) {
            return Err(unreachable("host unreachable"));
        }

        state
            .servers
            .get(address)
            .cloned()
            .ok_or_else(|| unreachable("connection refused"))
    }
}

/// One node's view of a `LocalNetwork`
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    host: String,
    request_timeout: Option<Duration>,
}

impl Transport for LocalTransport {
    fn start_server(
        &self,
        service: ServiceKind,
        address: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Box<dyn ServerHandle>> {
        let mut state = self.network.state.write();

        if state.servers.contains_key(address) {
            return Err(Error::Network(format!("address {} already in use", address)));
        }
        state.servers.insert(address.to_string(), handler);

        tracing::debug!("{} server registered at {}", service, address);

        Ok(Box::new(LocalServer {
            network: Arc::clone(&self.network),
            address: address.to_string(),
        }))
    }

    fn connect(&self, service: ServiceKind, address: &str) -> Result<Arc<dyn Connection>> {
        self.network.route(&self.host, address)?;

        Ok(Arc::new(LocalConnection {
            network: Arc::clone(&self.network),
            from_host: self.host.clone(),
            service,
            address: address.to_string(),
            request_timeout: self.request_timeout,
        }))
    }
}

struct LocalServer {
    network: Arc<LocalNetwork>,
    address: String,
}

impl ServerHandle for LocalServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn stop(&self) {
        self.network.state.write().servers.remove(&self.address);
    }
}

impl Drop for LocalServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LocalConnection {
    network: Arc<LocalNetwork>,
    from_host: String,
    service: ServiceKind,
    address: String,
    request_timeout: Option<Duration>,
}

impl LocalConnection {
    fn handle_with_timeout(
        &self,
        handler: Arc<dyn RequestHandler>,
        request: Request,
        request_timeout: Duration,
    ) -> Result<Response> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("local-{}", self.service))
            .spawn(move || {
                // The caller may have given up already
                let _ = tx.send(handler.handle(request));
            })?;

        rx.recv_timeout(request_timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => Error::ConnectionTimeout(self.address.clone()),
            mpsc::RecvTimeoutError::Disconnected => Error::ConnectionFailed {
                address: self.address.clone(),
                reason: "handler panicked".to_string(),
            },
        })
    }
}

impl Connection for LocalConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn call(&self, request: Request) -> Result<Response> {
        let handler = self.network.route(&self.from_host, &self.address)?;
        tracing::trace!("{} {} -> {}", self.service, request.type_name(), self.address);

        let response = match self.request_timeout {
            Some(request_timeout) => {
                self.handle_with_timeout(handler, request, request_timeout)?
            }
            None => handler.handle(request),
        };

        // A peer that crashed while serving the call never answered
        if self.network.is_severed(address_host(&self.address)) {
            return Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: "peer lost during call".to_string(),
            });
        }

        Ok(response)
    }
}
