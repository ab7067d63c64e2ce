//! TCP transport
//!
//! Owns a tokio runtime for sockets. Handlers run on the blocking pool
//! since most of them wait on barriers or readiness signals; callers are
//! plain threads that block on the runtime handle.

mod client;
mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use super::{Connection, RequestHandler, ServerHandle, Transport};
use crate::error::{Error, Result};
use crate::protocol::ServiceKind;

pub use client::TcpConnection;
pub use server::TcpServer;

/// Transport over tokio TCP sockets
pub struct TcpTransport {
    runtime: Option<Runtime>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("wolfsync-net")
            .build()?;

        Ok(Self {
            runtime: Some(runtime),
            connect_timeout,
            request_timeout,
        })
    }

    fn handle(&self) -> Result<tokio::runtime::Handle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or(Error::ShuttingDown)
    }
}

impl Transport for TcpTransport {
    fn start_server(
        &self,
        service: ServiceKind,
        address: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Box<dyn ServerHandle>> {
        let server = TcpServer::bind(self.handle()?, service, address, handler)?;
        Ok(Box::new(server))
    }

    fn connect(&self, service: ServiceKind, address: &str) -> Result<Arc<dyn Connection>> {
        let connection = TcpConnection::connect(
            self.handle()?,
            service,
            address,
            self.connect_timeout,
            self.request_timeout,
        )?;
        Ok(Arc::new(connection))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};

    fn transport() -> TcpTransport {
        TcpTransport::new(Duration::from_millis(500), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_request_response() {
        let transport = transport();
        let handler: Arc<dyn RequestHandler> = Arc::new(|request: Request| match request {
            Request::IsBarrierAvailable { barrier_id } => Response::Bool(barrier_id == "open"),
            _ => Response::not_allowed("unexpected"),
        });

        let server = transport
            .start_server(ServiceKind::GenericBarrier, "127.0.0.1:0", handler)
            .unwrap();
        let connection = transport
            .connect(ServiceKind::GenericBarrier, server.address())
            .unwrap();

        for (id, expected) in [("open", true), ("closed", false)] {
            let response = connection
                .call(Request::IsBarrierAvailable { barrier_id: id.into() })
                .unwrap();
            assert!(matches!(response, Response::Bool(value) if value == expected));
        }

        server.stop();
    }

    #[test]
    fn test_oversized_request_rejected_locally() {
        let transport = transport();
        let handler: Arc<dyn RequestHandler> = Arc::new(|_: Request| Response::Ok);

        let server = transport
            .start_server(ServiceKind::GenericBarrier, "127.0.0.1:0", handler)
            .unwrap();
        let connection = transport
            .connect(ServiceKind::GenericBarrier, server.address())
            .unwrap();

        let result = connection.call(Request::SyncOnBarrierWithData {
            barrier_id: "Assets".into(),
            caller_id: "loader".into(),
            data: vec![0u8; crate::protocol::FrameHeader::MAX_LENGTH as usize + 1],
        });
        assert!(matches!(result, Err(Error::MessageTooLarge { .. })));

        // The server never saw the request and keeps serving
        let response = connection
            .call(Request::IsBarrierAvailable { barrier_id: "open".into() })
            .unwrap();
        assert!(matches!(response, Response::Ok));

        server.stop();
    }

    #[test]
    fn test_connect_refused() {
        let transport = transport();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = transport.connect(ServiceKind::ClusterSync, &address);
        assert!(result.is_err());
        assert!(result.err().map(|e| e.is_retryable()).unwrap_or(false));
    }

    #[test]
    fn test_bind_conflict() {
        let transport = transport();
        let handler: Arc<dyn RequestHandler> = Arc::new(|_: Request| Response::Ok);

        let first = transport
            .start_server(ServiceKind::RenderSync, "127.0.0.1:0", Arc::clone(&handler))
            .unwrap();
        let second = transport.start_server(ServiceKind::RenderSync, first.address(), handler);
        assert!(second.is_err());
    }
}
