//! TCP client for one service on one peer.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, Connection};
use crate::protocol::{Request, Response, ServiceKind};

/// Client connection with a small pool of idle streams.
///
/// Each call takes an idle stream (or dials a new one), so a call blocked
/// on a barrier does not hold up other threads using the same client.
pub struct TcpConnection {
    runtime: Handle,
    service: ServiceKind,
    address: String,
    idle: Mutex<Vec<TcpStream>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpConnection {
    /// Dial the peer once so unreachable peers fail here
    pub fn connect(
        runtime: Handle,
        service: ServiceKind,
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let stream = runtime.block_on(dial(address, connect_timeout))?;
        tracing::debug!("{} client connected to {}", service, address);

        Ok(Self {
            runtime,
            service,
            address: address.to_string(),
            idle: Mutex::new(vec![stream]),
            connect_timeout,
            request_timeout,
        })
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let pooled = self.idle.lock().pop();
        let mut stream = match pooled {
            Some(stream) => stream,
            None => dial(&self.address, self.connect_timeout).await?,
        };

        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, request).await?;
        let response: Response = read_frame(&mut reader).await?;

        // Only streams that completed a round trip go back to the pool
        self.idle.lock().push(stream);
        Ok(response)
    }
}

impl Connection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn call(&self, request: Request) -> Result<Response> {
        let result = self
            .runtime
            .block_on(async { timeout(self.request_timeout, self.round_trip(&request)).await });

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::debug!(
                    "{} call {} to {} failed: {}",
                    self.service,
                    request.type_name(),
                    self.address,
                    e
                );
                Err(match e {
                    Error::Io(io) => Error::ConnectionFailed {
                        address: self.address.clone(),
                        reason: io.to_string(),
                    },
                    other => other,
                })
            }
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }
}

/// Connect to an address
async fn dial(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
    }
}
