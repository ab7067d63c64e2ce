//! Network Module
//!
//! Services and clients the node controller runs on top of. A transport
//! knows how to host a request handler at an address and how to open a
//! connection to one; everything above it only sees `Request`/`Response`.

mod local;
mod tcp;

pub use local::{LocalNetwork, LocalTransport};
pub use tcp::TcpTransport;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{FrameHeader, Request, Response, ServiceKind};

/// Answers requests arriving at a server
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request) -> Response;
}

impl<F> RequestHandler for F
where
    F: Fn(Request) -> Response + Send + Sync,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}

/// Client side of a service
pub trait Connection: Send + Sync {
    /// Address the connection points at
    fn address(&self) -> &str;

    /// Send a request and block until the response arrives
    fn call(&self, request: Request) -> Result<Response>;
}

/// A running server
pub trait ServerHandle: Send + Sync {
    fn address(&self) -> &str;

    /// Stop accepting requests
    fn stop(&self);
}

/// Hosts servers and opens connections
pub trait Transport: Send + Sync {
    fn start_server(
        &self,
        service: ServiceKind,
        address: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Box<dyn ServerHandle>>;

    fn connect(&self, service: ServiceKind, address: &str) -> Result<Arc<dyn Connection>>;
}

/// Host part of a `host:port` address
pub fn address_host(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

/// Read a framed message from a reader
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if !header.verify(&body) {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(message)?;
    FrameHeader::check_length(body.len())?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
