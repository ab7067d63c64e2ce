//! TCP server hosting one service.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, RequestHandler, ServerHandle};
use crate::protocol::{Request, Response, ServiceKind};

/// Network server for one cluster service
pub struct TcpServer {
    service: ServiceKind,
    /// Bound address, with the real port when bound to port 0
    address: String,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl TcpServer {
    /// Bind and start accepting. Bind errors are returned so the caller can
    /// retry.
    pub fn bind(
        runtime: Handle,
        service: ServiceKind,
        bind_address: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let listener = runtime.block_on(TcpListener::bind(bind_address))?;
        let address = listener.local_addr()?.to_string();
        let (shutdown, shutdown_rx) = watch::channel(false);

        tracing::info!("{} server listening on {}", service, address);

        runtime.spawn(accept_loop(listener, service, handler, shutdown_rx));

        Ok(Self {
            service,
            address,
            shutdown,
        })
    }
}

impl ServerHandle for TcpServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
        tracing::debug!("{} server on {} stopped", self.service, self.address);
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: ServiceKind,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let peer_addr = addr.to_string();
                        let handler = Arc::clone(&handler);
                        let shutdown_rx = shutdown_rx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, &peer_addr, handler, shutdown_rx).await {
                                tracing::warn!("{} connection error from {}: {}", service, peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("{} accept error: {}", service, e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Serve requests from one peer until it hangs up or the server stops
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request: Request = tokio::select! {
            result = read_frame(&mut reader) => match result {
                Ok(request) => request,
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            },
            _ = shutdown_rx.changed() => break,
        };

        tracing::trace!("Received {} from {}", request.type_name(), peer_addr);

        let handler = Arc::clone(&handler);
        let response = tokio::task::spawn_blocking(move || handler.handle(request))
            .await
            .unwrap_or_else(|e| Response::failed(format!("handler panicked: {}", e)));

        if *shutdown_rx.borrow() {
            break;
        }

        match write_frame(&mut writer, &response).await {
            Err(Error::MessageTooLarge { size, .. }) => {
                tracing::warn!(
                    "{} response of {} bytes to {} is too large",
                    response.type_name(),
                    size,
                    peer_addr
                );
                let rejected = Response::failed(format!(
                    "{} response of {} bytes exceeds frame limit",
                    response.type_name(),
                    size
                ));
                write_frame(&mut writer, &rejected).await?;
            }
            result => result?,
        }
    }

    Ok(())
}
