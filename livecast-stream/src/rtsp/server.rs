use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{RtspCodec, RtspError};
use super::session::RtspSession;

/// Default max concurrent control connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Accepts control connections, one task and one session per connection
pub struct RtspServer {
    address: String,
    max_connections: usize,
    shutdown_token: CancellationToken,
}

impl RtspServer {
    #[must_use]
    pub fn new(address: String, max_connections: usize) -> Self {
        Self {
            address,
            max_connections: if max_connections == 0 {
                DEFAULT_MAX_CONNECTIONS
            } else {
                max_connections
            },
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and every open connection
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(&self) -> std::io::Result<()> {
        let socket_addr: SocketAddr = self.address.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid address '{}': {}", self.address, e),
            )
        })?;
        let listener = TcpListener::bind(socket_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let active_connections = Arc::new(AtomicUsize::new(0));
        info!(
            "RTSP server listening on rtsp://{} (max_connections: {})",
            listener.local_addr()?,
            self.max_connections
        );

        loop {
            let (stream, remote_addr) = tokio::select! {
                () = self.shutdown_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("RTSP accept failed: {}", e);
                        continue;
                    }
                },
            };

            let current = active_connections.load(Ordering::Relaxed);
            if current >= self.max_connections {
                warn!(
                    "RTSP connection rejected from {}: at capacity ({}/{})",
                    remote_addr, current, self.max_connections
                );
                drop(stream);
                continue;
            }

            active_connections.fetch_add(1, Ordering::Relaxed);
            let conn_counter = active_connections.clone();
            let cancel = self.shutdown_token.child_token();

            tokio::spawn(async move {
                let mut session = RtspSession::new();
                info!(session = %session.id(), peer = %remote_addr, "RTSP client connected");

                if let Err(e) = handle_connection(stream, &mut session, cancel).await {
                    warn!(session = %session.id(), "RTSP connection error: {}", e);
                }

                info!(
                    session = %session.id(),
                    state = ?session.state(),
                    "RTSP client disconnected"
                );
                conn_counter.fetch_sub(1, Ordering::Relaxed);
            });
        }

        info!("RTSP server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    session: &mut RtspSession,
    cancel: CancellationToken,
) -> Result<(), RtspError> {
    let mut framed = Framed::new(stream, RtspCodec);

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = framed.next() => match next {
                Some(message) => message?,
                None => return Ok(()),
            },
        };

        let response = session.handle(&message);
        debug!(session = %session.id(), status = response.status, "Sending response");
        framed.send(response).await?;
    }
}
