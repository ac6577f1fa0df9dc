//! Accept loop: one [`Connection`] per incoming transport.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::root::RootRegistry;
use crate::transport::{Listener, Transport, TransportError};

/// Serves a root registry to every peer a listener produces.
#[derive(Debug)]
pub struct RpcServer {
    registry: Arc<RootRegistry>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Create a server for `registry`.
    pub fn new(registry: impl Into<Arc<RootRegistry>>, config: ServerConfig) -> Self {
        Self {
            registry: registry.into(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// The registry served to every connection.
    #[must_use]
    pub fn registry(&self) -> &Arc<RootRegistry> {
        &self.registry
    }

    /// Accept transports until the listener ends or [`shutdown`] is called.
    ///
    /// Transports arriving while `max_connections` connections are live are
    /// closed straight away. On shutdown every live connection is closed; when
    /// the listener ends, live connections are left to finish.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept failures are logged and skipped.
    ///
    /// [`shutdown`]: RpcServer::shutdown
    #[instrument(skip_all)]
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let mut connections = JoinSet::new();

        info!(
            "RPC server accepting connections (root types: {:?})",
            self.registry.names()
        );

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }
                accepted = listener.accept() => accepted,
                // Reap finished connections as we go.
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };

            let transport = match accepted {
                Ok(transport) => transport,
                Err(TransportError::ConnectionClosed) => {
                    info!("Listener closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                warn!("Max connections reached, rejecting connection");
                let _ = transport.close().await;
                continue;
            };

            let connection = Connection::accept(
                transport,
                Arc::clone(&self.registry),
                self.config.connection.clone(),
            );
            let shutdown = self.shutdown.clone();

            connections.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    () = connection.closed() => {
                        debug!(
                            "Connection {} ended: {:?}",
                            connection.id(),
                            connection.close_reason()
                        );
                    }
                    () = shutdown.cancelled() => connection.close().await,
                }
            });
        }

        while connections.join_next().await.is_some() {}

        Ok(())
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
