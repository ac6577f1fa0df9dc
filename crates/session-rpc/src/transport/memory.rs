//! In-memory transport, used for tests and in-process peers.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{Listener, Transport, TransportError};

/// Create a connected pair of in-memory transports.
///
/// Messages sent on one end arrive on the other in order. Closing either end
/// closes both, after any messages already queued have been received.
#[must_use]
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (left_tx, left_rx) = flume::unbounded();
    let (right_tx, right_rx) = flume::unbounded();
    let id = Uuid::new_v4();
    let closed = CancellationToken::new();

    let left = MemoryTransport {
        id,
        sender: left_tx,
        receiver: right_rx,
        closed: closed.clone(),
    };
    let right = MemoryTransport {
        id,
        sender: right_tx,
        receiver: left_rx,
        closed,
    };

    (left, right)
}

/// One end of an in-memory message pipe.
pub struct MemoryTransport {
    id: Uuid,
    sender: flume::Sender<Bytes>,
    receiver: flume::Receiver<Bytes>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Identifier shared by both ends of the pipe.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns true once either end has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        debug!("Memory transport {} sending {} bytes", self.id, message.len());

        self.sender
            .send_async(message)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        tokio::select! {
            biased;
            message = self.receiver.recv_async() => {
                message.map_err(|_| TransportError::ConnectionClosed)
            }
            () = self.closed.cancelled() => {
                // Hand out whatever the peer queued before closing.
                self.receiver
                    .try_recv()
                    .map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("Closing memory transport {}", self.id);
        self.closed.cancel();
        Ok(())
    }
}

/// Listener handing out the server ends of in-memory pipes.
#[derive(Clone)]
pub struct MemoryListener {
    incoming_tx: flume::Sender<MemoryTransport>,
    incoming_rx: flume::Receiver<MemoryTransport>,
}

impl MemoryListener {
    /// Create a new listener.
    #[must_use]
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        Self {
            incoming_tx,
            incoming_rx,
        }
    }

    /// Connect to this listener, returning the client end of a new pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if every receiving side of the listener is gone.
    pub fn connect(&self) -> Result<MemoryTransport, TransportError> {
        let (client, server) = pair();
        self.incoming_tx
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed("Listener closed".to_string()))?;
        Ok(client)
    }
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = self
            .incoming_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(Box::new(transport))
    }
}
