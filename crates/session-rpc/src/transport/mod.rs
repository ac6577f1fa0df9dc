//! Transport abstraction for the RPC runtime.
//!
//! A transport is one physical, message-oriented, order-preserving,
//! bidirectional channel. The runtime only needs to send and receive whole
//! messages and to be told when the channel is gone. Concrete transports (web
//! sockets, in-memory pipes) live in their own modules or crates.

pub mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport-level errors.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The channel is closed; no more messages will arrive.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Could not establish the channel.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The address could not be used.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// A message channel to one remote peer.
///
/// `send` and `recv` may be called concurrently from different tasks. `recv`
/// returns [`TransportError::ConnectionClosed`] once the channel has ended.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Send one message.
    async fn send(&self, message: Bytes) -> Result<(), TransportError>;

    /// Receive the next message.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Close the channel. Pending and future `recv` calls on both ends fail.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        (**self).send(message).await
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        (**self).recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

/// Source of incoming transports for a server.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next incoming transport.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the listener will
    /// produce no more transports.
    async fn accept(&self) -> Result<Box<dyn Transport>, TransportError>;
}
