//! Configuration for connections, servers and the blocking client.

use crate::protocol::codec::{FrameCodec, MAX_MESSAGE_SIZE};
use crate::protocol::WireFormat;

/// Configuration for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Wire format; both peers must agree.
    pub format: WireFormat,
    /// Maximum encoded frame size.
    pub max_message_size: usize,
    /// Events buffered per session before new ones are dropped.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Json,
            max_message_size: MAX_MESSAGE_SIZE, // 10MB
            event_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    /// Set the wire format.
    #[must_use]
    pub const fn format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the per-session event buffer.
    #[must_use]
    pub const fn event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    pub(crate) const fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.format).with_max_message_size(self.max_message_size)
    }
}

/// Configuration for the accept loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Configuration applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the connection limit.
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-connection configuration.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

/// Configuration for the blocking client.
#[derive(Debug, Clone)]
pub struct BlockingConfig {
    /// Worker threads of the runtime driving the connection.
    pub worker_threads: usize,
    /// Configuration of the underlying connection.
    pub connection: ConnectionConfig,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            connection: ConnectionConfig::default(),
        }
    }
}

impl BlockingConfig {
    /// Set the number of runtime worker threads.
    #[must_use]
    pub const fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the connection configuration.
    #[must_use]
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}
