//! Session-multiplexed RPC over a single bidirectional connection.
//!
//! A [`Connection`] wraps one message-oriented [`Transport`] (a web socket, an
//! in-memory pipe, ...) and carries any number of independent sessions. Each
//! session binds to one instance of a root object on the remote side, and calls
//! issued on a session are correlated with their replies by call id.
//!
//! The same protocol core backs two calling conventions:
//!
//! - **Async**: [`Session::call`] returns a [`PendingCall`] future that resolves
//!   when the matching reply arrives.
//! - **Blocking**: [`BlockingConnection`] owns a runtime that drives the
//!   connection, and [`BlockingSession::call`] parks the calling thread on the
//!   same [`PendingCall`].
//!
//! # Example
//!
//! ```no_run
//! use proven_session_rpc::{
//!     Args, Connection, ConnectionConfig, RemoteError, RootRegistry, RootType, transport,
//! };
//! use serde_json::json;
//!
//! struct Greeter;
//!
//! # async fn example() -> proven_session_rpc::Result<()> {
//! let registry = RootRegistry::new().register(
//!     RootType::new("Greeter", |_ctx, _args| Ok(Greeter)).method(
//!         "greet",
//!         &["name"],
//!         |_root: &mut Greeter, (name,): (String,)| Ok::<_, RemoteError>(format!("hello {name}")),
//!     ),
//! );
//!
//! let (client_end, server_end) = transport::memory::pair();
//! let _server = Connection::accept(server_end, registry.into(), ConnectionConfig::default());
//! let client = Connection::connect(client_end, ConnectionConfig::default());
//!
//! let session = client.open_session("Greeter", json!(null)).await?;
//! let greeting = session.call("greet", Args::new().arg("duck")?)?.await?;
//! assert_eq!(greeting, json!("hello duck"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod call_table;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod root;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use call_table::{CallTable, PendingCall};
pub use client::{BlockingConnection, BlockingRemoteMethod, BlockingSession, RemoteMethod};
pub use config::{BlockingConfig, ConnectionConfig, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{Error, Result};
pub use protocol::{Args, CallId, ErrorInfo, ErrorKind, Event, Frame, MethodSpec, SessionId};
pub use protocol::codec::{FrameCodec, WireFormat};
pub use root::{MethodResult, RemoteError, RootRegistry, RootType, SessionContext};
pub use server::RpcServer;
pub use session::{Session, SessionState};
pub use transport::{Listener, Transport, TransportError};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use serde_json::Value;
