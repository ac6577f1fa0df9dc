//! Blocking-mode calls.
//!
//! [`BlockingConnection`] owns a multi-threaded tokio runtime whose workers run
//! the connection's inbound and outbound loops. Calls block the calling thread
//! on the same [`PendingCall`](crate::PendingCall) the async facade awaits.
//! Nothing here may be used from inside an async context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::config::BlockingConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::{Args, Event, MethodSpec, SessionId};
use crate::session::{Session, SessionState};
use crate::transport::Transport;

/// A connection driven by its own runtime.
pub struct BlockingConnection {
    inner: Option<Connection>,
    runtime: Arc<Runtime>,
}

impl BlockingConnection {
    /// Build a runtime, establish a transport on it and start a connection.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the runtime cannot be built, or whatever
    /// `connector` fails with.
    pub fn connect<F, Fut, T>(config: BlockingConfig, connector: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Transport,
    {
        let runtime = build_runtime(&config)?;
        let transport = runtime.block_on(connector())?;
        Ok(Self::start(runtime, transport, config))
    }

    /// Start a connection over an already established transport.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the runtime cannot be built.
    pub fn from_transport<T: Transport>(transport: T, config: BlockingConfig) -> Result<Self> {
        let runtime = build_runtime(&config)?;
        Ok(Self::start(runtime, transport, config))
    }

    fn start<T: Transport>(runtime: Runtime, transport: T, config: BlockingConfig) -> Self {
        let inner = {
            let _guard = runtime.enter();
            Connection::connect(transport, config.connection)
        };

        Self {
            inner: Some(inner),
            runtime: Arc::new(runtime),
        }
    }

    fn connection(&self) -> Result<&Connection> {
        self.inner.as_ref().ok_or(Error::ConnectionClosed)
    }

    /// Connection id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] after [`close`](Self::close).
    pub fn id(&self) -> Result<ConnectionId> {
        Ok(self.connection()?.id())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner
            .as_ref()
            .map_or(ConnectionState::Closed, Connection::state)
    }

    /// Why the connection closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<Error> {
        self.inner.as_ref().and_then(Connection::close_reason)
    }

    /// Number of sessions opened from this side.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Connection::session_count)
    }

    /// Open a session on the peer's root type `root_type`.
    ///
    /// # Errors
    ///
    /// See [`Connection::open_session`].
    pub fn open_session(&self, root_type: &str, open_args: Value) -> Result<BlockingSession> {
        let connection = self.connection()?;
        let session = self
            .runtime
            .block_on(connection.open_session(root_type, open_args))?;
        Ok(self.wrap(session))
    }

    /// Open a session on the peer's default root type.
    ///
    /// # Errors
    ///
    /// See [`Connection::open_default_session`].
    pub fn open_default_session(&self) -> Result<BlockingSession> {
        let connection = self.connection()?;
        let session = self.runtime.block_on(connection.open_default_session())?;
        Ok(self.wrap(session))
    }

    fn wrap(&self, session: Session) -> BlockingSession {
        BlockingSession {
            inner: session,
            runtime: Arc::clone(&self.runtime),
        }
    }

    /// Close the connection, flushing queued frames.
    pub fn close(&mut self) {
        if let Some(connection) = self.inner.take() {
            self.runtime.block_on(connection.close());
            debug!("Blocking connection {} closed", connection.id());
        }
    }
}

impl Drop for BlockingConnection {
    fn drop(&mut self) {
        if Handle::try_current().is_ok() {
            // Cannot block here; the connection still tears down on drop.
            self.inner.take();
        } else {
            self.close();
        }
    }
}

impl std::fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingConnection")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

fn build_runtime(config: &BlockingConfig) -> Result<Runtime> {
    Ok(Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .thread_name("session-rpc-blocking")
        .enable_all()
        .build()?)
}

/// A session whose calls block the calling thread.
///
/// Dropping the handle closes the session.
#[derive(Debug)]
pub struct BlockingSession {
    inner: Session,
    runtime: Arc<Runtime>,
}

impl BlockingSession {
    /// Session id within its connection.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Methods the remote root exposes.
    #[must_use]
    pub fn methods(&self) -> &[MethodSpec] {
        self.inner.methods()
    }

    /// The async session underneath.
    #[must_use]
    pub const fn as_async(&self) -> &Session {
        &self.inner
    }

    /// Look up a callable method in the root contract.
    ///
    /// # Errors
    ///
    /// See [`Session::method`].
    pub fn method(&self, name: &str) -> Result<BlockingRemoteMethod<'_>> {
        let spec = self.inner.contract_method(name)?;
        Ok(BlockingRemoteMethod {
            session: self,
            spec,
        })
    }

    /// Call and block until the result arrives.
    ///
    /// # Errors
    ///
    /// Returns whatever the call failed with.
    pub fn call(&self, method: &str, args: impl Into<Args>) -> Result<Value> {
        let pending = self.inner.call(method, args)?;
        self.runtime.block_on(pending)
    }

    /// Call and decode the result into `T`.
    ///
    /// # Errors
    ///
    /// See [`Session::call_as`].
    pub fn call_as<T: DeserializeOwned>(&self, method: &str, args: impl Into<Args>) -> Result<T> {
        self.runtime.block_on(self.inner.call_as(method, args))
    }

    /// Call with a deadline.
    ///
    /// # Errors
    ///
    /// See [`Session::call_timeout`].
    pub fn call_timeout(
        &self,
        method: &str,
        args: impl Into<Args>,
        timeout: Duration,
    ) -> Result<Value> {
        let pending = self.inner.call(method, args)?;
        self.runtime.block_on(pending.timeout(timeout))
    }

    /// Block until the remote root pushes an event.
    ///
    /// Returns `None` once the session is closed and buffered events are
    /// drained.
    pub fn next_event(&self) -> Option<Event> {
        self.runtime.block_on(self.inner.next_event())
    }

    /// Block until an event arrives or `timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no event arrived in time.
    pub fn next_event_timeout(&self, timeout: Duration) -> Result<Option<Event>> {
        self.runtime
            .block_on(async { tokio::time::timeout(timeout, self.inner.next_event()).await })
            .map_err(|_| Error::Timeout(timeout))
    }

    /// Close the session. Pending calls fail with [`Error::CallCancelled`].
    pub fn close(&self) {
        self.inner.close();
    }
}

/// Blocking counterpart of [`RemoteMethod`](crate::RemoteMethod).
#[derive(Debug, Clone, Copy)]
pub struct BlockingRemoteMethod<'a> {
    session: &'a BlockingSession,
    spec: &'a MethodSpec,
}

impl<'a> BlockingRemoteMethod<'a> {
    /// Method name.
    #[must_use]
    pub fn name(&self) -> &'a str {
        &self.spec.name
    }

    /// Parameter names in declaration order.
    #[must_use]
    pub fn params(&self) -> &'a [String] {
        &self.spec.params
    }

    /// Call and block until the result arrives.
    ///
    /// # Errors
    ///
    /// See [`BlockingSession::call`].
    pub fn call(&self, args: impl Into<Args>) -> Result<Value> {
        self.session.call(&self.spec.name, args)
    }

    /// Call and decode the result into `T`.
    ///
    /// # Errors
    ///
    /// See [`BlockingSession::call_as`].
    pub fn call_as<T: DeserializeOwned>(&self, args: impl Into<Args>) -> Result<T> {
        self.session.call_as(&self.spec.name, args)
    }
}
