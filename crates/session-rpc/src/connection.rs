//! Connections: one transport carrying many sessions.
//!
//! A [`Connection`] owns the transport and runs two tasks: an inbound loop that
//! decodes frames and routes them to sessions, and an outbound writer that
//! drains a queue of encoded frames onto the transport. Issuing a call never
//! awaits the transport; it encodes the frame and enqueues it.
//!
//! Sessions opened from this side live in `sessions`. Sessions the peer opened
//! on a root hosted here live in `hosted`, each served by its own task that
//! dispatches calls one at a time in arrival order.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    Args, CallId, ErrorInfo, ErrorKind, Event, Frame, FrameCodec, MethodSpec, SessionId,
};
use crate::root::{ErasedRootType, RootInstance, RootRegistry, SessionContext};
use crate::session::{Session, SessionShared, SessionState};
use crate::transport::{Transport, TransportError};

/// Identifier of a connection, for logs.
pub type ConnectionId = Uuid;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Tasks not started yet.
    Connecting,
    /// Frames flow in both directions.
    Open,
    /// Teardown in progress.
    Closing,
    /// Gone; every operation fails with [`Error::ConnectionClosed`].
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Connector,
    Acceptor,
}

struct IncomingCall {
    call_id: CallId,
    method: String,
    args: Args,
}

struct HostedSession {
    calls: mpsc::UnboundedSender<IncomingCall>,
    closed: CancellationToken,
}

/// State shared by the connection handle, its tasks and its sessions.
pub(crate) struct Shared {
    id: ConnectionId,
    role: Role,
    config: ConnectionConfig,
    codec: FrameCodec,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    close_reason: Mutex<Option<Error>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    next_session_id: AtomicU64,
    sessions: DashMap<SessionId, Arc<SessionShared>>,
    hosted: DashMap<SessionId, HostedSession>,
    registry: Option<Arc<RootRegistry>>,
    shutdown: CancellationToken,
}

impl Shared {
    pub(crate) const fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.state.read() == ConnectionState::Open
    }

    /// Encode a frame and queue it for the writer.
    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        let message = self.codec.encode(frame)?;
        debug!(
            "Connection {} queueing {} for session {} ({} bytes)",
            self.id,
            frame.kind(),
            frame.session_id(),
            message.len()
        );

        self.outbound
            .send(message)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Forget a locally opened session.
    pub(crate) fn detach(&self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }

    fn is_local(&self, session_id: SessionId) -> bool {
        session_id.is_connector_allocated() == (self.role == Role::Connector)
    }

    fn session(&self, session_id: SessionId) -> Option<Arc<SessionShared>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn open(
        self: &Arc<Self>,
        root_type: Option<String>,
        open_args: Value,
    ) -> Result<Session> {
        let session_id = SessionId(self.next_session_id.fetch_add(2, Ordering::Relaxed));
        let (opened_tx, opened_rx) = oneshot::channel();
        let session = Arc::new(SessionShared::new(
            session_id,
            root_type.clone(),
            self.config.event_buffer,
            opened_tx,
        ));

        self.sessions.insert(session_id, Arc::clone(&session));
        if !self.is_open() {
            self.sessions.remove(&session_id);
            return Err(Error::ConnectionClosed);
        }

        if let Err(e) = self.send_frame(&Frame::SessionOpen {
            session_id,
            root_type: root_type.clone(),
            open_args,
        }) {
            self.sessions.remove(&session_id);
            return Err(e);
        }

        debug!(
            "Connection {} opening session {} ({})",
            self.id,
            session_id,
            root_type.as_deref().unwrap_or("default root")
        );

        let mut abandoned = AbandonedOpen {
            shared: self,
            session: Arc::clone(&session),
            armed: true,
        };
        let outcome = opened_rx.await;
        abandoned.armed = false;

        match outcome {
            Ok(Ok(())) => {
                info!(
                    "Opened session {} on connection {} with {} methods",
                    session_id,
                    self.id,
                    session.method_count()
                );
                Ok(Session::new(session, Arc::clone(self)))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        debug!(
            "Connection {} received {} for session {}",
            self.id,
            frame.kind(),
            frame.session_id()
        );

        match frame {
            Frame::SessionOpen {
                session_id,
                root_type,
                open_args,
            } => self.host(session_id, root_type.as_deref(), open_args),

            Frame::SessionOpenAck {
                session_id,
                methods,
            } => self.handle_open_ack(session_id, methods),

            Frame::SessionOpenError { session_id, reason } => {
                if let Some((_, session)) = self.sessions.remove(&session_id) {
                    info!(
                        "Peer refused session {} on connection {}: {}",
                        session_id, self.id, reason
                    );
                    session.terminate(Error::SessionOpen(reason), &Error::SessionClosed);
                } else {
                    warn!(
                        "Open error for unknown session {} on connection {}",
                        session_id, self.id
                    );
                }
            }

            Frame::SessionClose { session_id } => self.handle_close(session_id),

            Frame::Call {
                session_id,
                call_id,
                method,
                args,
            } => self.handle_call(session_id, IncomingCall {
                call_id,
                method,
                args,
            }),

            Frame::Reply {
                session_id,
                call_id,
                value,
            } => match self.session(session_id) {
                Some(session) => {
                    session.calls().resolve(call_id, value);
                }
                None => debug!(
                    "Discarding reply to {} for closed session {}",
                    call_id, session_id
                ),
            },

            Frame::CallError {
                session_id,
                call_id,
                error,
            } => match self.session(session_id) {
                Some(session) => {
                    session.calls().reject(call_id, Error::from_info(error));
                }
                None => debug!(
                    "Discarding error for {} on closed session {}",
                    call_id, session_id
                ),
            },

            Frame::Event {
                session_id,
                name,
                payload,
            } => match self.session(session_id) {
                Some(session) => session.push_event(Event { name, payload }),
                None => debug!("Dropping event {} for closed session {}", name, session_id),
            },
        }
    }

    fn handle_open_ack(&self, session_id: SessionId, methods: Vec<MethodSpec>) {
        let Some(session) = self.session(session_id) else {
            warn!(
                "Open ack for unknown session {} on connection {}",
                session_id, self.id
            );
            return;
        };

        if session.state() != SessionState::Opening {
            warn!(
                "Duplicate open ack for session {} on connection {}",
                session_id, self.id
            );
            return;
        }

        if !session.mark_open(methods) {
            debug!(
                "Opener of session {} went away, closing it",
                session_id
            );
            self.sessions.remove(&session_id);
            session.terminate(Error::SessionClosed, &Error::CallCancelled);
            let _ = self.send_frame(&Frame::SessionClose { session_id });
        }
    }

    fn handle_close(&self, session_id: SessionId) {
        if self.is_local(session_id) {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                info!(
                    "Peer closed session {} on connection {}",
                    session_id, self.id
                );
                session.terminate(Error::SessionClosed, &Error::CallCancelled);
            }
        } else if let Some((_, hosted)) = self.hosted.remove(&session_id) {
            info!(
                "Peer closed hosted session {} on connection {}",
                session_id, self.id
            );
            hosted.closed.cancel();
        } else {
            debug!("Close for unknown session {}", session_id);
        }
    }

    fn handle_call(&self, session_id: SessionId, call: IncomingCall) {
        let call_id = call.call_id;
        let delivered = self
            .hosted
            .get(&session_id)
            .is_some_and(|hosted| hosted.calls.send(call).is_ok());

        if !delivered {
            debug!(
                "Call {} for session {} that is not hosted here",
                call_id, session_id
            );
            let _ = self.send_frame(&Frame::CallError {
                session_id,
                call_id,
                error: Error::SessionClosed.to_info(),
            });
        }
    }

    /// Accept a session the peer is opening.
    ///
    /// The root is built on the session's own task, so a slow factory does not
    /// hold up frames for other sessions.
    fn host(self: &Arc<Self>, session_id: SessionId, root_type: Option<&str>, open_args: Value) {
        let Some(registry) = &self.registry else {
            return self.refuse(
                session_id,
                ErrorInfo::new(ErrorKind::UnknownRootType, "this peer hosts no root types"),
            );
        };

        if self.is_local(session_id) || self.hosted.contains_key(&session_id) {
            return self.refuse(
                session_id,
                ErrorInfo::new(
                    ErrorKind::InvalidSession,
                    format!("session id {session_id} is not available to the peer"),
                ),
            );
        }

        let root = match registry.resolve(root_type) {
            Ok(root) => root,
            Err(reason) => return self.refuse(session_id, reason),
        };

        let closed = self.shutdown.child_token();
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        self.hosted.insert(
            session_id,
            HostedSession {
                calls: calls_tx,
                closed: closed.clone(),
            },
        );

        tokio::spawn(serve_session(
            Arc::clone(self),
            session_id,
            root,
            open_args,
            calls_rx,
            closed,
        ));
    }

    fn refuse(&self, session_id: SessionId, reason: ErrorInfo) {
        warn!(
            "Refusing session {} on connection {}: {}",
            session_id, self.id, reason
        );
        let _ = self.send_frame(&Frame::SessionOpenError { session_id, reason });
    }

    /// Close the connection and everything on it. Only the first reason counts.
    fn teardown(&self, reason: Error) {
        {
            let mut state = self.state.write();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }

        match &reason {
            Error::ConnectionClosed => info!("Connection {} closed", self.id),
            other => error!("Connection {} failed: {}", self.id, other),
        }
        *self.close_reason.lock() = Some(reason);
        self.shutdown.cancel();

        let sessions: Vec<Arc<SessionShared>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        for session in sessions {
            session.terminate(Error::ConnectionClosed, &Error::ConnectionClosed);
        }

        for entry in &self.hosted {
            entry.value().closed.cancel();
        }
        self.hosted.clear();

        *self.state.write() = ConnectionState::Closed;
    }
}

/// Releases a session whose opener stopped waiting for the peer's answer.
struct AbandonedOpen<'a> {
    shared: &'a Shared,
    session: Arc<SessionShared>,
    armed: bool,
}

impl Drop for AbandonedOpen<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let session_id = self.session.id();
        if self.shared.sessions.remove(&session_id).is_some() {
            debug!(
                "Open of session {} on connection {} abandoned",
                session_id, self.shared.id
            );
            self.session
                .terminate(Error::SessionClosed, &Error::CallCancelled);
            // The peer may still host the root once the open reaches it.
            let _ = self.shared.send_frame(&Frame::SessionClose { session_id });
        }
    }
}

/// Build the root of one hosted session, then dispatch its calls in arrival
/// order.
async fn serve_session(
    shared: Arc<Shared>,
    session_id: SessionId,
    root: Arc<dyn ErasedRootType>,
    open_args: Value,
    mut calls: mpsc::UnboundedReceiver<IncomingCall>,
    closed: CancellationToken,
) {
    let ctx = SessionContext::new(session_id, Arc::downgrade(&shared), closed.clone());
    let contract = root.contract();
    let name = root.name().to_string();

    let mut instance = match root.instantiate(ctx, open_args) {
        Ok(instance) => instance,
        Err(reason) => {
            shared.hosted.remove(&session_id);
            shared.refuse(session_id, reason);
            return;
        }
    };

    // Closed by the peer or the connection while the root was being built.
    if closed.is_cancelled() {
        debug!("Hosted session {} closed before it opened", session_id);
        return;
    }

    if let Err(e) = shared.send_frame(&Frame::SessionOpenAck {
        session_id,
        methods: contract,
    }) {
        warn!("Failed to acknowledge session {}: {}", session_id, e);
        shared.hosted.remove(&session_id);
        closed.cancel();
        return;
    }

    info!(
        "Hosting {} on session {} of connection {}",
        name, session_id, shared.id
    );

    loop {
        let call = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            call = calls.recv() => match call {
                Some(call) => call,
                None => break,
            },
        };

        let IncomingCall {
            call_id,
            method,
            args,
        } = call;

        let outcome = tokio::select! {
            () = closed.cancelled() => break,
            outcome = instance.dispatch(&method, args) => outcome,
        };

        let frame = match outcome {
            Ok(value) => Frame::Reply {
                session_id,
                call_id,
                value,
            },
            Err(e) => {
                debug!("Call {} ({}) on session {} failed: {}", call_id, method, session_id, e);
                Frame::CallError {
                    session_id,
                    call_id,
                    error: e.to_info(),
                }
            }
        };

        match shared.send_frame(&frame) {
            Ok(()) => {}
            Err(Error::Serialization(message)) => {
                warn!("Reply to {} on session {} not sendable: {}", call_id, session_id, message);
                let _ = shared.send_frame(&Frame::CallError {
                    session_id,
                    call_id,
                    error: ErrorInfo::new(ErrorKind::Serialization, message),
                });
            }
            Err(_) => break,
        }
    }

    debug!("Hosted session {} finished", session_id);
}

async fn read_loop(shared: Arc<Shared>) {
    let reason = loop {
        let message = tokio::select! {
            () = shared.shutdown.cancelled() => return,
            message = shared.transport.recv() => message,
        };

        match message {
            Ok(message) => match shared.codec.decode(&message) {
                Ok(frame) => shared.route(frame),
                Err(e) => break e,
            },
            Err(TransportError::ConnectionClosed) => {
                debug!("Transport of connection {} ended", shared.id);
                break Error::ConnectionClosed;
            }
            Err(e) => break Error::Transport(e),
        }
    };

    shared.teardown(reason);
}

async fn write_loop(shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
    loop {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = shared.transport.send(message).await {
                    shared.teardown(Error::Transport(e));
                    break;
                }
            }
            () = shared.shutdown.cancelled() => {
                // Flush frames queued before the close, such as session closes.
                while let Ok(message) = outbound.try_recv() {
                    if shared.transport.send(message).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = shared.transport.close().await {
        debug!("Closing transport of connection {} failed: {}", shared.id, e);
    }
}

/// One connection to a peer.
///
/// Must be created inside a tokio runtime. Dropping the handle closes the
/// connection.
pub struct Connection {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Start a connection as the connecting peer.
    pub fn connect<T: Transport>(transport: T, config: ConnectionConfig) -> Self {
        Self::start(transport, Role::Connector, None, config)
    }

    /// Start a connection as the connecting peer that also hosts roots.
    pub fn connect_with_registry<T: Transport>(
        transport: T,
        registry: Arc<RootRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        Self::start(transport, Role::Connector, Some(registry), config)
    }

    /// Start a connection as the accepting peer, hosting roots from `registry`.
    pub fn accept<T: Transport>(
        transport: T,
        registry: Arc<RootRegistry>,
        config: ConnectionConfig,
    ) -> Self {
        Self::start(transport, Role::Acceptor, Some(registry), config)
    }

    fn start<T: Transport>(
        transport: T,
        role: Role,
        registry: Option<Arc<RootRegistry>>,
        config: ConnectionConfig,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let first_session_id = match role {
            Role::Connector => 1,
            Role::Acceptor => 2,
        };

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            role,
            codec: config.codec(),
            config,
            transport: Arc::new(transport),
            state: RwLock::new(ConnectionState::Connecting),
            close_reason: Mutex::new(None),
            outbound: outbound_tx,
            next_session_id: AtomicU64::new(first_session_id),
            sessions: DashMap::new(),
            hosted: DashMap::new(),
            registry,
            shutdown: CancellationToken::new(),
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&shared)));
        let writer = tokio::spawn(write_loop(Arc::clone(&shared), outbound_rx));
        *shared.state.write() = ConnectionState::Open;

        info!(
            "Connection {} open as {:?} ({} frames)",
            shared.id,
            role,
            shared.codec.format()
        );

        Self {
            shared,
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Why the connection closed, once it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<Error> {
        self.shared.close_reason.lock().clone()
    }

    /// Number of sessions opened from this side.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Number of sessions the peer opened on roots hosted here.
    #[must_use]
    pub fn hosted_session_count(&self) -> usize {
        self.shared.hosted.len()
    }

    /// Open a session on the peer's root type `root_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionOpen`] if the peer refused, for example because
    /// the type is unknown or its factory failed, and
    /// [`Error::ConnectionClosed`] if the connection is gone.
    #[instrument(skip(self, open_args), fields(connection = %self.shared.id))]
    pub async fn open_session(&self, root_type: &str, open_args: Value) -> Result<Session> {
        self.shared
            .open(Some(root_type.to_string()), open_args)
            .await
    }

    /// Open a session on the peer's default root type.
    ///
    /// # Errors
    ///
    /// Same as [`open_session`](Connection::open_session).
    #[instrument(skip(self), fields(connection = %self.shared.id))]
    pub async fn open_default_session(&self) -> Result<Session> {
        self.shared.open(None, Value::Null).await
    }

    /// Close the connection and wait until queued frames are flushed.
    ///
    /// Pending calls on every session fail with [`Error::ConnectionClosed`].
    pub async fn close(&self) {
        self.shared.teardown(Error::ConnectionClosed);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Wait until the connection is closed, by either side.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.teardown(Error::ConnectionClosed);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("sessions", &self.shared.sessions.len())
            .field("hosted", &self.shared.hosted.len())
            .finish_non_exhaustive()
    }
}
