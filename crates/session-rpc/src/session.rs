//! Sessions: independent logical channels multiplexed over one connection.
//!
//! A [`Session`] is the opener's handle on one remote root object. It owns the
//! session's call table and the root contract received when the session opened.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::call_table::{CallTable, PendingCall};
use crate::connection::Shared;
use crate::error::{Error, Result};
use crate::protocol::{Args, Event, Frame, MethodSpec, SessionId};

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Open request sent, waiting for the peer's answer.
    Opening,
    /// Calls are accepted.
    Open,
    /// Close in progress.
    Closing,
    /// Gone; calls fail with [`Error::SessionClosed`].
    Closed,
}

/// Opener-side state of a session, shared with the connection's inbound loop.
pub(crate) struct SessionShared {
    id: SessionId,
    root_type: Option<String>,
    state: RwLock<SessionState>,
    calls: Arc<CallTable>,
    contract: OnceLock<Vec<MethodSpec>>,
    opened: Mutex<Option<oneshot::Sender<Result<()>>>>,
    events_tx: Mutex<Option<mpsc::Sender<Event>>>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
}

impl SessionShared {
    pub(crate) fn new(
        id: SessionId,
        root_type: Option<String>,
        event_buffer: usize,
        opened: oneshot::Sender<Result<()>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));

        Self {
            id,
            root_type,
            state: RwLock::new(SessionState::Opening),
            calls: Arc::new(CallTable::new(id)),
            contract: OnceLock::new(),
            opened: Mutex::new(Some(opened)),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    pub(crate) const fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(crate) fn method_count(&self) -> usize {
        self.contract.get().map_or(0, Vec::len)
    }

    pub(crate) fn calls(&self) -> &CallTable {
        &self.calls
    }

    /// Complete the open exchange.
    ///
    /// Returns false if nobody is waiting for the session any more, in which
    /// case the caller should close it.
    pub(crate) fn mark_open(&self, methods: Vec<MethodSpec>) -> bool {
        let Some(waiter) = self.opened.lock().take() else {
            return false;
        };

        let _ = self.contract.set(methods);
        {
            let mut state = self.state.write();
            if *state == SessionState::Opening {
                *state = SessionState::Open;
            }
        }

        waiter.send(Ok(())).is_ok()
    }

    /// End the session without a local close: refused open, peer close or
    /// connection loss. Pending calls and any open waiter fail with `reason`.
    pub(crate) fn terminate(&self, open_error: Error, call_error: &Error) {
        *self.state.write() = SessionState::Closed;

        if let Some(waiter) = self.opened.lock().take() {
            let _ = waiter.send(Err(open_error));
        }

        self.calls.cancel_all(call_error);
        self.events_tx.lock().take();
    }

    pub(crate) fn push_event(&self, event: Event) {
        let guard = self.events_tx.lock();
        let Some(events) = guard.as_ref() else {
            debug!("Dropping event {} for closed session {}", event.name, self.id);
            return;
        };

        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    "Event buffer of session {} is full, dropping event {}",
                    self.id, event.name
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Handle on one open session.
///
/// Dropping the handle closes the session.
pub struct Session {
    shared: Arc<SessionShared>,
    connection: Arc<Shared>,
}

impl Session {
    pub(crate) const fn new(shared: Arc<SessionShared>, connection: Arc<Shared>) -> Self {
        Self { shared, connection }
    }

    /// Session id within its connection.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Root type requested at open, or `None` for the peer's default.
    #[must_use]
    pub fn root_type(&self) -> Option<&str> {
        self.shared.root_type.as_deref()
    }

    /// Methods the remote root exposes.
    #[must_use]
    pub fn methods(&self) -> &[MethodSpec] {
        self.shared.contract.get().map_or(&[], Vec::as_slice)
    }

    /// Look up a method in the remote root's contract.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodNotFound`] if the root does not declare it.
    pub fn contract_method(&self, name: &str) -> Result<&MethodSpec> {
        self.methods()
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::MethodNotFound(name.to_string()))
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.calls.len()
    }

    /// Issue a call and return its pending handle.
    ///
    /// The call is sent whether or not the method is in the contract.
    ///
    /// # Errors
    ///
    /// Fails immediately, without sending, with [`Error::ConnectionClosed`] if
    /// the connection is gone or [`Error::SessionClosed`] if the session is not
    /// open. Fails with a serialization error if the call cannot be encoded.
    pub fn call(&self, method: &str, args: impl Into<Args>) -> Result<PendingCall> {
        if !self.connection.is_open() {
            return Err(Error::ConnectionClosed);
        }
        if self.state() != SessionState::Open {
            return Err(Error::SessionClosed);
        }

        // A close racing with this call may have shut the table already.
        let pending = self.shared.calls.register(method).map_err(|_| {
            if self.connection.is_open() {
                Error::SessionClosed
            } else {
                Error::ConnectionClosed
            }
        })?;
        self.connection.send_frame(&Frame::Call {
            session_id: self.shared.id,
            call_id: pending.call_id(),
            method: method.to_string(),
            args: args.into(),
        })?;

        Ok(pending)
    }

    /// Wait for the next event pushed by the remote root.
    ///
    /// Returns `None` once the session is closed and buffered events are
    /// drained.
    pub async fn next_event(&self) -> Option<Event> {
        self.shared.events_rx.lock().await.recv().await
    }

    /// Close the session.
    ///
    /// Tells the peer, fails pending calls with [`Error::CallCancelled`] and
    /// detaches from the connection. Closing twice is a no-op.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.write();
            match *state {
                SessionState::Closing | SessionState::Closed => return,
                SessionState::Opening | SessionState::Open => *state = SessionState::Closing,
            }
        }

        let id = self.shared.id;
        self.connection.detach(id);
        if self.connection.is_open() {
            let _ = self.connection.send_frame(&Frame::SessionClose { session_id: id });
        }

        let cancelled = self.shared.calls.cancel_all(&Error::CallCancelled);
        self.shared.events_tx.lock().take();
        *self.shared.state.write() = SessionState::Closed;

        info!(
            "Closed session {} on connection {} ({} calls cancelled)",
            id,
            self.connection.id(),
            cancelled
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("root_type", &self.shared.root_type)
            .field("pending_calls", &self.shared.calls.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::Connection;
    use crate::root::{RemoteError, RootRegistry, RootType};
    use crate::transport::memory::pair;
    use serde_json::{Value, json};

    fn registry() -> Arc<RootRegistry> {
        Arc::new(RootRegistry::new().register(
            RootType::new("Echo", |_ctx, _args: Value| Ok(())).method(
                "echo",
                &["value"],
                |_root: &mut (), (value,): (Value,)| Ok::<_, RemoteError>(value),
            ),
        ))
    }

    #[tokio::test]
    async fn test_call_racing_close_reports_session_closed() {
        let (client_end, server_end) = pair();
        let _server = Connection::accept(server_end, registry(), ConnectionConfig::default());
        let client = Connection::connect(client_end, ConnectionConfig::default());
        let session = client.open_default_session().await.unwrap();

        // The table is shut but the state has not moved on yet.
        session.shared.calls.cancel_all(&Error::CallCancelled);
        assert_eq!(session.state(), SessionState::Open);

        assert!(matches!(
            session.call("echo", vec![json!(1)]),
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_call_after_connection_loss() {
        let (client_end, server_end) = pair();
        let server = Connection::accept(server_end, registry(), ConnectionConfig::default());
        let client = Connection::connect(client_end, ConnectionConfig::default());
        let session = client.open_default_session().await.unwrap();

        server.close().await;
        client.closed().await;

        assert!(matches!(
            session.call("echo", vec![json!(1)]),
            Err(Error::ConnectionClosed)
        ));
    }
}
