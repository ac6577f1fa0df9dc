//! Correlation of outgoing calls with their replies.
//!
//! Every session owns one [`CallTable`]. Registering a call hands out a fresh
//! call id and a [`PendingCall`] future; the inbound loop later resolves or
//! rejects the entry by id. Each entry is completed at most once, whichever of
//! reply, cancellation or abandonment comes first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{CallId, SessionId};

type Completion = oneshot::Sender<Result<Value>>;

struct Entry {
    method: String,
    tx: Completion,
}

struct Inner {
    next_id: u64,
    pending: HashMap<CallId, Entry>,
    closed: Option<Error>,
}

/// Pending calls of one session, keyed by call id.
pub struct CallTable {
    session_id: SessionId,
    inner: Mutex<Inner>,
}

impl CallTable {
    /// Create an empty table for a session. Call ids start at 1.
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Session this table belongs to.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Register a new call and return its pending handle.
    ///
    /// The call id is available through [`PendingCall::call_id`].
    ///
    /// # Errors
    ///
    /// Returns the reason the table was closed with if [`cancel_all`] has
    /// already run.
    ///
    /// [`cancel_all`]: CallTable::cancel_all
    pub fn register(self: &Arc<Self>, method: &str) -> Result<PendingCall> {
        let (tx, rx) = oneshot::channel();

        let call_id = {
            let mut inner = self.inner.lock();
            if let Some(reason) = &inner.closed {
                return Err(reason.clone());
            }

            let call_id = CallId(inner.next_id);
            inner.next_id += 1;
            inner.pending.insert(
                call_id,
                Entry {
                    method: method.to_string(),
                    tx,
                },
            );
            call_id
        };

        debug!("Registered call {} ({}) on session {}", call_id, method, self.session_id);

        Ok(PendingCall {
            call_id,
            session_id: self.session_id,
            rx,
            table: Arc::downgrade(self),
            done: false,
        })
    }

    /// Complete a call with its reply value.
    ///
    /// Returns false if no call with this id is pending.
    pub fn resolve(&self, call_id: CallId, value: Value) -> bool {
        self.complete(call_id, Ok(value))
    }

    /// Complete a call with an error.
    ///
    /// Returns false if no call with this id is pending.
    pub fn reject(&self, call_id: CallId, error: Error) -> bool {
        self.complete(call_id, Err(error))
    }

    fn complete(&self, call_id: CallId, result: Result<Value>) -> bool {
        let entry = self.inner.lock().pending.remove(&call_id);

        match entry {
            Some(entry) => {
                debug!(
                    "Completing call {} ({}) on session {}",
                    call_id, entry.method, self.session_id
                );
                // The caller may have stopped listening; nothing to do then.
                let _ = entry.tx.send(result);
                true
            }
            None => {
                warn!(
                    "Discarding result for unknown call {} on session {}",
                    call_id, self.session_id
                );
                false
            }
        }
    }

    /// Remove a call without completing it.
    ///
    /// Returns false if no call with this id is pending.
    pub fn forget(&self, call_id: CallId) -> bool {
        let removed = self.inner.lock().pending.remove(&call_id).is_some();
        if removed {
            debug!("Forgot call {} on session {}", call_id, self.session_id);
        }
        removed
    }

    /// Fail every pending call with `reason` and close the table.
    ///
    /// Later registrations fail with the same reason. Calling this again keeps
    /// the first reason. Returns the number of calls that were failed.
    pub fn cancel_all(&self, reason: &Error) -> usize {
        let drained: Vec<Entry> = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.clone());
            }
            inner.pending.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        if count > 0 {
            debug!(
                "Cancelling {} pending calls on session {}: {}",
                count, self.session_id, reason
            );
        }

        for entry in drained {
            let _ = entry.tx.send(Err(reason.clone()));
        }

        count
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Returns true if no calls are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// Returns true once [`cancel_all`](CallTable::cancel_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }
}

impl std::fmt::Debug for CallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallTable")
            .field("session_id", &self.session_id)
            .field("pending", &inner.pending.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Handle on one outstanding call.
///
/// Resolves to the reply value or the error the call failed with. Dropping an
/// unresolved handle removes its entry from the table, and a late reply for it
/// is then discarded.
#[must_use = "a pending call does nothing unless awaited or waited on"]
pub struct PendingCall {
    call_id: CallId,
    session_id: SessionId,
    rx: oneshot::Receiver<Result<Value>>,
    table: Weak<CallTable>,
    done: bool,
}

impl PendingCall {
    /// Id of this call within its session.
    pub const fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Session the call was issued on.
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Block the current thread until the call completes.
    ///
    /// Another thread must be driving the connection. Do not call this from
    /// inside an async context.
    ///
    /// # Errors
    ///
    /// Returns whatever error the call failed with.
    pub fn wait(self) -> Result<Value> {
        futures::executor::block_on(self)
    }

    /// Abandon the call. A reply arriving later is discarded.
    pub fn cancel(mut self) {
        self.abandon();
    }

    /// Wait for the call with a deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no result arrived in time; the call is
    /// abandoned in that case. Otherwise returns whatever error the call failed
    /// with.
    pub async fn timeout(mut self, duration: Duration) -> Result<Value> {
        if let Ok(result) = tokio::time::timeout(duration, &mut self).await {
            result
        } else {
            debug!(
                "Call {} on session {} timed out after {:?}",
                self.call_id, self.session_id, duration
            );
            self.abandon();
            Err(Error::Timeout(duration))
        }
    }

    fn abandon(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(table) = self.table.upgrade() {
            table.forget(self.call_id);
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(Error::CallCancelled));
        }

        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::CallCancelled),
                })
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("call_id", &self.call_id)
            .field("session_id", &self.session_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
