//! Frames exchanged between peers and the types they carry.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Identifier of a session, unique within one connection.
///
/// The connecting peer allocates odd ids and the accepting peer even ids, so
/// both sides can open sessions without coordinating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Returns true if the id was allocated by the connecting peer.
    #[must_use]
    pub const fn is_connector_allocated(self) -> bool {
        self.0 % 2 == 1
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Identifier of a call, unique within its session while the call is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Arguments of a call: positional values followed by keyed values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    /// Positional arguments, bound to parameters in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,

    /// Keyed arguments, bound to parameters by name.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub keyed: Map<String, Value>,
}

impl Args {
    /// Creates an empty argument list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the value cannot be represented.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self> {
        self.positional.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Adds a keyed argument.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the value cannot be represented.
    pub fn keyed<T: Serialize>(mut self, name: impl Into<String>, value: T) -> Result<Self> {
        self.keyed.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Total number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyed.len()
    }

    /// Returns true if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyed.is_empty()
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keyed: Map::new(),
        }
    }
}

impl From<Map<String, Value>> for Args {
    fn from(keyed: Map<String, Value>) -> Self {
        Self {
            positional: Vec::new(),
            keyed,
        }
    }
}

/// A remotely invocable method as declared by a root type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Method name.
    pub name: String,
    /// Parameter names in declaration order.
    pub params: Vec<String>,
}

impl MethodSpec {
    /// Number of parameters the method takes.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Category of a failure reported across the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No such method on the root object.
    MethodNotFound,
    /// Arguments did not match the method's parameters.
    InvalidArguments,
    /// The method raised an error.
    Remote,
    /// A value could not be encoded or decoded.
    Serialization,
    /// The addressed session is not open.
    SessionClosed,
    /// No root type registered under the requested name.
    UnknownRootType,
    /// The root factory failed.
    RootConstruction,
    /// The session id is already in use or belongs to the wrong peer.
    InvalidSession,
    /// Anything this side does not know about.
    #[serde(other)]
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MethodNotFound => "method not found",
            Self::InvalidArguments => "invalid arguments",
            Self::Remote => "remote error",
            Self::Serialization => "serialization error",
            Self::SessionClosed => "session closed",
            Self::UnknownRootType => "unknown root type",
            Self::RootConstruction => "root construction failed",
            Self::InvalidSession => "invalid session",
            Self::Other => "error",
        };
        f.write_str(name)
    }
}

/// Error information carried by `CallError` and `SessionOpenError` frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorInfo {
    /// Creates error information without detail.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// An out-of-band event pushed by the root object of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    pub name: String,
    /// Event payload.
    pub payload: Value,
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Request to open a session bound to a new root object.
    SessionOpen {
        /// Session being opened.
        session_id: SessionId,
        /// Root type to instantiate, or the peer's default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root_type: Option<String>,
        /// Arguments passed to the root factory.
        #[serde(default)]
        open_args: Value,
    },

    /// The session is open; carries the root's method contract.
    SessionOpenAck {
        /// Session that was opened.
        session_id: SessionId,
        /// Methods exposed by the root object.
        #[serde(default)]
        methods: Vec<MethodSpec>,
    },

    /// The session could not be opened.
    SessionOpenError {
        /// Session that was refused.
        session_id: SessionId,
        /// Why it was refused.
        reason: ErrorInfo,
    },

    /// Either side ends a session.
    SessionClose {
        /// Session being closed.
        session_id: SessionId,
    },

    /// Invoke a method on the session's root object.
    Call {
        /// Target session.
        session_id: SessionId,
        /// Correlation id, unique within the session.
        call_id: CallId,
        /// Method name.
        method: String,
        /// Call arguments.
        #[serde(default)]
        args: Args,
    },

    /// Successful result of a call.
    Reply {
        /// Session the call was issued on.
        session_id: SessionId,
        /// Call being answered.
        call_id: CallId,
        /// Returned value.
        value: Value,
    },

    /// Failed result of a call.
    CallError {
        /// Session the call was issued on.
        session_id: SessionId,
        /// Call being answered.
        call_id: CallId,
        /// What went wrong.
        error: ErrorInfo,
    },

    /// Out-of-band push from a root object to the session's opener.
    Event {
        /// Session the event belongs to.
        session_id: SessionId,
        /// Event name.
        name: String,
        /// Event payload.
        #[serde(default)]
        payload: Value,
    },
}

impl Frame {
    /// Session this frame addresses.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        match self {
            Self::SessionOpen { session_id, .. }
            | Self::SessionOpenAck { session_id, .. }
            | Self::SessionOpenError { session_id, .. }
            | Self::SessionClose { session_id }
            | Self::Call { session_id, .. }
            | Self::Reply { session_id, .. }
            | Self::CallError { session_id, .. }
            | Self::Event { session_id, .. } => *session_id,
        }
    }

    /// Short name of the frame type, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionOpen { .. } => "session_open",
            Self::SessionOpenAck { .. } => "session_open_ack",
            Self::SessionOpenError { .. } => "session_open_error",
            Self::SessionClose { .. } => "session_close",
            Self::Call { .. } => "call",
            Self::Reply { .. } => "reply",
            Self::CallError { .. } => "call_error",
            Self::Event { .. } => "event",
        }
    }
}
