//! Root objects: the server-side objects whose methods sessions invoke.
//!
//! A [`RootType`] names a type, the factory that builds one instance per
//! session, and the table of remotely callable methods. The table is built once
//! at registration; its contract (method names and parameter names) is sent to
//! the client when a session opens.
//!
//! Method arguments are bound positionally first and then by parameter name,
//! and the bound values are decoded into the method's argument tuple. Binding
//! and decoding fail fast with [`Error::InvalidArguments`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Shared;
use crate::error::{Error, Result};
use crate::protocol::{Args, ErrorInfo, ErrorKind, Frame, MethodSpec, SessionId};

/// Failure reported by a root method or factory.
///
/// Any standard error converts into it with `?`. The message and optional
/// detail reach the caller as [`Error::Remote`].
#[derive(Clone, Debug)]
pub struct RemoteError {
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    pub detail: Option<Value>,
}

impl RemoteError {
    /// Create an error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Result of a root method or factory.
pub type MethodResult<T> = std::result::Result<T, RemoteError>;

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for RemoteError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            message: err.message,
            detail: err.detail,
        }
    }
}

/// Handle given to a root object's factory, tied to the hosting session.
#[derive(Clone)]
pub struct SessionContext {
    session_id: SessionId,
    connection: Weak<Shared>,
    closed: CancellationToken,
}

impl SessionContext {
    pub(crate) const fn new(
        session_id: SessionId,
        connection: Weak<Shared>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            connection,
            closed,
        }
    }

    /// A context not attached to any connection.
    #[cfg(test)]
    pub(crate) fn detached(session_id: SessionId) -> Self {
        Self::new(session_id, Weak::new(), CancellationToken::new())
    }

    /// Id of the hosting session.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns true once the hosting session is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Push an event to the peer that opened the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] after the session closed,
    /// [`Error::ConnectionClosed`] once the connection is gone, and a
    /// serialization error if the payload cannot be encoded.
    pub fn emit(&self, name: impl Into<String>, payload: impl Serialize) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }

        let connection = self.connection.upgrade().ok_or(Error::ConnectionClosed)?;
        let frame = Frame::Event {
            session_id: self.session_id,
            name: name.into(),
            payload: serde_json::to_value(payload)?,
        };

        connection.send_frame(&frame)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

type Factory<R> = Box<dyn Fn(SessionContext, Value) -> MethodResult<R> + Send + Sync>;
type Handler<R> = Arc<dyn Fn(&mut R, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct Method<R> {
    spec: MethodSpec,
    handler: Handler<R>,
}

/// A named root type with its factory and method table.
pub struct RootType<R> {
    name: String,
    factory: Factory<R>,
    methods: BTreeMap<String, Method<R>>,
}

impl<R: Send + 'static> RootType<R> {
    /// Declare a root type. `factory` builds one instance per session from the
    /// session's open arguments.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(SessionContext, Value) -> MethodResult<R> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            methods: BTreeMap::new(),
        }
    }

    /// Add a method.
    ///
    /// `params` names the parameters in order. `A` is the tuple of parameter
    /// types (`()` for none, `(T,)` for one) and is decoded from the bound
    /// arguments. Declaring a name twice replaces the earlier method.
    #[must_use]
    pub fn method<A, T, F>(mut self, name: &str, params: &[&str], f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        T: Serialize + 'static,
        F: Fn(&mut R, A) -> MethodResult<T> + Send + Sync + 'static,
    {
        let method = name.to_string();
        let handler: Handler<R> = Arc::new(move |root: &mut R, args: Vec<Value>| {
            let outcome = decode_args::<A>(&method, args).and_then(|args| {
                match catch_unwind(AssertUnwindSafe(|| f(root, args))) {
                    Ok(Ok(value)) => encode_return(&method, &value),
                    Ok(Err(err)) => Err(err.into()),
                    Err(panic) => Err(panic_error(&method, &*panic)),
                }
            });
            future::ready(outcome).boxed()
        });

        self.insert(name, params, handler);
        self
    }

    /// Add a method whose body is asynchronous.
    ///
    /// The returned future may not borrow the root; copy out what it needs.
    #[must_use]
    pub fn async_method<A, T, F, Fut>(mut self, name: &str, params: &[&str], f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        T: Serialize + 'static,
        F: Fn(&mut R, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<T>> + Send + 'static,
    {
        let method = name.to_string();
        let handler: Handler<R> = Arc::new(move |root: &mut R, args: Vec<Value>| {
            let args = match decode_args::<A>(&method, args) {
                Ok(args) => args,
                Err(err) => return future::ready(Err(err)).boxed(),
            };

            let fut = match catch_unwind(AssertUnwindSafe(|| f(root, args))) {
                Ok(fut) => fut,
                Err(panic) => return future::ready(Err(panic_error(&method, &*panic))).boxed(),
            };

            let method = method.clone();
            async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(value)) => encode_return(&method, &value),
                    Ok(Err(err)) => Err(err.into()),
                    Err(panic) => Err(panic_error(&method, &*panic)),
                }
            }
            .boxed()
        });

        self.insert(name, params, handler);
        self
    }

    fn insert(&mut self, name: &str, params: &[&str], handler: Handler<R>) {
        let spec = MethodSpec {
            name: name.to_string(),
            params: params.iter().map(ToString::to_string).collect(),
        };
        self.methods.insert(name.to_string(), Method { spec, handler });
    }
}

impl<R> RootType<R> {
    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Method contract, ordered by method name.
    #[must_use]
    pub fn contract(&self) -> Vec<MethodSpec> {
        self.methods.values().map(|m| m.spec.clone()).collect()
    }
}

impl<R> fmt::Debug for RootType<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootType")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Type-erased root type held by the registry.
pub(crate) trait ErasedRootType: Send + Sync {
    fn name(&self) -> &str;

    fn contract(&self) -> Vec<MethodSpec>;

    fn instantiate(
        self: Arc<Self>,
        ctx: SessionContext,
        open_args: Value,
    ) -> std::result::Result<Box<dyn RootInstance>, ErrorInfo>;
}

/// One live root object bound to a session.
pub(crate) trait RootInstance: Send {
    /// Start a call. Synchronous methods run before this returns.
    fn dispatch(&mut self, method: &str, args: Args) -> BoxFuture<'static, Result<Value>>;
}

impl<R: Send + 'static> ErasedRootType for RootType<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn contract(&self) -> Vec<MethodSpec> {
        Self::contract(self)
    }

    fn instantiate(
        self: Arc<Self>,
        ctx: SessionContext,
        open_args: Value,
    ) -> std::result::Result<Box<dyn RootInstance>, ErrorInfo> {
        let session_id = ctx.session_id();

        match catch_unwind(AssertUnwindSafe(|| (self.factory)(ctx, open_args))) {
            Ok(Ok(root)) => {
                debug!("Instantiated root {} for session {}", self.name, session_id);
                Ok(Box::new(Instance { root, ty: self }))
            }
            Ok(Err(err)) => Err(ErrorInfo {
                kind: ErrorKind::RootConstruction,
                message: err.message,
                detail: err.detail,
            }),
            Err(panic) => {
                warn!("Root factory {} panicked for session {}", self.name, session_id);
                Err(ErrorInfo::new(
                    ErrorKind::RootConstruction,
                    format!("factory panicked: {}", panic_message(&*panic)),
                ))
            }
        }
    }
}

struct Instance<R> {
    root: R,
    ty: Arc<RootType<R>>,
}

impl<R: Send + 'static> RootInstance for Instance<R> {
    fn dispatch(&mut self, method: &str, args: Args) -> BoxFuture<'static, Result<Value>> {
        let Some(entry) = self.ty.methods.get(method) else {
            return future::ready(Err(Error::MethodNotFound(format!(
                "{} has no method '{method}'",
                self.ty.name
            ))))
            .boxed();
        };

        match bind_args(&entry.spec, args) {
            Ok(bound) => (entry.handler)(&mut self.root, bound),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }
}

/// Bind positional then keyed arguments to the declared parameters.
fn bind_args(spec: &MethodSpec, args: Args) -> Result<Vec<Value>> {
    let Args {
        positional,
        mut keyed,
    } = args;

    if positional.len() > spec.arity() {
        return Err(Error::InvalidArguments(format!(
            "{}() takes {} arguments but {} were given",
            spec.name,
            spec.arity(),
            positional.len()
        )));
    }

    let mut positional = positional.into_iter();
    let mut bound = Vec::with_capacity(spec.arity());

    for param in &spec.params {
        if let Some(value) = positional.next() {
            if keyed.contains_key(param) {
                return Err(Error::InvalidArguments(format!(
                    "{}() got multiple values for argument '{param}'",
                    spec.name
                )));
            }
            bound.push(value);
        } else if let Some(value) = keyed.remove(param) {
            bound.push(value);
        } else {
            return Err(Error::InvalidArguments(format!(
                "{}() missing argument '{param}'",
                spec.name
            )));
        }
    }

    if let Some(name) = keyed.keys().next() {
        return Err(Error::InvalidArguments(format!(
            "{}() got an unexpected keyword argument '{name}'",
            spec.name
        )));
    }

    Ok(bound)
}

fn decode_args<A: DeserializeOwned>(method: &str, bound: Vec<Value>) -> Result<A> {
    let value = if bound.is_empty() {
        Value::Null
    } else {
        Value::Array(bound)
    };

    serde_json::from_value(value)
        .map_err(|e| Error::InvalidArguments(format!("{method}(): {e}")))
}

fn encode_return<T: Serialize>(method: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::Serialization(format!("{method}() returned an unencodable value: {e}")))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panic_error(method: &str, panic: &(dyn Any + Send)) -> Error {
    warn!("Method {} panicked", method);
    Error::Remote {
        message: format!("{method}() panicked: {}", panic_message(panic)),
        detail: None,
    }
}

/// Root types a peer can host, keyed by name.
///
/// The first registered type is the default, used when a session is opened
/// without naming a type.
#[derive(Clone, Default)]
pub struct RootRegistry {
    types: HashMap<String, Arc<dyn ErasedRootType>>,
    default: Option<String>,
}

impl RootRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root type, replacing any type with the same name.
    #[must_use]
    pub fn register<R: Send + 'static>(mut self, root: RootType<R>) -> Self {
        let name = root.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.types.insert(name, Arc::new(root));
        self
    }

    /// Make a registered type the default. Unknown names are ignored.
    #[must_use]
    pub fn set_default(mut self, name: &str) -> Self {
        if self.types.contains_key(name) {
            self.default = Some(name.to_string());
        } else {
            warn!("Cannot make unregistered root type {} the default", name);
        }
        self
    }

    /// Name of the default root type.
    #[must_use]
    pub fn default_root(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Returns true if a type with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Method contract of a registered type.
    #[must_use]
    pub fn contract(&self, name: &str) -> Option<Vec<MethodSpec>> {
        self.types.get(name).map(|ty| ty.contract())
    }

    pub(crate) fn resolve(
        &self,
        name: Option<&str>,
    ) -> std::result::Result<Arc<dyn ErasedRootType>, ErrorInfo> {
        let name = match name.or(self.default.as_deref()) {
            Some(name) => name,
            None => {
                return Err(ErrorInfo::new(
                    ErrorKind::UnknownRootType,
                    "no root type requested and no default registered",
                ));
            }
        };

        self.types.get(name).cloned().ok_or_else(|| {
            ErrorInfo::new(
                ErrorKind::UnknownRootType,
                format!("unknown root type '{name}'"),
            )
        })
    }
}

impl fmt::Debug for RootRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootRegistry")
            .field("types", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
