//! Client facades over the shared protocol core.
//!
//! - [`asynchronous`]: awaitable calls on [`Session`](crate::Session), plus
//!   callables discovered from the root contract.
//! - [`blocking`]: the same surface for threads outside any async runtime.

pub mod asynchronous;
pub mod blocking;

pub use asynchronous::RemoteMethod;
pub use blocking::{BlockingConnection, BlockingRemoteMethod, BlockingSession};
