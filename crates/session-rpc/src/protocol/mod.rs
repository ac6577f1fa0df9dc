//! Protocol layer for the RPC runtime.
//!
//! This module contains the wire-level definitions:
//! - Frame types and identifiers
//! - Call arguments and error descriptions
//! - The frame codec and wire formats

pub mod codec;
pub mod frame;

pub use codec::{FrameCodec, WireFormat};
pub use frame::{Args, CallId, ErrorInfo, ErrorKind, Event, Frame, MethodSpec, SessionId};
