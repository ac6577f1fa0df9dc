//! Frame codec: turns frames into transport messages and back.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::Frame;

/// Maximum message size (10MB by default).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Encoding used for frames on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON text.
    #[default]
    Json,
    /// CBOR binary.
    Cbor,
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Cbor => f.write_str("cbor"),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

/// Codec for encoding/decoding frames.
///
/// Both peers of a connection must use the same format.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    format: WireFormat,
    max_message_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new(format: WireFormat) -> Self {
        Self {
            format,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with custom max message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// The wire format in use.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a frame into one transport message.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the frame cannot be encoded or the
    /// encoded message exceeds the size limit. Only the frame being sent is
    /// affected.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let encoded = match self.format {
            WireFormat::Json => serde_json::to_vec(frame)?,
            WireFormat::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(frame, &mut vec)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                vec
            }
        };

        if encoded.len() > self.max_message_size {
            return Err(Error::Serialization(format!(
                "{} frame of {} bytes exceeds maximum {}",
                frame.kind(),
                encoded.len(),
                self.max_message_size
            )));
        }

        Ok(Bytes::from(encoded))
    }

    /// Decode one transport message into a frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the message is oversized, is not valid
    /// in the configured format, or does not describe a known frame.
    pub fn decode(&self, message: &[u8]) -> Result<Frame> {
        if message.len() > self.max_message_size {
            return Err(Error::ProtocolViolation(format!(
                "message of {} bytes exceeds maximum {}",
                message.len(),
                self.max_message_size
            )));
        }

        match self.format {
            WireFormat::Json => serde_json::from_slice(message)
                .map_err(|e| Error::ProtocolViolation(format!("invalid frame: {e}"))),
            WireFormat::Cbor => ciborium::de::from_reader(message)
                .map_err(|e| Error::ProtocolViolation(format!("invalid frame: {e}"))),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(WireFormat::default())
    }
}
