//! Correlation frames for the relay protocol

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// A correlated payload exchanged with an agent.
///
/// Wire form is `<key>\n<payload>`. The key names the public connection
/// waiting on this exchange; the payload is an opaque byte blob and may
/// itself contain newlines, so parsing splits at the first separator only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub key: String,
    pub payload: Bytes,
}

impl RelayFrame {
    pub fn new(key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.key.len() + 1 + self.payload.len());
        buf.put_slice(self.key.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from the wire form.
    ///
    /// The payload is everything after the first newline; the separator
    /// itself is not part of it.
    pub fn parse(data: Bytes) -> Result<Self, FrameError> {
        let separator = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(FrameError::MissingSeparator)?;

        if separator == 0 {
            return Err(FrameError::EmptyKey);
        }

        let key = std::str::from_utf8(&data[..separator])
            .map_err(|_| FrameError::InvalidKey)?
            .to_string();
        let payload = data.slice(separator + 1..);

        Ok(Self { key, payload })
    }
}

/// Relay frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no key separator")]
    MissingSeparator,

    #[error("frame key is empty")]
    EmptyKey,

    #[error("frame key is not valid UTF-8")]
    InvalidKey,
}
