//! Broker Wire Contract
//!
//! This crate defines the wire-level pieces of the tunnel protocol: the
//! correlation frames relayed over agent connections, the handshake strings
//! and codecs, and the canned HTTP responses served by the public ingress.

pub mod frame;
pub mod handshake;
pub mod http;

pub use frame::{FrameError, RelayFrame};
pub use handshake::{AUTH_FAILED, LOGIN_PROMPT, REGISTER_OK, STORE_UNAVAILABLE};

/// Largest first read taken from a public connection.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;
