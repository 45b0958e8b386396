//! Agent Directory
//!
//! Routing state for the broker: which agent owns which public domain, and
//! the live tunnel connection for each agent. The public ingress resolves
//! domains here; the control plane installs and tears down connections.

pub mod directory;
pub mod handle;

pub use directory::AgentDirectory;
pub use handle::{HandleClosed, OutboundMessage, TunnelHandle};
