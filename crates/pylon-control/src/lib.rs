//! Control plane for agent tunnel connections
pub mod handler;
pub mod listener;
pub mod pending;

pub use handler::TunnelHandler;
pub use listener::{AgentListener, AgentListenerError};
pub use pending::PendingExchanges;
