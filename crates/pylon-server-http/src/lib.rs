//! Public ingress for the tunnel broker
pub mod server;

pub use server::{PublicServer, PublicServerConfig, PublicServerError};
