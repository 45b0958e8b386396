//! Credential and Mapping Store
//!
//! Agents authenticate against records held in an external key-value store:
//! a plain key per identity holding its secret, and a hash per identity
//! holding its domain -> local target mappings. The broker core only speaks
//! to the [`KvStore`] trait; [`SsdbStore`] talks to a real SSDB server and
//! [`MemoryStore`] backs tests and local runs.

pub mod memory;
pub mod ssdb;

pub use memory::MemoryStore;
pub use ssdb::SsdbStore;

use async_trait::async_trait;
use thiserror::Error;

/// Store access errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("store request failed: {0}")]
    Request(String),
}

/// Key-value store holding agent credentials and domain mappings.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the secret stored under an identity. `Ok(None)` means the
    /// identity is unknown; errors mean the store itself misbehaved.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Page through the hash stored under `key`, returning up to `limit`
    /// `(field, value)` pairs. `field_start` is exclusive and `field_end`
    /// inclusive; either may be empty for an open bound.
    async fn scan_hash(
        &self,
        key: &str,
        field_start: &str,
        field_end: &str,
        limit: u64,
    ) -> Result<Vec<(String, String)>, StoreError>;
}
