//! In-memory store for tests and local development

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::{KvStore, StoreError};

/// In-memory [`KvStore`] with SSDB-like scan semantics. Hash fields are kept
/// sorted, so scans page deterministically.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    hashes: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a plain key.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap()
            .insert(key.into(), value.into());
    }

    /// Store a field in the hash kept under `key`.
    pub fn hset(
        &self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.hashes
            .write()
            .unwrap()
            .entry(key.into())
            .or_default()
            .insert(field.into(), value.into());
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    async fn scan_hash(
        &self,
        key: &str,
        field_start: &str,
        field_end: &str,
        limit: u64,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let hashes = self.hashes.read().unwrap();
        let pairs = match hashes.get(key) {
            Some(hash) => hash
                .iter()
                .filter(|(field, _)| field.as_str() > field_start)
                .filter(|(field, _)| field_end.is_empty() || field.as_str() <= field_end)
                .take(limit as usize)
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
            None => Vec::new(),
        };
        Ok(pairs)
    }
}
