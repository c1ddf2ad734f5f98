//! Entity storage.
//!
//! The controller persists everything — broadcast records, sites, the token
//! bucket, auth tokens, device variables — as JSON values in one key/value
//! entity store.  The store contract is transactional read-modify-write;
//! the SQLite adapter backs production, the in-memory fake backs tests.

pub mod config_store;
pub mod sqlite;

pub use config_store::ConfigStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("bad record under {key}: {source}")]
    BadRecord {
        key: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Transactional JSON entity store.
///
/// `update` runs the closure inside one transaction (or equivalent
/// compare-and-set): the closure sees the current value (None when absent)
/// and returns the value to write.  Concurrent updates to the same key are
/// serialised by the store.
pub trait EntityStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<String, StoreError>,
    ) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, sorted.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
