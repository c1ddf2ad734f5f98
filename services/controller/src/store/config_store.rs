//! Transactional saves of a single broadcast's configuration record.

use std::sync::Arc;

use oc_protocol::{BroadcastConfig, broadcast_key};

use super::{EntityStore, StoreError};

/// Read-modify-write access to one `(site-key, name)` record.
///
/// `save` is the only way the controller mutates a record: read the current
/// value (creating a blank identity-stamped record when absent), apply the
/// caller's mutation, write the result back inside the store's transaction.
/// State machines treat a failed save as logged-and-continue; the next tick
/// retries.
#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn EntityStore>,
    skey: i64,
    name: String,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn EntityStore>, skey: i64, name: impl Into<String>) -> Self {
        ConfigStore {
            store,
            skey,
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        broadcast_key(self.skey, &self.name)
    }

    /// Apply `update` to the stored record and return the post-image.
    pub fn save(
        &self,
        update: &dyn Fn(&mut BroadcastConfig),
    ) -> Result<BroadcastConfig, StoreError> {
        let key = self.key();
        let mut post: Option<BroadcastConfig> = None;
        self.store.update(&key, &mut |current| {
            let mut cfg = match current {
                Some(json) => {
                    serde_json::from_str(&json).map_err(|source| StoreError::BadRecord {
                        key: key.clone(),
                        source,
                    })?
                }
                None => BroadcastConfig::blank(self.skey, &self.name),
            };
            update(&mut cfg);
            let json = serde_json::to_string(&cfg)?;
            post = Some(cfg);
            Ok(json)
        })?;
        post.ok_or_else(|| StoreError::Backend("save closure did not run".to_owned()))
    }

    /// Load the record, if present.
    pub fn load(&self) -> Result<Option<BroadcastConfig>, StoreError> {
        let key = self.key();
        match self.store.get(&key)? {
            Some(json) => {
                let cfg = serde_json::from_str(&json)
                    .map_err(|source| StoreError::BadRecord { key, source })?;
                Ok(Some(cfg))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::NamedTempFile;

    fn config_store() -> (ConfigStore, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp file");
        let store = Arc::new(SqliteStore::open(file.path()).expect("open store"));
        (ConfigStore::new(store, 5, "Seacliff"), file)
    }

    #[test]
    fn save_creates_blank_stamped_record_when_absent() {
        let (cs, _f) = config_store();
        let post = cs.save(&|cfg| cfg.enabled = true).unwrap();
        assert_eq!(post.skey, 5);
        assert_eq!(post.name, "Seacliff");
        assert!(post.enabled);

        let loaded = cs.load().unwrap().unwrap();
        assert_eq!(loaded, post);
    }

    #[test]
    fn save_applies_update_to_stored_value() {
        let (cs, _f) = config_store();
        cs.save(&|cfg| cfg.issues = 1).unwrap();
        cs.save(&|cfg| cfg.issues += 1).unwrap();
        let loaded = cs.load().unwrap().unwrap();
        assert_eq!(loaded.issues, 2);
    }

    #[test]
    fn load_missing_returns_none() {
        let (cs, _f) = config_store();
        assert!(cs.load().unwrap().is_none());
    }
}
