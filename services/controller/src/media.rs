//! Media store access: latest scalar readings for chat messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::{EntityStore, StoreError};

/// A stored scalar reading for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarReading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

pub trait MediaStore: Send + Sync {
    /// The most recent scalar for a sensor, if one exists at or after
    /// `since`.  Older readings are treated as absent.
    fn latest_scalar(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ScalarReading>, StoreError>;
}

pub fn scalar_key(sensor_id: &str) -> String {
    format!("Scalar/{sensor_id}")
}

/// `MediaStore` over the shared entity store: one latest-reading record per
/// sensor, refreshed by the ingest path.
pub struct StoreMediaStore {
    store: Arc<dyn EntityStore>,
}

impl StoreMediaStore {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        StoreMediaStore { store }
    }
}

impl MediaStore for StoreMediaStore {
    fn latest_scalar(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ScalarReading>, StoreError> {
        match self.store.get(&scalar_key(sensor_id))? {
            Some(json) => {
                let reading: ScalarReading = serde_json::from_str(&json)?;
                Ok((reading.timestamp >= since).then_some(reading))
            }
            None => Ok(None),
        }
    }
}
