//! Device-variable store access.
//!
//! Camera and controller hardware at a field site is reachable only
//! indirectly: the controller writes named variables which the site hardware
//! polls, and reads back sensor values and heartbeats the hardware uploads.
//! The `DeviceStore` trait is the whole contract; `StoreDeviceStore` keeps
//! device records and variables in the entity store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use oc_protocol::mac_hex;

use crate::store::{EntityStore, StoreError};

/// Default period between device heartbeats when a record does not say.
pub const DEFAULT_MONITOR_PERIOD_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device or sensor is not in the store at all — typically because
    /// the controller is powered off and has never reported.
    #[error("no such entity")]
    NoSuchEntity,
    #[error("bad device data: {0}")]
    BadData(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A controller-reported error condition, read from the `error` variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerErrorKind {
    LowVoltage,
    Other(String),
}

impl ControllerErrorKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => None,
            "LowVoltage" => Some(ControllerErrorKind::LowVoltage),
            other => Some(ControllerErrorKind::Other(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

pub trait DeviceStore: Send + Sync {
    /// Read a named variable of a device, e.g. `AlarmVoltage` or `error`.
    fn var(&self, mac: u64, name: &str) -> Result<Option<String>, DeviceError>;

    /// Write a named variable of a device.
    fn set_var(&self, mac: u64, name: &str, value: &str) -> Result<(), DeviceError>;

    /// The calibrated value of a sensor pin.
    fn sensor_value(&self, mac: u64, pin: &str) -> Result<f64, DeviceError>;

    /// Apply the sensor's calibration transform to a raw reading.
    fn calibrate(&self, mac: u64, pin: &str, raw: f64) -> Result<f64, DeviceError>;

    /// When the device last refreshed its heartbeat, if ever.
    fn last_heartbeat(&self, mac: u64) -> Result<Option<DateTime<Utc>>, DeviceError>;

    /// The device's configured heartbeat period.
    fn monitor_period(&self, mac: u64) -> Result<Duration, DeviceError>;
}

// ---------------------------------------------------------------------------
// Entity-store-backed implementation
// ---------------------------------------------------------------------------

/// Per-sensor linear calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorCalibration {
    #[serde(default = "one")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for SensorCalibration {
    fn default() -> Self {
        SensorCalibration {
            scale: 1.0,
            offset: 0.0,
        }
    }
}

/// The persistent record for one device, under `Device/{mac-hex}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub mac: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub monitor_period_secs: i64,
    #[serde(default)]
    pub sensors: BTreeMap<String, SensorCalibration>,
}

pub fn device_key(mac: u64) -> String {
    format!("Device/{}", mac_hex(mac))
}

pub fn device_var_key(mac: u64, name: &str) -> String {
    format!("DevVar/{}.{name}", mac_hex(mac))
}

/// `DeviceStore` over the shared entity store.
pub struct StoreDeviceStore {
    store: Arc<dyn EntityStore>,
}

impl StoreDeviceStore {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        StoreDeviceStore { store }
    }

    fn record(&self, mac: u64) -> Result<DeviceRecord, DeviceError> {
        match self.store.get(&device_key(mac))? {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| DeviceError::BadData(e.to_string()))
            }
            None => Err(DeviceError::NoSuchEntity),
        }
    }
}

impl DeviceStore for StoreDeviceStore {
    fn var(&self, mac: u64, name: &str) -> Result<Option<String>, DeviceError> {
        Ok(self.store.get(&device_var_key(mac, name))?)
    }

    fn set_var(&self, mac: u64, name: &str, value: &str) -> Result<(), DeviceError> {
        self.store.put(&device_var_key(mac, name), value)?;
        Ok(())
    }

    fn sensor_value(&self, mac: u64, pin: &str) -> Result<f64, DeviceError> {
        let raw = self
            .var(mac, pin)?
            .ok_or(DeviceError::NoSuchEntity)?
            .parse::<f64>()
            .map_err(|e| DeviceError::BadData(e.to_string()))?;
        self.calibrate(mac, pin, raw)
    }

    fn calibrate(&self, mac: u64, pin: &str, raw: f64) -> Result<f64, DeviceError> {
        let record = self.record(mac)?;
        let cal = record.sensors.get(pin).copied().unwrap_or_default();
        Ok(raw * cal.scale + cal.offset)
    }

    fn last_heartbeat(&self, mac: u64) -> Result<Option<DateTime<Utc>>, DeviceError> {
        match self.record(mac) {
            Ok(rec) => Ok(rec.last_heartbeat),
            Err(DeviceError::NoSuchEntity) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn monitor_period(&self, mac: u64) -> Result<Duration, DeviceError> {
        let secs = match self.record(mac) {
            Ok(rec) if rec.monitor_period_secs > 0 => rec.monitor_period_secs,
            Ok(_) | Err(DeviceError::NoSuchEntity) => DEFAULT_MONITOR_PERIOD_SECS,
            Err(e) => return Err(e),
        };
        Ok(Duration::seconds(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
