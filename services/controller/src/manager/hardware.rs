//! Camera and controller operations over the device-variable store.
//!
//! All camera actions are indirect: the controller expands configured
//! `Var=Value` action lists into device-variable writes which the site
//! hardware polls and applies.  Failures surface as events on the tick bus,
//! never as returned errors — the state machines react to the events.

use std::sync::Arc;
use tracing::{debug, warn};

use oc_events::{
    Bus, Cause, Event,
    event::{ERR_NO_SHUTDOWN_ACTIONS, WARN_SKIP_SHUTDOWN},
};

use crate::device::{ControllerErrorKind, DeviceError, DeviceStore as _};
use crate::platform::RTMP_DESTINATION_BASE;
use crate::sm::TickContext;

/// Shutdown actions set to this literal mean skipping is intentional.
pub const SKIP_SHUTDOWN: &str = "skip";

pub struct HardwareManager {
    ctx: Arc<TickContext>,
}

impl HardwareManager {
    pub fn new(ctx: Arc<TickContext>) -> Self {
        HardwareManager { ctx }
    }

    // -----------------------------------------------------------------------
    // Controller reads
    // -----------------------------------------------------------------------

    /// Battery voltage from the configured sensor.  When the controller has
    /// never reported (no such entity) the alarm voltage stands in as a safe
    /// substitute.
    pub fn voltage(&self) -> Result<f64, DeviceError> {
        let (mac, pin) = {
            let cfg = self.ctx.cfg();
            (cfg.controller_mac, cfg.battery_voltage_pin.clone())
        };
        match self.ctx.devices.sensor_value(mac, &pin) {
            Ok(v) => Ok(v),
            Err(DeviceError::NoSuchEntity) => self.alarm_voltage(),
            Err(e) => Err(e),
        }
    }

    /// The controller's alarm voltage, converted through the battery
    /// sensor's calibration transform.
    pub fn alarm_voltage(&self) -> Result<f64, DeviceError> {
        let (mac, pin) = {
            let cfg = self.ctx.cfg();
            (cfg.controller_mac, cfg.battery_voltage_pin.clone())
        };
        let raw = self
            .ctx
            .devices
            .var(mac, "AlarmVoltage")?
            .ok_or(DeviceError::NoSuchEntity)?
            .parse::<f64>()
            .map_err(|e| DeviceError::BadData(e.to_string()))?;
        self.ctx.devices.calibrate(mac, &pin, raw)
    }

    /// True iff the device's heartbeat was refreshed within twice its
    /// monitor period.
    pub fn is_up(&self, mac: u64) -> Result<bool, DeviceError> {
        let heartbeat = self.ctx.devices.last_heartbeat(mac)?;
        let period = self.ctx.devices.monitor_period(mac)?;
        let now = self.ctx.now();
        Ok(matches!(heartbeat, Some(t) if now - t <= period * 2))
    }

    /// The controller's reported error condition, if readable.
    pub fn controller_error(&self) -> Result<Option<ControllerErrorKind>, DeviceError> {
        let mac = self.ctx.cfg().controller_mac;
        let value = self.ctx.devices.var(mac, "error")?;
        Ok(value.as_deref().and_then(ControllerErrorKind::parse))
    }

    // -----------------------------------------------------------------------
    // Camera actions
    // -----------------------------------------------------------------------

    /// Power the camera on: write the RTMP destination variable, then expand
    /// the on-actions.
    pub fn start(&self, bus: &Bus) {
        let cfg = self.ctx.snapshot();
        let result = (|| -> Result<(), DeviceError> {
            if !cfg.rtmp_var_name.is_empty() {
                let url = format!("{RTMP_DESTINATION_BASE}{}", cfg.rtmp_key);
                self.ctx
                    .devices
                    .set_var(cfg.camera_mac, &cfg.rtmp_var_name, &url)?;
            }
            self.apply_actions(action_target(cfg.controller_mac, cfg.camera_mac), &cfg.on_actions)
        })();
        if let Err(e) = result {
            warn!(broadcast = %cfg.name, %e, "camera start actions failed");
            bus.publish(Event::HardwareStartFailed {
                cause: Some(Cause::generic(e.to_string())),
            });
        }
    }

    /// Gracefully shut the camera down by expanding the shutdown actions.
    ///
    /// The literal `"skip"` and an empty list both publish
    /// `hardwareShutdownFailedEvent` carrying the matching sentinel, so the
    /// stop sequence can log and move straight to powering off.
    pub fn shutdown(&self, bus: &Bus) {
        let cfg = self.ctx.snapshot();
        let actions = cfg.shutdown_actions.trim();
        if actions == SKIP_SHUTDOWN {
            bus.publish(Event::HardwareShutdownFailed {
                cause: Some(Cause::generic(WARN_SKIP_SHUTDOWN)),
            });
            return;
        }
        if actions.is_empty() {
            bus.publish(Event::HardwareShutdownFailed {
                cause: Some(Cause::generic(ERR_NO_SHUTDOWN_ACTIONS)),
            });
            return;
        }
        if let Err(e) =
            self.apply_actions(action_target(cfg.controller_mac, cfg.camera_mac), actions)
        {
            warn!(broadcast = %cfg.name, %e, "camera shutdown actions failed");
            bus.publish(Event::HardwareShutdownFailed {
                cause: Some(Cause::generic(e.to_string())),
            });
        }
    }

    /// Cut camera power by expanding the off-actions.
    pub fn stop(&self, bus: &Bus) {
        let cfg = self.ctx.snapshot();
        if let Err(e) =
            self.apply_actions(action_target(cfg.controller_mac, cfg.camera_mac), &cfg.off_actions)
        {
            warn!(broadcast = %cfg.name, %e, "camera power-off actions failed");
            bus.publish(Event::HardwarePowerOffFailed {
                cause: Some(Cause::generic(e.to_string())),
            });
        }
    }

    /// Publish `event` when the observed liveness of `mac` matches
    /// `want_up`.  A device the store has never seen counts as down.  A zero
    /// MAC is a configuration problem and publishes
    /// `invalidConfigurationEvent` instead.
    pub fn publish_event_if_status(&self, event: Event, want_up: bool, mac: u64, bus: &Bus) {
        if mac == 0 {
            bus.publish(Event::InvalidConfiguration {
                cause: Some(Cause::generic("device MAC not configured")),
            });
            return;
        }
        let up = match self.is_up(mac) {
            Ok(up) => up,
            Err(DeviceError::NoSuchEntity) => false,
            Err(e) => {
                debug!(mac, %e, "device liveness unreadable");
                return;
            }
        };
        if up == want_up {
            bus.publish(event);
        }
    }

    /// Expand a comma-separated action list into device-variable writes.
    /// `Var=Value` writes that value; a bare `Var` writes `"1"`.
    fn apply_actions(&self, mac: u64, actions: &str) -> Result<(), DeviceError> {
        for pair in actions.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((name, value)) => {
                    self.ctx.devices.set_var(mac, name.trim(), value.trim())?;
                }
                None => self.ctx.devices.set_var(mac, pair, "1")?,
            }
        }
        Ok(())
    }
}

/// Actions land on the controller when one is configured, else directly on
/// the camera.
fn action_target(controller_mac: u64, camera_mac: u64) -> u64 {
    if controller_mac != 0 {
        controller_mac
    } else {
        camera_mac
    }
}
