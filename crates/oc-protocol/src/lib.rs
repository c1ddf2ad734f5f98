// oc-protocol: Persistent record and wire types for the broadcast controller.
//
// Everything here is plain data: the broadcast configuration record as it is
// stored, the operator-editable projection of it, the derived control flags,
// and the small payloads exchanged with the forwarder and over HTTP.  No I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Suffix appended to the primary broadcast name for the forwarder's
/// secondary (unlisted) broadcast.
pub const SECONDARY_SUFFIX: &str = "(Secondary)";

/// Default minimum battery voltage required before streaming is attempted.
pub const DEFAULT_REQUIRED_STREAMING_VOLTAGE: f64 = 24.5;

/// Default number of hours to wait for battery voltage to recover.
pub const DEFAULT_VOLTAGE_RECOVERY_TIMEOUT_HOURS: i64 = 4;

/// Returns true if the broadcast name denotes a forwarder secondary.
pub fn is_secondary(name: &str) -> bool {
    name.contains(SECONDARY_SUFFIX)
}

/// Lowercase hex rendering of a device MAC, as used in device-variable names
/// (e.g. `"1a2b3c4d5e6f"` in `"1a2b3c4d5e6f.AlarmVoltage"`).
pub fn mac_hex(mac: u64) -> String {
    format!("{mac:x}")
}

// ---------------------------------------------------------------------------
// Store keys
// ---------------------------------------------------------------------------

/// Store key for a broadcast config record.
pub fn broadcast_key(skey: i64, name: &str) -> String {
    format!("Variable/{skey}.Broadcast.{name}")
}

/// Store key prefix covering all broadcast records for a site.
pub fn broadcast_key_prefix(skey: i64) -> String {
    format!("Variable/{skey}.Broadcast.")
}

/// Store key for a site record.
pub fn site_key(skey: i64) -> String {
    format!("Site/{skey}")
}

// ---------------------------------------------------------------------------
// Spilled event wire shape
// ---------------------------------------------------------------------------

/// A serialised event as persisted in `BroadcastConfig::events`.
///
/// `tag` selects the registered event variant; `cause` recursively encodes
/// wrapped errors.  A cause with tag `"generic"` carries only a message and
/// stands for a non-registered error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WireEvent>>,
}

impl WireEvent {
    pub fn bare(tag: impl Into<String>) -> Self {
        WireEvent {
            tag: tag.into(),
            message: None,
            cause: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// One entry of a broadcast's sensor list, used for periodic chat messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    /// Media-store identifier of the sensor.
    pub sensor_id: String,
    /// Human name of the measured quantity (e.g. "Water Temperature").
    pub quantity: String,
    /// Display units (e.g. "°C").
    #[serde(default)]
    pub units: String,
    /// Multiplier applied to the stored scalar before display.
    #[serde(default = "default_scale")]
    pub scale_factor: f64,
    /// Whether this sensor participates in chat messages.
    #[serde(default)]
    pub send_msg: bool,
}

fn default_scale() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Derived control flags
// ---------------------------------------------------------------------------

/// The derived control flags rewritten on every broadcast state transition.
///
/// These are a pure function of the broadcast state; they exist so UIs can
/// render a broadcast without deserialising the state data.  The state tag
/// and its data blob remain the source of truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    pub active: bool,
    pub slate: bool,
    pub attempting_to_start: bool,
    pub transitioning: bool,
    pub unhealthy: bool,
    pub in_failure: bool,
}

impl ControlFlags {
    /// Read the flag tuple out of a config record.
    pub fn of(cfg: &BroadcastConfig) -> Self {
        ControlFlags {
            active: cfg.active,
            slate: cfg.slate,
            attempting_to_start: cfg.attempting_to_start,
            transitioning: cfg.transitioning,
            unhealthy: cfg.unhealthy,
            in_failure: cfg.in_failure,
        }
    }

    /// Write the flag tuple back onto a config record.
    pub fn apply(self, cfg: &mut BroadcastConfig) {
        cfg.active = self.active;
        cfg.slate = self.slate;
        cfg.attempting_to_start = self.attempting_to_start;
        cfg.transitioning = self.transitioning;
        cfg.unhealthy = self.unhealthy;
        cfg.in_failure = self.in_failure;
    }
}

// ---------------------------------------------------------------------------
// BroadcastConfig
// ---------------------------------------------------------------------------

/// The canonical persistent record for one broadcast.
///
/// Stored as JSON under `Variable/{skey}.Broadcast.{name}`.  The controller
/// mutates it only through the transactional save operation; the external
/// configuration UI creates and deletes records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    // Identity
    pub skey: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    // Schedule: absolute UTC times, renormalised to today's site-local
    // calendar date before every tick.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    // Platform binding
    #[serde(default)]
    pub broadcast_id: String,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub rtmp_key: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub live_privacy: String,
    #[serde(default)]
    pub post_live_privacy: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stream_name: String,

    // Hardware binding
    #[serde(default)]
    pub camera_mac: u64,
    #[serde(default)]
    pub controller_mac: u64,
    #[serde(default)]
    pub battery_voltage_pin: String,
    #[serde(default = "default_required_voltage")]
    pub required_streaming_voltage: f64,
    #[serde(default = "default_recovery_hours")]
    pub voltage_recovery_timeout_hours: i64,
    /// Comma-separated `Var=Value` writes that power the camera on.
    #[serde(default)]
    pub on_actions: String,
    /// Comma-separated `Var=Value` writes that cut camera power.
    #[serde(default)]
    pub off_actions: String,
    /// Comma-separated `Var=Value` writes for a graceful camera shutdown.
    /// The literal `"skip"` means shutdown is intentionally skipped.
    #[serde(default)]
    pub shutdown_actions: String,
    /// Device variable that receives the RTMP destination URL.
    #[serde(default)]
    pub rtmp_var_name: String,

    // Derived control flags — rewritten on every state transition,
    // never set by operators.
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub slate: bool,
    #[serde(default)]
    pub attempting_to_start: bool,
    #[serde(default)]
    pub transitioning: bool,
    #[serde(default)]
    pub unhealthy: bool,
    #[serde(default)]
    pub in_failure: bool,

    // Operator flags
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub using_forwarder: bool,
    #[serde(default = "default_true")]
    pub checking_health: bool,
    #[serde(default)]
    pub send_chat_msg: bool,

    // Persistent state machinery
    #[serde(default)]
    pub broadcast_state: String,
    /// JSON serialisation of the current broadcast state variant's fields.
    #[serde(default)]
    pub broadcast_state_data: String,
    #[serde(default)]
    pub hardware_state: String,
    #[serde(default)]
    pub hardware_state_data: String,
    /// Events spilled after the previous tick's scope was cancelled;
    /// drained at the start of every tick.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<WireEvent>,
    #[serde(default)]
    pub issues: i64,
    #[serde(default)]
    pub start_failures: i64,

    // Miscellany
    /// JSON of shape `{SuppressKinds: [..], SuppressContaining: [..]}`;
    /// empty string means no suppression.
    #[serde(default)]
    pub notify_suppress_rules: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensor_list: Vec<SensorEntry>,
    #[serde(default)]
    pub forwarder_host: String,
    #[serde(default)]
    pub register_openfish: bool,
    #[serde(default)]
    pub openfish_capture_source: String,
}

fn default_required_voltage() -> f64 {
    DEFAULT_REQUIRED_STREAMING_VOLTAGE
}

fn default_recovery_hours() -> i64 {
    DEFAULT_VOLTAGE_RECOVERY_TIMEOUT_HOURS
}

fn default_true() -> bool {
    true
}

impl BroadcastConfig {
    /// A blank record stamped with identity, as created when a save targets
    /// a key with no existing record.
    pub fn blank(skey: i64, name: &str) -> Self {
        BroadcastConfig {
            skey,
            name: name.to_owned(),
            uuid: None,
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MIN_UTC,
            broadcast_id: String::new(),
            stream_id: String::new(),
            chat_id: String::new(),
            rtmp_key: String::new(),
            account: String::new(),
            live_privacy: String::new(),
            post_live_privacy: String::new(),
            resolution: String::new(),
            description: String::new(),
            stream_name: String::new(),
            camera_mac: 0,
            controller_mac: 0,
            battery_voltage_pin: String::new(),
            required_streaming_voltage: DEFAULT_REQUIRED_STREAMING_VOLTAGE,
            voltage_recovery_timeout_hours: DEFAULT_VOLTAGE_RECOVERY_TIMEOUT_HOURS,
            on_actions: String::new(),
            off_actions: String::new(),
            shutdown_actions: String::new(),
            rtmp_var_name: String::new(),
            active: false,
            slate: false,
            attempting_to_start: false,
            transitioning: false,
            unhealthy: false,
            in_failure: false,
            enabled: false,
            using_forwarder: false,
            checking_health: true,
            send_chat_msg: false,
            broadcast_state: String::new(),
            broadcast_state_data: String::new(),
            hardware_state: String::new(),
            hardware_state_data: String::new(),
            events: Vec::new(),
            issues: 0,
            start_failures: 0,
            notify_suppress_rules: String::new(),
            sensor_list: Vec::new(),
            forwarder_host: String::new(),
            register_openfish: false,
            openfish_capture_source: String::new(),
        }
    }

    /// The store key this record lives under.
    pub fn key(&self) -> String {
        broadcast_key(self.skey, &self.name)
    }

    /// Whether this record is the forwarder secondary of another broadcast.
    pub fn is_secondary(&self) -> bool {
        is_secondary(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Operator save projection
// ---------------------------------------------------------------------------

/// The operator-editable projection of a `BroadcastConfig`, as accepted by
/// `PUT /broadcast/save`.
///
/// Derived flags, platform IDs, state tags/data, spilled events and counters
/// are deliberately absent: a save can never overwrite controller-owned
/// machinery.  The single exception is `hardware_state`, which operators may
/// set to `"hardwareOff"` (and only that value) to clear a hardware failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSave {
    pub skey: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub live_privacy: String,
    #[serde(default)]
    pub post_live_privacy: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stream_name: String,
    #[serde(default)]
    pub camera_mac: u64,
    #[serde(default)]
    pub controller_mac: u64,
    #[serde(default)]
    pub battery_voltage_pin: String,
    #[serde(default = "default_required_voltage")]
    pub required_streaming_voltage: f64,
    #[serde(default = "default_recovery_hours")]
    pub voltage_recovery_timeout_hours: i64,
    #[serde(default)]
    pub on_actions: String,
    #[serde(default)]
    pub off_actions: String,
    #[serde(default)]
    pub shutdown_actions: String,
    #[serde(default)]
    pub rtmp_var_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub using_forwarder: bool,
    #[serde(default = "default_true")]
    pub checking_health: bool,
    #[serde(default)]
    pub send_chat_msg: bool,
    #[serde(default)]
    pub notify_suppress_rules: String,
    #[serde(default)]
    pub sensor_list: Vec<SensorEntry>,
    #[serde(default)]
    pub forwarder_host: String,
    #[serde(default)]
    pub register_openfish: bool,
    #[serde(default)]
    pub openfish_capture_source: String,
    /// Accepted only when equal to `"hardwareOff"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_state: Option<String>,
}

impl BroadcastSave {
    /// Merge the editable fields into an existing record, leaving all
    /// controller-owned machinery untouched.
    pub fn merge_into(&self, cfg: &mut BroadcastConfig) {
        cfg.skey = self.skey;
        cfg.name = self.name.clone();
        cfg.uuid = self.uuid.clone();
        cfg.start = self.start;
        cfg.end = self.end;
        cfg.account = self.account.clone();
        cfg.live_privacy = self.live_privacy.clone();
        cfg.post_live_privacy = self.post_live_privacy.clone();
        cfg.resolution = self.resolution.clone();
        cfg.description = self.description.clone();
        cfg.stream_name = self.stream_name.clone();
        cfg.camera_mac = self.camera_mac;
        cfg.controller_mac = self.controller_mac;
        cfg.battery_voltage_pin = self.battery_voltage_pin.clone();
        cfg.required_streaming_voltage = self.required_streaming_voltage;
        cfg.voltage_recovery_timeout_hours = self.voltage_recovery_timeout_hours;
        cfg.on_actions = self.on_actions.clone();
        cfg.off_actions = self.off_actions.clone();
        cfg.shutdown_actions = self.shutdown_actions.clone();
        cfg.rtmp_var_name = self.rtmp_var_name.clone();
        cfg.enabled = self.enabled;
        cfg.using_forwarder = self.using_forwarder;
        cfg.checking_health = self.checking_health;
        cfg.send_chat_msg = self.send_chat_msg;
        cfg.notify_suppress_rules = self.notify_suppress_rules.clone();
        cfg.sensor_list = self.sensor_list.clone();
        cfg.forwarder_host = self.forwarder_host.clone();
        cfg.register_openfish = self.register_openfish;
        cfg.openfish_capture_source = self.openfish_capture_source.clone();
        if self.hardware_state.as_deref() == Some("hardwareOff") {
            cfg.hardware_state = "hardwareOff".to_owned();
            cfg.hardware_state_data = String::new();
            // The operator escape hatch from a failed state: resetting the
            // hardware also clears the failure flag, so the broadcast state
            // decodes back to its slate/live variant.
            cfg.in_failure = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Site record
// ---------------------------------------------------------------------------

/// A field site.  Stored under `Site/{skey}`.
///
/// The UTC offset drives daily schedule normalisation and the DD/MM/YYYY
/// suffix of scheduled broadcast names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub skey: i64,
    pub name: String,
    /// Minutes east of UTC for the site's locale.
    #[serde(default)]
    pub utc_offset_mins: i32,
    /// Destination for operator notifications, if any.
    #[serde(default)]
    pub notify_recipient: String,
}

// ---------------------------------------------------------------------------
// Forwarder control payload
// ---------------------------------------------------------------------------

/// Body of `PUT /control` sent to the forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderRequest {
    #[serde(rename = "MAC")]
    pub mac: String,
    /// Primary and secondary RTMP destinations, in that order.
    #[serde(rename = "URLs")]
    pub urls: Vec<String>,
    /// `"play"` to pipe camera input through, `"slate"` for the slate loop.
    #[serde(rename = "Status")]
    pub status: String,
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// Error body returned by every non-2xx controller response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_record_carries_identity_and_defaults() {
        let cfg = BroadcastConfig::blank(7, "Rapid Bay");
        assert_eq!(cfg.skey, 7);
        assert_eq!(cfg.name, "Rapid Bay");
        assert_eq!(cfg.required_streaming_voltage, 24.5);
        assert_eq!(cfg.voltage_recovery_timeout_hours, 4);
        assert!(cfg.checking_health);
        assert!(!cfg.enabled);
        assert_eq!(cfg.key(), "Variable/7.Broadcast.Rapid Bay");
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut cfg = BroadcastConfig::blank(3, "Jetty");
        cfg.camera_mac = 0x1a2b3c;
        cfg.events.push(WireEvent {
            tag: "hardwareStartFailedEvent".to_owned(),
            message: None,
            cause: Some(Box::new(WireEvent {
                tag: "generic".to_owned(),
                message: Some("no route to camera".to_owned()),
                cause: None,
            })),
        });
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BroadcastConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let json = r#"{
            "skey": 1, "name": "Cuttle",
            "start": "2025-06-01T00:30:00Z", "end": "2025-06-01T07:30:00Z"
        }"#;
        let cfg: BroadcastConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.required_streaming_voltage, 24.5);
        assert!(cfg.checking_health);
        assert!(cfg.events.is_empty());
        assert_eq!(cfg.hardware_state, "");
    }

    #[test]
    fn save_merge_preserves_machinery() {
        let mut cfg = BroadcastConfig::blank(1, "Cuttle");
        cfg.broadcast_id = "bid-123".to_owned();
        cfg.active = true;
        cfg.broadcast_state = "directLive".to_owned();
        cfg.issues = 3;
        cfg.hardware_state = "hardwareOn".to_owned();

        let save = BroadcastSave {
            skey: 1,
            name: "Cuttle".to_owned(),
            uuid: None,
            start: Utc::now(),
            end: Utc::now(),
            account: "primary".to_owned(),
            live_privacy: "public".to_owned(),
            post_live_privacy: "unlisted".to_owned(),
            resolution: "1080p".to_owned(),
            description: String::new(),
            stream_name: "cuttle-stream".to_owned(),
            camera_mac: 2,
            controller_mac: 1,
            battery_voltage_pin: "A4".to_owned(),
            required_streaming_voltage: 23.0,
            voltage_recovery_timeout_hours: 6,
            on_actions: "Power1=1".to_owned(),
            off_actions: "Power1=0".to_owned(),
            shutdown_actions: String::new(),
            rtmp_var_name: "RTMPURL".to_owned(),
            enabled: true,
            using_forwarder: false,
            checking_health: true,
            send_chat_msg: false,
            notify_suppress_rules: String::new(),
            sensor_list: Vec::new(),
            forwarder_host: String::new(),
            register_openfish: false,
            openfish_capture_source: String::new(),
            hardware_state: None,
        };
        save.merge_into(&mut cfg);

        assert_eq!(cfg.broadcast_id, "bid-123");
        assert!(cfg.active);
        assert_eq!(cfg.broadcast_state, "directLive");
        assert_eq!(cfg.issues, 3);
        assert_eq!(cfg.hardware_state, "hardwareOn");
        assert_eq!(cfg.required_streaming_voltage, 23.0);
    }

    #[test]
    fn save_can_reset_hardware_state_to_off_only() {
        let mut cfg = BroadcastConfig::blank(1, "Cuttle");
        cfg.hardware_state = "hardwareFailure".to_owned();
        cfg.hardware_state_data = "{}".to_owned();

        let mut save: BroadcastSave =
            serde_json::from_str(&serde_json::to_string(&save_fixture()).unwrap()).unwrap();
        save.hardware_state = Some("hardwareOn".to_owned());
        save.merge_into(&mut cfg);
        assert_eq!(cfg.hardware_state, "hardwareFailure");

        save.hardware_state = Some("hardwareOff".to_owned());
        cfg.in_failure = true;
        save.merge_into(&mut cfg);
        assert_eq!(cfg.hardware_state, "hardwareOff");
        assert_eq!(cfg.hardware_state_data, "");
        assert!(!cfg.in_failure);
    }

    fn save_fixture() -> BroadcastSave {
        BroadcastSave {
            skey: 1,
            name: "Cuttle".to_owned(),
            uuid: None,
            start: Utc::now(),
            end: Utc::now(),
            account: String::new(),
            live_privacy: String::new(),
            post_live_privacy: String::new(),
            resolution: String::new(),
            description: String::new(),
            stream_name: String::new(),
            camera_mac: 0,
            controller_mac: 0,
            battery_voltage_pin: String::new(),
            required_streaming_voltage: 24.5,
            voltage_recovery_timeout_hours: 4,
            on_actions: String::new(),
            off_actions: String::new(),
            shutdown_actions: String::new(),
            rtmp_var_name: String::new(),
            enabled: false,
            using_forwarder: false,
            checking_health: true,
            send_chat_msg: false,
            notify_suppress_rules: String::new(),
            sensor_list: Vec::new(),
            forwarder_host: String::new(),
            register_openfish: false,
            openfish_capture_source: String::new(),
            hardware_state: None,
        }
    }

    #[test]
    fn wire_event_omits_empty_fields() {
        let ev = WireEvent::bare("timeEvent");
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(json, r#"{"type":"timeEvent"}"#);
    }

    #[test]
    fn forwarder_request_uses_frozen_field_names() {
        let req = ForwarderRequest {
            mac: "1a2b3c".to_owned(),
            urls: vec!["rtmp://a/x".to_owned(), "rtmp://a/y".to_owned()],
            status: "slate".to_owned(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""MAC":"1a2b3c""#));
        assert!(json.contains(r#""URLs""#));
        assert!(json.contains(r#""Status":"slate""#));
    }

    #[test]
    fn secondary_name_detection() {
        assert!(is_secondary("Cuttle(Secondary)"));
        assert!(!is_secondary("Cuttle"));
    }
}
