//! Hardware state variants and their persistence encoding.
//!
//! The tag selects the variant; the data blob fills its fields.  The
//! composite stopping and restarting states hold a substate variant and
//! marshal it as `{substate: {type, data}}` so the phase boundary survives
//! persistence.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use oc_events::Registry;

use super::Timed;

pub const TAG_OFF: &str = "hardwareOff";
pub const TAG_ON: &str = "hardwareOn";
pub const TAG_STARTING: &str = "hardwareStarting";
pub const TAG_RECOVERING_VOLTAGE: &str = "hardwareRecoveringVoltage";
pub const TAG_STOPPING: &str = "hardwareStopping";
pub const TAG_RESTARTING: &str = "hardwareRestarting";
pub const TAG_FAILURE: &str = "hardwareFailure";

const TAG_SHUTTING_DOWN: &str = "hardwareShuttingDown";
const TAG_POWERING_OFF: &str = "hardwarePoweringOff";

/// Camera start deadline.
pub const STARTING_TIMEOUT_SECS: i64 = 5 * 60;
/// Deadline of each stop/restart phase.
pub const PHASE_TIMEOUT_SECS: i64 = 5 * 60;

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// The two sequential phases of a stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoppingPhase {
    ShuttingDown(Timed),
    PoweringOff(Timed),
}

impl StoppingPhase {
    fn tag(self) -> &'static str {
        match self {
            StoppingPhase::ShuttingDown(_) => TAG_SHUTTING_DOWN,
            StoppingPhase::PoweringOff(_) => TAG_POWERING_OFF,
        }
    }

    pub fn timed(&self) -> &Timed {
        match self {
            StoppingPhase::ShuttingDown(t) | StoppingPhase::PoweringOff(t) => t,
        }
    }
}

/// The phase of a restart: the stop sequence, then a fresh start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestartPhase {
    Stopping(StoppingPhase),
    Starting(Timed),
}

/// The camera power lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HardwareState {
    /// Initial state for fresh configurations.
    Off,
    /// Camera heartbeat seen.
    On,
    Starting(Timed),
    RecoveringVoltage(Timed),
    Stopping(StoppingPhase),
    Restarting(RestartPhase),
    /// Terminal until an operator resets the record to `hardwareOff`.
    Failure,
}

impl HardwareState {
    pub fn tag(&self) -> &'static str {
        match self {
            HardwareState::Off => TAG_OFF,
            HardwareState::On => TAG_ON,
            HardwareState::Starting(_) => TAG_STARTING,
            HardwareState::RecoveringVoltage(_) => TAG_RECOVERING_VOLTAGE,
            HardwareState::Stopping(_) => TAG_STOPPING,
            HardwareState::Restarting(_) => TAG_RESTARTING,
            HardwareState::Failure => TAG_FAILURE,
        }
    }

    /// Serialise this variant's fields (not its tag).
    pub fn encode_data(&self) -> String {
        let value = match self {
            HardwareState::Off | HardwareState::On | HardwareState::Failure => json!({}),
            HardwareState::Starting(t) | HardwareState::RecoveringVoltage(t) => timed_json(t),
            HardwareState::Stopping(phase) => json!({ "substate": phase_wire(*phase) }),
            HardwareState::Restarting(phase) => {
                let sub = match phase {
                    RestartPhase::Stopping(stopping) => json!({
                        "type": TAG_STOPPING,
                        "data": { "substate": phase_wire(*stopping) },
                    }),
                    RestartPhase::Starting(t) => json!({
                        "type": TAG_STARTING,
                        "data": timed_json(t),
                    }),
                };
                json!({ "substate": sub })
            }
        };
        value.to_string()
    }

    /// Decode a persisted tag and data blob.  An empty tag is a fresh
    /// record and decodes to `Off`; unknown tags are an error the caller
    /// logs before falling back to `Off`.
    pub fn decode(tag: &str, data: &str) -> Result<Self, DecodeError> {
        if tag.is_empty() {
            return Ok(HardwareState::Off);
        }
        let mut state = registry()
            .get(tag)
            .ok_or_else(|| DecodeError::UnknownTag(tag.to_owned()))?;
        if data.trim().is_empty() {
            return Ok(state);
        }
        let value: serde_json::Value =
            serde_json::from_str(data).map_err(|e| DecodeError::BadData(e.to_string()))?;
        match &mut state {
            HardwareState::Starting(t) | HardwareState::RecoveringVoltage(t) => {
                *t = timed_from(&value, t.timeout_secs);
            }
            HardwareState::Stopping(phase) => {
                *phase = phase_from(value.get("substate"));
            }
            HardwareState::Restarting(phase) => {
                *phase = restart_from(value.get("substate"));
            }
            _ => {}
        }
        Ok(state)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown hardware state tag: {0}")]
    UnknownTag(String),
    #[error("bad hardware state data: {0}")]
    BadData(String),
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct TimedWire {
    last_entered: DateTime<Utc>,
    timeout_secs: i64,
}

fn timed_json(t: &Timed) -> serde_json::Value {
    json!({ "last_entered": t.last_entered, "timeout_secs": t.timeout_secs })
}

fn timed_from(value: &serde_json::Value, default_timeout: i64) -> Timed {
    let wire: Option<TimedWire> = serde_json::from_value(value.clone()).ok();
    match wire {
        Some(w) => Timed {
            last_entered: w.last_entered,
            timeout_secs: w.timeout_secs,
        },
        None => Timed::new(DateTime::<Utc>::MIN_UTC, default_timeout),
    }
}

fn phase_wire(phase: StoppingPhase) -> serde_json::Value {
    json!({ "type": phase.tag(), "data": timed_json(phase.timed()) })
}

fn phase_from(value: Option<&serde_json::Value>) -> StoppingPhase {
    let default = StoppingPhase::ShuttingDown(Timed::new(
        DateTime::<Utc>::MIN_UTC,
        PHASE_TIMEOUT_SECS,
    ));
    let Some(value) = value else { return default };
    let timed = timed_from(
        value.get("data").unwrap_or(&serde_json::Value::Null),
        PHASE_TIMEOUT_SECS,
    );
    match value.get("type").and_then(|t| t.as_str()) {
        Some(TAG_POWERING_OFF) => StoppingPhase::PoweringOff(timed),
        _ => StoppingPhase::ShuttingDown(timed),
    }
}

fn restart_from(value: Option<&serde_json::Value>) -> RestartPhase {
    let Some(value) = value else {
        return RestartPhase::Stopping(StoppingPhase::ShuttingDown(Timed::new(
            DateTime::<Utc>::MIN_UTC,
            PHASE_TIMEOUT_SECS,
        )));
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some(TAG_STARTING) => RestartPhase::Starting(timed_from(
            value.get("data").unwrap_or(&serde_json::Value::Null),
            STARTING_TIMEOUT_SECS,
        )),
        _ => RestartPhase::Stopping(phase_from(
            value.get("data").and_then(|d| d.get("substate")),
        )),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

static STATES: LazyLock<Registry<HardwareState>> = LazyLock::new(|| {
    let mut r = Registry::new();
    r.register(TAG_OFF, || HardwareState::Off);
    r.register(TAG_ON, || HardwareState::On);
    r.register(TAG_STARTING, || {
        HardwareState::Starting(Timed::new(DateTime::<Utc>::MIN_UTC, STARTING_TIMEOUT_SECS))
    });
    r.register(TAG_RECOVERING_VOLTAGE, || {
        HardwareState::RecoveringVoltage(Timed::new(DateTime::<Utc>::MIN_UTC, 0))
    });
    r.register(TAG_STOPPING, || {
        HardwareState::Stopping(StoppingPhase::ShuttingDown(Timed::new(
            DateTime::<Utc>::MIN_UTC,
            PHASE_TIMEOUT_SECS,
        )))
    });
    r.register(TAG_RESTARTING, || {
        HardwareState::Restarting(RestartPhase::Stopping(StoppingPhase::ShuttingDown(
            Timed::new(DateTime::<Utc>::MIN_UTC, PHASE_TIMEOUT_SECS),
        )))
    });
    r.register(TAG_FAILURE, || HardwareState::Failure);
    r
});

/// The hardware state registry.
pub fn registry() -> &'static Registry<HardwareState> {
    &STATES
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
