//! Event variants and their wrapped-error chains.
//!
//! Every event is a tagged variant; error-capable events additionally carry
//! a `cause` which is either another event or a generic wrapped error.  After
//! a round-trip through storage, identity is by tag — generic causes compare
//! equal iff their messages match.  This is accepted as imprecise and is what
//! makes cross-process identity work.

use chrono::{DateTime, SecondsFormat, Utc};
use oc_protocol::WireEvent;
use std::fmt;
use thiserror::Error;

/// Sentinel cause message: shutdown actions were the literal `"skip"`,
/// meaning skipping the graceful shutdown is intentional.
pub const WARN_SKIP_SHUTDOWN: &str = "skipping hardware shutdown actions";

/// Sentinel cause message: no shutdown actions are configured at all.
pub const ERR_NO_SHUTDOWN_ACTIONS: &str = "no shutdown actions configured";

/// Errors from event decoding.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown event tag: {0}")]
    UnknownTag(String),
}

// ---------------------------------------------------------------------------
// Notification kinds
// ---------------------------------------------------------------------------

/// Notification routing kind for error-capable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Hardware,
    Network,
    Configuration,
    Software,
    Forwarder,
    Service,
    Generic,
}

impl NotifyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyKind::Hardware => "broadcast-hardware",
            NotifyKind::Network => "broadcast-network",
            NotifyKind::Configuration => "broadcast-configuration",
            NotifyKind::Software => "broadcast-software",
            NotifyKind::Forwarder => "broadcast-forwarder",
            NotifyKind::Service => "broadcast-service",
            NotifyKind::Generic => "broadcast-generic",
        }
    }
}

impl fmt::Display for NotifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cause chains
// ---------------------------------------------------------------------------

/// A wrapped cause: another event, or a generic error carrying only a
/// message (wire tag `"generic"`).
#[derive(Debug, Clone, PartialEq)]
pub enum Cause {
    Event(Box<Event>),
    Generic(String),
}

impl Cause {
    pub fn generic(message: impl Into<String>) -> Self {
        Cause::Generic(message.into())
    }

    /// The wire tag of this link in the chain.
    pub fn tag(&self) -> &str {
        match self {
            Cause::Event(ev) => ev.tag(),
            Cause::Generic(_) => "generic",
        }
    }

    /// The next link down, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Cause::Event(ev) => ev.cause(),
            Cause::Generic(_) => None,
        }
    }

    /// Structural match: same tag, and for generic links the same message.
    fn matches(&self, other: &Cause) -> bool {
        match (self, other) {
            (Cause::Generic(a), Cause::Generic(b)) => a == b,
            (Cause::Event(a), Cause::Event(b)) => a.tag() == b.tag(),
            _ => false,
        }
    }

    pub fn to_wire(&self) -> WireEvent {
        match self {
            Cause::Event(ev) => ev.to_wire(),
            Cause::Generic(msg) => WireEvent {
                tag: "generic".to_owned(),
                message: Some(msg.clone()),
                cause: None,
            },
        }
    }

    pub fn from_wire(wire: &WireEvent) -> Result<Self, EventError> {
        if wire.tag == "generic" {
            Ok(Cause::Generic(wire.message.clone().unwrap_or_default()))
        } else {
            Ok(Cause::Event(Box::new(Event::from_wire(wire)?)))
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Event(ev) => ev.fmt(f),
            Cause::Generic(msg) => f.write_str(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// All events published on the per-tick bus.
///
/// Tags are frozen: they survive in persisted configs and must never change.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The periodic tick.  The timestamp rides the wire `message` field.
    Time { now: DateTime<Utc> },

    // Broadcast lifecycle
    Start,
    Started,
    StartFailed { cause: Option<Cause> },
    CriticalFailure { cause: Option<Cause> },
    Finish,

    // Periodic cadence fan-out
    HealthCheckDue,
    StatusCheckDue,
    ChatMessageDue,
    GoodHealth,
    BadHealth { issue: String },
    FixFailure { cause: Option<Cause> },

    // Hardware requests and outcomes
    HardwareStartRequest,
    HardwareStopRequest,
    HardwareResetRequest,
    HardwareStarted,
    HardwareStopped,
    HardwareShutdown,
    HardwareStartFailed { cause: Option<Cause> },
    HardwareShutdownFailed { cause: Option<Cause> },
    HardwarePowerOffFailed { cause: Option<Cause> },
    HardwareStopFailed { cause: Option<Cause> },

    // Power conditions
    LowVoltage,
    VoltageRecovered,
    ControllerFailure { cause: Option<Cause> },
    InvalidConfiguration { cause: Option<Cause> },
}

impl Event {
    /// The stable registry tag for this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::Time { .. } => "timeEvent",
            Event::Start => "startEvent",
            Event::Started => "startedEvent",
            Event::StartFailed { .. } => "startFailedEvent",
            Event::CriticalFailure { .. } => "criticalFailureEvent",
            Event::Finish => "finishEvent",
            Event::HealthCheckDue => "healthCheckDueEvent",
            Event::StatusCheckDue => "statusCheckDueEvent",
            Event::ChatMessageDue => "chatMessageDueEvent",
            Event::GoodHealth => "goodHealthEvent",
            Event::BadHealth { .. } => "badHealthEvent",
            Event::FixFailure { .. } => "fixFailureEvent",
            Event::HardwareStartRequest => "hardwareStartRequestEvent",
            Event::HardwareStopRequest => "hardwareStopRequestEvent",
            Event::HardwareResetRequest => "hardwareResetRequestEvent",
            Event::HardwareStarted => "hardwareStartedEvent",
            Event::HardwareStopped => "hardwareStoppedEvent",
            Event::HardwareShutdown => "hardwareShutdownEvent",
            Event::HardwareStartFailed { .. } => "hardwareStartFailedEvent",
            Event::HardwareShutdownFailed { .. } => "hardwareShutdownFailedEvent",
            Event::HardwarePowerOffFailed { .. } => "hardwarePowerOffFailedEvent",
            Event::HardwareStopFailed { .. } => "hardwareStopFailedEvent",
            Event::LowVoltage => "lowVoltageEvent",
            Event::VoltageRecovered => "voltageRecoveredEvent",
            Event::ControllerFailure { .. } => "controllerFailureEvent",
            Event::InvalidConfiguration { .. } => "invalidConfigurationEvent",
        }
    }

    /// This variant's own notification kind, if it is error-capable.
    pub fn kind(&self) -> Option<NotifyKind> {
        match self {
            Event::StartFailed { .. } | Event::CriticalFailure { .. } => Some(NotifyKind::Service),
            Event::BadHealth { .. } => Some(NotifyKind::Network),
            Event::FixFailure { .. }
            | Event::HardwareStartFailed { .. }
            | Event::HardwareShutdownFailed { .. }
            | Event::HardwarePowerOffFailed { .. }
            | Event::HardwareStopFailed { .. }
            | Event::ControllerFailure { .. } => Some(NotifyKind::Hardware),
            Event::InvalidConfiguration { .. } => Some(NotifyKind::Configuration),
            _ => None,
        }
    }

    /// The wrapped cause, if this variant carries one.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Event::StartFailed { cause }
            | Event::CriticalFailure { cause }
            | Event::FixFailure { cause }
            | Event::HardwareStartFailed { cause }
            | Event::HardwareShutdownFailed { cause }
            | Event::HardwarePowerOffFailed { cause }
            | Event::HardwareStopFailed { cause }
            | Event::ControllerFailure { cause }
            | Event::InvalidConfiguration { cause } => cause.as_ref(),
            _ => None,
        }
    }

    /// The kind used for notification routing: the innermost error-capable
    /// event in the cause chain wins.
    pub fn resolved_kind(&self) -> NotifyKind {
        let mut kind = self.kind().unwrap_or(NotifyKind::Generic);
        let mut link = self.cause();
        while let Some(c) = link {
            if let Cause::Event(ev) = c {
                if let Some(k) = ev.kind() {
                    kind = k;
                }
            }
            link = c.cause();
        }
        kind
    }

    /// Chain walk: does this event, or anything it wraps, match `target`?
    ///
    /// Comparison is structural by tag; generic links compare by message.
    pub fn is(&self, target: &Cause) -> bool {
        if let Cause::Event(ev) = target {
            if self.tag() == ev.tag() {
                return true;
            }
        }
        let mut link = self.cause();
        while let Some(c) = link {
            if c.matches(target) {
                return true;
            }
            link = c.cause();
        }
        false
    }

    /// Convenience: does the chain contain a generic cause with this message?
    pub fn is_generic(&self, message: &str) -> bool {
        self.is(&Cause::generic(message))
    }

    pub fn to_wire(&self) -> WireEvent {
        let message = match self {
            Event::Time { now } => Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Event::BadHealth { issue } => Some(issue.clone()),
            _ => None,
        };
        WireEvent {
            tag: self.tag().to_owned(),
            message,
            cause: self.cause().map(|c| Box::new(c.to_wire())),
        }
    }

    /// Decode a wire record: the tag selects the variant through the
    /// registry, the message and cause fill its fields.
    pub fn from_wire(wire: &WireEvent) -> Result<Self, EventError> {
        let mut ev = crate::registry::event_registry()
            .get(&wire.tag)
            .ok_or_else(|| EventError::UnknownTag(wire.tag.clone()))?;
        match &mut ev {
            Event::Time { now } => {
                if let Some(msg) = &wire.message {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(msg) {
                        *now = parsed.with_timezone(&Utc);
                    }
                }
            }
            Event::BadHealth { issue } => {
                *issue = wire.message.clone().unwrap_or_default();
            }
            Event::StartFailed { cause }
            | Event::CriticalFailure { cause }
            | Event::FixFailure { cause }
            | Event::HardwareStartFailed { cause }
            | Event::HardwareShutdownFailed { cause }
            | Event::HardwarePowerOffFailed { cause }
            | Event::HardwareStopFailed { cause }
            | Event::ControllerFailure { cause }
            | Event::InvalidConfiguration { cause } => {
                *cause = match &wire.cause {
                    Some(inner) => Some(Cause::from_wire(inner)?),
                    None => None,
                };
            }
            _ => {}
        }
        Ok(ev)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())?;
        if let Event::BadHealth { issue } = self {
            if !issue.is_empty() {
                write!(f, " ({issue})")?;
            }
        }
        if let Some(cause) = self.cause() {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_tag_and_chain() {
        let ev = Event::HardwareStopFailed {
            cause: Some(Cause::Event(Box::new(Event::HardwarePowerOffFailed {
                cause: Some(Cause::generic("relay write refused")),
            }))),
        };
        let wire = ev.to_wire();
        let back = Event::from_wire(&wire).unwrap();
        assert_eq!(back.tag(), ev.tag());
        assert!(back.is(&Cause::Event(Box::new(Event::HardwarePowerOffFailed {
            cause: None
        }))));
        assert!(back.is_generic("relay write refused"));
        assert!(!back.is_generic("some other error"));
        assert_eq!(back, ev);
    }

    #[test]
    fn time_event_timestamp_rides_the_message() {
        let now = "2025-06-01T03:04:05Z".parse::<DateTime<Utc>>().unwrap();
        let wire = Event::Time { now }.to_wire();
        assert_eq!(wire.message.as_deref(), Some("2025-06-01T03:04:05Z"));
        let back = Event::from_wire(&wire).unwrap();
        assert_eq!(back, Event::Time { now });
    }

    #[test]
    fn bad_health_issue_rides_the_message() {
        let wire = Event::BadHealth {
            issue: "frame drops".to_owned(),
        }
        .to_wire();
        let back = Event::from_wire(&wire).unwrap();
        assert_eq!(
            back,
            Event::BadHealth {
                issue: "frame drops".to_owned()
            }
        );
    }

    #[test]
    fn resolved_kind_walks_to_innermost_error_event() {
        // A service-kind failure wrapping a hardware-kind failure routes as
        // hardware.
        let ev = Event::StartFailed {
            cause: Some(Cause::Event(Box::new(Event::ControllerFailure {
                cause: None,
            }))),
        };
        assert_eq!(ev.resolved_kind(), NotifyKind::Hardware);

        // A generic tail does not override the innermost error event.
        let ev = Event::StartFailed {
            cause: Some(Cause::Event(Box::new(Event::ControllerFailure {
                cause: Some(Cause::generic("fuse blown")),
            }))),
        };
        assert_eq!(ev.resolved_kind(), NotifyKind::Hardware);
    }

    #[test]
    fn non_error_events_resolve_generic() {
        assert_eq!(Event::Finish.resolved_kind(), NotifyKind::Generic);
        assert_eq!(Event::Finish.kind(), None);
    }

    #[test]
    fn sentinel_shutdown_causes_compare_by_message() {
        let skip = Event::HardwareShutdownFailed {
            cause: Some(Cause::generic(WARN_SKIP_SHUTDOWN)),
        };
        let round = Event::from_wire(&skip.to_wire()).unwrap();
        assert!(round.is_generic(WARN_SKIP_SHUTDOWN));
        assert!(!round.is_generic(ERR_NO_SHUTDOWN_ACTIONS));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let wire = WireEvent::bare("noSuchEvent");
        assert!(matches!(
            Event::from_wire(&wire),
            Err(EventError::UnknownTag(_))
        ));
    }

    #[test]
    fn display_includes_chain() {
        let ev = Event::HardwareStartFailed {
            cause: Some(Cause::generic("camera unreachable")),
        };
        assert_eq!(
            ev.to_string(),
            "hardwareStartFailedEvent: camera unreachable"
        );
    }
}
