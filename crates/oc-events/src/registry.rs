//! Tag registry: a process-wide mapping from stable string tags to value
//! factories.
//!
//! Variant tags survive in persisted configs, so events and states must
//! round-trip through untyped storage without the reader knowing the concrete
//! type at compile time.  Each machine registers its own state registry; the
//! event registry is global.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::event::Event;

/// A tag → factory table.  Registration happens once at process (or machine)
/// initialisation; duplicate tags are a programmer error and fail fast.
pub struct Registry<T> {
    factories: BTreeMap<&'static str, Box<dyn Fn() -> T + Send + Sync>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory for `tag`.
    ///
    /// # Panics
    /// Panics if a factory for the same tag is already registered.
    pub fn register(&mut self, tag: &'static str, factory: impl Fn() -> T + Send + Sync + 'static) {
        let prev = self.factories.insert(tag, Box::new(factory));
        assert!(prev.is_none(), "duplicate registry tag: {tag}");
    }

    /// Construct a fresh value for `tag`, or `None` if the tag is unknown.
    pub fn get(&self, tag: &str) -> Option<T> {
        self.factories.get(tag).map(|f| f())
    }

    /// All registered tags, in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global event registry
// ---------------------------------------------------------------------------

static EVENTS: LazyLock<Registry<Event>> = LazyLock::new(|| {
    let mut r = Registry::new();
    r.register("timeEvent", || Event::Time {
        now: chrono::DateTime::<chrono::Utc>::MIN_UTC,
    });
    r.register("startEvent", || Event::Start);
    r.register("startedEvent", || Event::Started);
    r.register("startFailedEvent", || Event::StartFailed { cause: None });
    r.register("criticalFailureEvent", || Event::CriticalFailure {
        cause: None,
    });
    r.register("finishEvent", || Event::Finish);
    r.register("healthCheckDueEvent", || Event::HealthCheckDue);
    r.register("statusCheckDueEvent", || Event::StatusCheckDue);
    r.register("chatMessageDueEvent", || Event::ChatMessageDue);
    r.register("goodHealthEvent", || Event::GoodHealth);
    r.register("badHealthEvent", || Event::BadHealth {
        issue: String::new(),
    });
    r.register("fixFailureEvent", || Event::FixFailure { cause: None });
    r.register("hardwareStartRequestEvent", || Event::HardwareStartRequest);
    r.register("hardwareStopRequestEvent", || Event::HardwareStopRequest);
    r.register("hardwareResetRequestEvent", || Event::HardwareResetRequest);
    r.register("hardwareStartedEvent", || Event::HardwareStarted);
    r.register("hardwareStoppedEvent", || Event::HardwareStopped);
    r.register("hardwareShutdownEvent", || Event::HardwareShutdown);
    r.register("hardwareStartFailedEvent", || Event::HardwareStartFailed {
        cause: None,
    });
    r.register("hardwareShutdownFailedEvent", || {
        Event::HardwareShutdownFailed { cause: None }
    });
    r.register("hardwarePowerOffFailedEvent", || {
        Event::HardwarePowerOffFailed { cause: None }
    });
    r.register("hardwareStopFailedEvent", || Event::HardwareStopFailed {
        cause: None,
    });
    r.register("lowVoltageEvent", || Event::LowVoltage);
    r.register("voltageRecoveredEvent", || Event::VoltageRecovered);
    r.register("controllerFailureEvent", || Event::ControllerFailure {
        cause: None,
    });
    r.register("invalidConfigurationEvent", || Event::InvalidConfiguration {
        cause: None,
    });
    r
});

/// The global event registry.
pub fn event_registry() -> &'static Registry<Event> {
    &EVENTS
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Every registered event tag constructs a value carrying that same tag.
    #[test]
    fn every_tag_round_trips_through_get() {
        let reg = event_registry();
        let mut count = 0;
        for tag in reg.tags() {
            let ev = reg.get(tag).unwrap();
            assert_eq!(ev.tag(), tag);
            count += 1;
        }
        assert_eq!(count, 26);
    }

    #[test]
    fn unknown_tag_returns_none() {
        assert!(event_registry().get("bogusEvent").is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate registry tag")]
    fn duplicate_registration_panics() {
        let mut r: Registry<u32> = Registry::new();
        r.register("x", || 1);
        r.register("x", || 2);
    }
}
