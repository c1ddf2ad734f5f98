//! Broadcast state variants, the derived-flag table, and persistence.
//!
//! Three mutually exclusive families share the flag encoding: forwarder
//! permanent, forwarder secondary (name carries the `(Secondary)` suffix),
//! and direct.  The flag tuple is a pure function of the state and is
//! rewritten on every transition; decoding maps the tuple back to a state
//! tag and fills the variant's fields from the persisted data blob.  A flag
//! tuple outside the table is an illegal write and panics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use oc_events::Registry;
use oc_protocol::{BroadcastConfig, ControlFlags, is_secondary};

use super::Timed;

/// Deadline for a broadcast start attempt (platform create + hardware up +
/// live transition).
pub const STARTING_TIMEOUT_SECS: i64 = 10 * 60;
/// Deadline for the slate transitions.
pub const TRANSITION_TIMEOUT_SECS: i64 = 5 * 60;
/// Health checks at most once per this interval.
pub const HEALTH_CHECK_INTERVAL_SECS: i64 = 60;
/// Status checks at most once per this interval.
pub const STATUS_CHECK_INTERVAL_SECS: i64 = 60;
/// Chat messages at most once per this interval.
pub const CHAT_MSG_INTERVAL_SECS: i64 = 30 * 60;
/// Spacing between unhealthy-fix attempts.
pub const FIX_INTERVAL_SECS: i64 = 5 * 60;
/// Fix attempts before `fixFailureEvent`.
pub const MAX_FIX_ATTEMPTS: u32 = 3;
/// Start failures before the broadcast is disabled.
pub const MAX_START_FAILURES: i64 = 3;
/// Extra slack added to the voltage recovery timeout when a start attempt
/// waits out a low battery.
pub const VOLTAGE_WAIT_SLACK_SECS: i64 = 10 * 60;

// ---------------------------------------------------------------------------
// State data
// ---------------------------------------------------------------------------

/// Cadence stamps carried by the live-family states.  Persisted in the
/// state data, not on the config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    #[serde(default = "min_utc")]
    pub last_health_check: DateTime<Utc>,
    #[serde(default = "min_utc")]
    pub last_status_check: DateTime<Utc>,
    #[serde(default = "min_utc")]
    pub last_chat_msg: DateTime<Utc>,
}

fn min_utc() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

impl Default for LiveData {
    fn default() -> Self {
        LiveData {
            last_health_check: min_utc(),
            last_status_check: min_utc(),
            last_chat_msg: min_utc(),
        }
    }
}

/// Live cadence plus the fix-attempt ledger of the unhealthy states.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UnhealthyData {
    #[serde(flatten)]
    pub live: LiveData,
    #[serde(default = "min_utc")]
    pub last_fix_attempt: DateTime<Utc>,
    #[serde(default)]
    pub fix_attempts: u32,
}

impl UnhealthyData {
    pub fn from_live(live: LiveData) -> Self {
        UnhealthyData {
            live,
            last_fix_attempt: min_utc(),
            fix_attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BroadcastState {
    // Forwarder permanent
    PermIdle,
    PermStarting(Timed),
    PermLive(LiveData),
    PermLiveUnhealthy(UnhealthyData),
    PermTransitionLiveToSlate(Timed),
    PermSlate(LiveData),
    PermSlateUnhealthy(UnhealthyData),
    PermTransitionSlateToLive(Timed),
    PermVoltageRecoverySlate(Timed),
    PermFailure,

    // Forwarder secondary
    SecIdle,
    SecStarting(Timed),
    SecLive(LiveData),
    SecLiveUnhealthy(UnhealthyData),

    // Direct
    DirectIdle,
    DirectStarting(Timed),
    DirectLive(LiveData),
    DirectLiveUnhealthy(UnhealthyData),
    DirectFailure,
}

/// The family a state (or a config) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Permanent,
    Secondary,
    Direct,
}

impl Family {
    pub fn of(cfg: &BroadcastConfig) -> Self {
        if is_secondary(&cfg.name) {
            Family::Secondary
        } else if cfg.using_forwarder {
            Family::Permanent
        } else {
            Family::Direct
        }
    }

    pub fn idle(self) -> BroadcastState {
        match self {
            Family::Permanent => BroadcastState::PermIdle,
            Family::Secondary => BroadcastState::SecIdle,
            Family::Direct => BroadcastState::DirectIdle,
        }
    }
}

impl BroadcastState {
    pub fn tag(&self) -> &'static str {
        use BroadcastState as S;
        match self {
            S::PermIdle => "permanentIdle",
            S::PermStarting(_) => "permanentStarting",
            S::PermLive(_) => "permanentLive",
            S::PermLiveUnhealthy(_) => "permanentLiveUnhealthy",
            S::PermTransitionLiveToSlate(_) => "permanentTransitionLiveToSlate",
            S::PermSlate(_) => "permanentSlate",
            S::PermSlateUnhealthy(_) => "permanentSlateUnhealthy",
            S::PermTransitionSlateToLive(_) => "permanentTransitionSlateToLive",
            S::PermVoltageRecoverySlate(_) => "permanentVoltageRecoverySlate",
            S::PermFailure => "permanentFailure",
            S::SecIdle => "secondaryIdle",
            S::SecStarting(_) => "secondaryStarting",
            S::SecLive(_) => "secondaryLive",
            S::SecLiveUnhealthy(_) => "secondaryLiveUnhealthy",
            S::DirectIdle => "directIdle",
            S::DirectStarting(_) => "directStarting",
            S::DirectLive(_) => "directLive",
            S::DirectLiveUnhealthy(_) => "directLiveUnhealthy",
            S::DirectFailure => "directFailure",
        }
    }

    pub fn family(&self) -> Family {
        use BroadcastState as S;
        match self {
            S::PermIdle
            | S::PermStarting(_)
            | S::PermLive(_)
            | S::PermLiveUnhealthy(_)
            | S::PermTransitionLiveToSlate(_)
            | S::PermSlate(_)
            | S::PermSlateUnhealthy(_)
            | S::PermTransitionSlateToLive(_)
            | S::PermVoltageRecoverySlate(_)
            | S::PermFailure => Family::Permanent,
            S::SecIdle | S::SecStarting(_) | S::SecLive(_) | S::SecLiveUnhealthy(_) => {
                Family::Secondary
            }
            S::DirectIdle
            | S::DirectStarting(_)
            | S::DirectLive(_)
            | S::DirectLiveUnhealthy(_)
            | S::DirectFailure => Family::Direct,
        }
    }

    /// The derived flag tuple for this state.
    pub fn flags(&self) -> ControlFlags {
        use BroadcastState as S;
        let mut f = ControlFlags::default();
        match self {
            S::PermIdle | S::SecIdle | S::DirectIdle => {}
            S::PermStarting(_) | S::SecStarting(_) | S::DirectStarting(_) => {
                f.attempting_to_start = true;
            }
            S::PermLive(_) | S::SecLive(_) | S::DirectLive(_) => f.active = true,
            S::PermLiveUnhealthy(_) | S::SecLiveUnhealthy(_) | S::DirectLiveUnhealthy(_) => {
                f.active = true;
                f.unhealthy = true;
            }
            S::PermTransitionLiveToSlate(_) => {
                f.active = true;
                f.transitioning = true;
            }
            S::PermSlate(_) => {
                f.active = true;
                f.slate = true;
            }
            S::PermSlateUnhealthy(_) => {
                f.active = true;
                f.slate = true;
                f.unhealthy = true;
            }
            S::PermTransitionSlateToLive(_) => {
                f.active = true;
                f.slate = true;
                f.transitioning = true;
            }
            S::PermVoltageRecoverySlate(_) => {
                f.active = true;
                f.slate = true;
                f.attempting_to_start = true;
            }
            S::PermFailure => {
                f.active = true;
                f.slate = true;
                f.in_failure = true;
            }
            S::DirectFailure => {
                f.active = true;
                f.in_failure = true;
            }
        }
        f
    }

    /// Serialise this variant's fields.
    pub fn encode_data(&self) -> String {
        use BroadcastState as S;
        let value = match self {
            S::PermIdle | S::PermFailure | S::SecIdle | S::DirectIdle | S::DirectFailure => {
                serde_json::json!({})
            }
            S::PermStarting(t)
            | S::PermTransitionLiveToSlate(t)
            | S::PermTransitionSlateToLive(t)
            | S::PermVoltageRecoverySlate(t)
            | S::SecStarting(t)
            | S::DirectStarting(t) => serde_json::to_value(t).unwrap_or_default(),
            S::PermLive(d) | S::PermSlate(d) | S::SecLive(d) | S::DirectLive(d) => {
                serde_json::to_value(d).unwrap_or_default()
            }
            S::PermLiveUnhealthy(d) | S::PermSlateUnhealthy(d) | S::SecLiveUnhealthy(d)
            | S::DirectLiveUnhealthy(d) => serde_json::to_value(d).unwrap_or_default(),
        };
        value.to_string()
    }

    /// Write the flag tuple, tag and data blob back onto the record.
    pub fn update_cfg(&self, cfg: &mut BroadcastConfig) {
        self.flags().apply(cfg);
        cfg.broadcast_state = self.tag().to_owned();
        cfg.broadcast_state_data = self.encode_data();
    }

    /// Decode the state a record encodes: the family and flag tuple select
    /// the variant, the data blob fills its fields.
    ///
    /// # Panics
    /// Panics on a flag tuple outside the table — the invariant on legal
    /// writes makes that a programmer error, not recoverable data.
    pub fn from_cfg(cfg: &BroadcastConfig) -> Self {
        use BroadcastState as S;
        let f = ControlFlags::of(cfg);
        let tuple = (
            f.active,
            f.slate,
            f.attempting_to_start,
            f.transitioning,
            f.unhealthy,
            f.in_failure,
        );
        let bare = match (Family::of(cfg), tuple) {
            (Family::Permanent, (false, false, false, false, false, false)) => S::PermIdle,
            (Family::Permanent, (false, false, true, false, false, false)) => {
                S::PermStarting(Timed::default())
            }
            (Family::Permanent, (true, false, false, false, false, false)) => {
                S::PermLive(LiveData::default())
            }
            (Family::Permanent, (true, false, false, false, true, false)) => {
                S::PermLiveUnhealthy(UnhealthyData::default())
            }
            (Family::Permanent, (true, false, false, true, false, false)) => {
                S::PermTransitionLiveToSlate(Timed::default())
            }
            (Family::Permanent, (true, true, false, false, false, false)) => {
                S::PermSlate(LiveData::default())
            }
            (Family::Permanent, (true, true, false, false, true, false)) => {
                S::PermSlateUnhealthy(UnhealthyData::default())
            }
            (Family::Permanent, (true, true, false, true, false, false)) => {
                S::PermTransitionSlateToLive(Timed::default())
            }
            (Family::Permanent, (true, true, true, false, false, false)) => {
                S::PermVoltageRecoverySlate(Timed::default())
            }
            (Family::Permanent, (true, true, false, false, false, true)) => S::PermFailure,
            (Family::Secondary, (false, false, false, false, false, false)) => S::SecIdle,
            (Family::Secondary, (false, false, true, false, false, false)) => {
                S::SecStarting(Timed::default())
            }
            (Family::Secondary, (true, false, false, false, false, false)) => {
                S::SecLive(LiveData::default())
            }
            (Family::Secondary, (true, false, false, false, true, false)) => {
                S::SecLiveUnhealthy(UnhealthyData::default())
            }
            (Family::Direct, (false, false, false, false, false, false)) => S::DirectIdle,
            (Family::Direct, (false, false, true, false, false, false)) => {
                S::DirectStarting(Timed::default())
            }
            (Family::Direct, (true, false, false, false, false, false)) => {
                S::DirectLive(LiveData::default())
            }
            (Family::Direct, (true, false, false, false, true, false)) => {
                S::DirectLiveUnhealthy(UnhealthyData::default())
            }
            (Family::Direct, (true, false, false, false, false, true)) => S::DirectFailure,
            (family, tuple) => panic!(
                "illegal control flag tuple {tuple:?} for {family:?} broadcast {}",
                cfg.name
            ),
        };
        bare.with_data(&cfg.broadcast_state_data, cfg.broadcast_state == bare.tag())
    }

    /// Fill variant fields from the persisted data blob.  Fields are taken
    /// only when the persisted tag agrees with the flag-derived tag;
    /// anything unreadable falls back to zero values.
    fn with_data(mut self, data: &str, tag_matches: bool) -> Self {
        use BroadcastState as S;
        if !tag_matches || data.trim().is_empty() {
            self.apply_default_timeouts();
            return self;
        }
        match &mut self {
            S::PermStarting(t)
            | S::PermTransitionLiveToSlate(t)
            | S::PermTransitionSlateToLive(t)
            | S::PermVoltageRecoverySlate(t)
            | S::SecStarting(t)
            | S::DirectStarting(t) => {
                if let Ok(parsed) = serde_json::from_str::<Timed>(data) {
                    *t = parsed;
                }
            }
            S::PermLive(d) | S::PermSlate(d) | S::SecLive(d) | S::DirectLive(d) => {
                if let Ok(parsed) = serde_json::from_str::<LiveData>(data) {
                    *d = parsed;
                }
            }
            S::PermLiveUnhealthy(d) | S::PermSlateUnhealthy(d) | S::SecLiveUnhealthy(d)
            | S::DirectLiveUnhealthy(d) => {
                if let Ok(parsed) = serde_json::from_str::<UnhealthyData>(data) {
                    *d = parsed;
                }
            }
            _ => {}
        }
        self.apply_default_timeouts();
        self
    }

    /// Zero-valued timeouts get the variant's default so a record written by
    /// an older build still times out.
    fn apply_default_timeouts(&mut self) {
        use BroadcastState as S;
        match self {
            S::PermStarting(t) | S::SecStarting(t) | S::DirectStarting(t) => {
                if t.timeout_secs == 0 {
                    t.timeout_secs = STARTING_TIMEOUT_SECS;
                }
            }
            S::PermTransitionLiveToSlate(t)
            | S::PermTransitionSlateToLive(t)
            | S::PermVoltageRecoverySlate(t) => {
                if t.timeout_secs == 0 {
                    t.timeout_secs = TRANSITION_TIMEOUT_SECS;
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

static STATES: LazyLock<Registry<BroadcastState>> = LazyLock::new(|| {
    use BroadcastState as S;
    let mut r = Registry::new();
    r.register("permanentIdle", || S::PermIdle);
    r.register("permanentStarting", || S::PermStarting(Timed::default()));
    r.register("permanentLive", || S::PermLive(LiveData::default()));
    r.register("permanentLiveUnhealthy", || {
        S::PermLiveUnhealthy(UnhealthyData::default())
    });
    r.register("permanentTransitionLiveToSlate", || {
        S::PermTransitionLiveToSlate(Timed::default())
    });
    r.register("permanentSlate", || S::PermSlate(LiveData::default()));
    r.register("permanentSlateUnhealthy", || {
        S::PermSlateUnhealthy(UnhealthyData::default())
    });
    r.register("permanentTransitionSlateToLive", || {
        S::PermTransitionSlateToLive(Timed::default())
    });
    r.register("permanentVoltageRecoverySlate", || {
        S::PermVoltageRecoverySlate(Timed::default())
    });
    r.register("permanentFailure", || S::PermFailure);
    r.register("secondaryIdle", || S::SecIdle);
    r.register("secondaryStarting", || S::SecStarting(Timed::default()));
    r.register("secondaryLive", || S::SecLive(LiveData::default()));
    r.register("secondaryLiveUnhealthy", || {
        S::SecLiveUnhealthy(UnhealthyData::default())
    });
    r.register("directIdle", || S::DirectIdle);
    r.register("directStarting", || S::DirectStarting(Timed::default()));
    r.register("directLive", || S::DirectLive(LiveData::default()));
    r.register("directLiveUnhealthy", || {
        S::DirectLiveUnhealthy(UnhealthyData::default())
    });
    r.register("directFailure", || S::DirectFailure);
    r
});

/// The broadcast state registry.
pub fn registry() -> &'static Registry<BroadcastState> {
    &STATES
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use oc_protocol::BroadcastConfig;

    fn cfg_for(state: &BroadcastState) -> BroadcastConfig {
        let name = match state.family() {
            Family::Secondary => "Cuttle(Secondary)",
            _ => "Cuttle",
        };
        let mut cfg = BroadcastConfig::blank(1, name);
        cfg.using_forwarder = state.family() != Family::Direct;
        state.update_cfg(&mut cfg);
        cfg
    }

    fn all_states() -> Vec<BroadcastState> {
        registry().tags().filter_map(|t| registry().get(t)).collect()
    }

    #[test]
    fn every_tag_round_trips_through_registry() {
        for tag in registry().tags() {
            assert_eq!(registry().get(tag).unwrap().tag(), tag);
        }
        assert_eq!(registry().tags().count(), 19);
    }

    /// decode(encode(flags(S))) recovers a state with the same tag, for
    /// every state.
    #[test]
    fn flag_round_trip_preserves_tag() {
        for state in all_states() {
            let cfg = cfg_for(&state);
            let decoded = BroadcastState::from_cfg(&cfg);
            assert_eq!(decoded.tag(), state.tag(), "state {}", state.tag());
        }
    }

    #[test]
    fn live_data_fields_survive_round_trip() {
        let now = Utc::now();
        let live = LiveData {
            last_health_check: now,
            last_status_check: now - chrono::Duration::seconds(30),
            last_chat_msg: now - chrono::Duration::minutes(10),
        };
        let state = BroadcastState::DirectLive(live);
        let cfg = cfg_for(&state);
        match BroadcastState::from_cfg(&cfg) {
            BroadcastState::DirectLive(parsed) => assert_eq!(parsed, live),
            other => panic!("expected directLive, got {}", other.tag()),
        }
    }

    #[test]
    fn unhealthy_fix_ledger_survives_round_trip() {
        let now = Utc::now();
        let data = UnhealthyData {
            live: LiveData::default(),
            last_fix_attempt: now,
            fix_attempts: 2,
        };
        let state = BroadcastState::PermLiveUnhealthy(data);
        let cfg = cfg_for(&state);
        match BroadcastState::from_cfg(&cfg) {
            BroadcastState::PermLiveUnhealthy(parsed) => {
                assert_eq!(parsed.fix_attempts, 2);
                assert_eq!(parsed.last_fix_attempt, now);
            }
            other => panic!("expected permanentLiveUnhealthy, got {}", other.tag()),
        }
    }

    #[test]
    #[should_panic(expected = "illegal control flag tuple")]
    fn unknown_flag_tuple_panics() {
        let mut cfg = BroadcastConfig::blank(1, "Cuttle");
        cfg.slate = true; // slate without active is not in the table
        let _ = BroadcastState::from_cfg(&cfg);
    }

    #[test]
    fn secondary_family_follows_the_name() {
        let mut cfg = BroadcastConfig::blank(1, "Cuttle(Secondary)");
        cfg.using_forwarder = true;
        assert_eq!(BroadcastState::from_cfg(&cfg).tag(), "secondaryIdle");
    }

    #[test]
    fn starting_defaults_its_timeout() {
        let mut cfg = BroadcastConfig::blank(1, "Cuttle");
        cfg.attempting_to_start = true;
        match BroadcastState::from_cfg(&cfg) {
            BroadcastState::DirectStarting(t) => {
                assert_eq!(t.timeout_secs, STARTING_TIMEOUT_SECS);
            }
            other => panic!("expected directStarting, got {}", other.tag()),
        }
    }
}
