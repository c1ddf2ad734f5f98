//! Degraded-mode paths of the forwarder (permanent) family: voltage
//! recovery on slate, fix exhaustion into failure, operator reset out of
//! failure, and notification suppression.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use controller::clock::Clock;
use controller::sm::broadcast_state::{LiveData, UnhealthyData};
use controller::sm::{BroadcastState, TickContext};
use controller::store::EntityStore;
use controller::system::{TickDeps, run_tick};
use oc_events::TickScope;
use oc_protocol::{BroadcastConfig, BroadcastSave, Site, WireEvent, broadcast_key};
use oc_test_utils::{
    EventLog, FakeDeviceStore, FakeMediaStore, FakePlatform, ManualClock, MemStore,
    RecordingForwarder, RecordingNotifier,
};

const CONTROLLER_MAC: u64 = 1;
const CAMERA_MAC: u64 = 2;
const SKEY: i64 = 4;
const NAME: &str = "Kelp Cam";

struct Harness {
    store: Arc<MemStore>,
    devices: Arc<FakeDeviceStore>,
    platform: Arc<FakePlatform>,
    forwarder: Arc<RecordingForwarder>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualClock>,
    log: EventLog,
    deps: TickDeps,
    site: Site,
}

fn harness() -> Harness {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let clock = ManualClock::new(start);
    let store = MemStore::new();
    let devices = FakeDeviceStore::new(clock.clone());
    devices.set_up(CONTROLLER_MAC, true);
    devices.set_up(CAMERA_MAC, false);
    devices.set_sensor(CONTROLLER_MAC, "A4", 26.0);
    devices.set_device_var(CONTROLLER_MAC, "AlarmVoltage", "20");
    let platform = FakePlatform::new();
    let forwarder = RecordingForwarder::new();
    let notifier = RecordingNotifier::new();
    let log = EventLog::new();

    let deps = TickDeps {
        store: store.clone(),
        devices: devices.clone(),
        media: FakeMediaStore::new(),
        platform: platform.clone(),
        forwarder: forwarder.clone(),
        notifier: notifier.clone(),
        clock: clock.clone(),
        background_start: false,
        hooks: vec![log.hook()],
    };
    let site = Site {
        skey: SKEY,
        name: "test-site".to_owned(),
        utc_offset_mins: 0,
        notify_recipient: String::new(),
    };
    Harness {
        store,
        devices,
        platform,
        forwarder,
        notifier,
        clock,
        log,
        deps,
        site,
    }
}

fn perm_cfg(now: DateTime<Utc>) -> BroadcastConfig {
    let mut cfg = BroadcastConfig::blank(SKEY, NAME);
    cfg.enabled = true;
    cfg.start = now - Duration::hours(1);
    cfg.end = now + Duration::hours(6);
    cfg.using_forwarder = true;
    cfg.forwarder_host = "10.0.0.9:8300".to_owned();
    cfg.controller_mac = CONTROLLER_MAC;
    cfg.camera_mac = CAMERA_MAC;
    cfg.battery_voltage_pin = "A4".to_owned();
    cfg.on_actions = "Power1=1".to_owned();
    cfg.off_actions = "Power1=0".to_owned();
    cfg.broadcast_id = "bid-k".to_owned();
    cfg.stream_id = "sid-k".to_owned();
    cfg.rtmp_key = "key-k".to_owned();
    cfg
}

fn seed(h: &Harness, cfg: &BroadcastConfig) {
    h.store
        .put(&cfg.key(), &serde_json::to_string(cfg).unwrap())
        .unwrap();
}

fn load(h: &Harness) -> BroadcastConfig {
    let json = h.store.get(&broadcast_key(SKEY, NAME)).unwrap().unwrap();
    serde_json::from_str(&json).unwrap()
}

fn tick(h: &Harness) -> BroadcastConfig {
    let scope = TickScope::new();
    run_tick(&scope, &h.deps, &h.site, load(h)).unwrap();
    scope.cancel();
    load(h)
}

/// Low battery during the morning slate-to-live transition parks on the
/// low-voltage slate until the battery recovers.
#[test]
fn voltage_recovery_slate_cycle() {
    let h = harness();
    let mut cfg = perm_cfg(h.clock.now());
    // Overnight slate, battery too low to stream.
    BroadcastState::PermSlate(LiveData::default()).update_cfg(&mut cfg);
    seed(&h, &cfg);
    h.devices.set_sensor(CONTROLLER_MAC, "A4", 22.0);

    // Morning: transition begins, the hardware start attempt reports low
    // voltage, and the forwarder is asked for the low-voltage slate.
    h.clock.advance(Duration::seconds(30));
    let cfg = tick(&h);
    assert_eq!(cfg.broadcast_state, "permanentVoltageRecoverySlate");
    assert_eq!(cfg.hardware_state, "hardwareRecoveringVoltage");
    assert!(
        h.forwarder
            .requests()
            .contains(&("slate".to_owned(), Some("LowVoltage".to_owned()))),
        "expected a LowVoltage slate request, got {:?}",
        h.forwarder.requests()
    );

    // The battery comes back: recovery event, transition resumes.
    h.devices.set_sensor(CONTROLLER_MAC, "A4", 26.0);
    h.clock.advance(Duration::minutes(1));
    let cfg = tick(&h);
    assert!(h.log.tags().contains(&"voltageRecoveredEvent".to_owned()));
    assert_eq!(cfg.broadcast_state, "permanentTransitionSlateToLive");
    assert_eq!(cfg.hardware_state, "hardwareStarting");

    // Camera up: live, forwarder switched to play.
    h.devices.set_up(CAMERA_MAC, true);
    h.clock.advance(Duration::minutes(1));
    let cfg = tick(&h);
    assert_eq!(cfg.broadcast_state, "permanentLive");
    assert!(h.forwarder.requests().contains(&("play".to_owned(), None)));
    // The platform broadcast ran through the slate the whole time; nothing
    // was created or restarted.
    assert_eq!(h.platform.created(), 0);
}

/// Once the fix attempts are exhausted the broadcast enters failure,
/// keeps the slate rolling, and stays put until an operator acts.
#[test]
fn exhausted_fixes_reach_permanent_failure() {
    let h = harness();
    let mut cfg = perm_cfg(h.clock.now());
    let spent = UnhealthyData {
        live: LiveData {
            // Cadence quiet for this tick.
            last_health_check: h.clock.now(),
            last_status_check: h.clock.now(),
            last_chat_msg: h.clock.now(),
        },
        last_fix_attempt: h.clock.now() - Duration::minutes(6),
        fix_attempts: 3,
    };
    BroadcastState::PermLiveUnhealthy(spent).update_cfg(&mut cfg);
    seed(&h, &cfg);

    h.clock.advance(Duration::seconds(30));
    let cfg = tick(&h);

    assert!(h.log.tags().contains(&"fixFailureEvent".to_owned()));
    assert_eq!(cfg.broadcast_state, "permanentFailure");
    assert!(cfg.in_failure);
    assert!(cfg.active && cfg.slate);
    assert!(
        h.forwarder
            .requests()
            .iter()
            .any(|(status, _)| status == "slate"),
        "failure keeps the slate rolling"
    );
    assert!(
        h.notifier
            .sent()
            .iter()
            .any(|(kind, _)| kind == "broadcast-hardware"),
        "fix failure notifies as hardware"
    );

    // Failure is sticky across ticks.
    h.clock.advance(Duration::minutes(10));
    let cfg = tick(&h);
    assert_eq!(cfg.broadcast_state, "permanentFailure");
}

/// The operator escape hatch: saving `hardware_state = "hardwareOff"`
/// clears the failure and the broadcast decodes back onto the slate.
#[test]
fn operator_reset_recovers_from_failure() {
    let h = harness();
    let mut cfg = perm_cfg(h.clock.now());
    BroadcastState::PermFailure.update_cfg(&mut cfg);
    cfg.hardware_state = "hardwareFailure".to_owned();
    seed(&h, &cfg);

    // The operator save carries only editable fields plus the one allowed
    // hardware reset.
    let mut save = editable_projection(&load(&h));
    save.hardware_state = Some("hardwareOff".to_owned());
    let store = controller::store::ConfigStore::new(h.store.clone(), SKEY, NAME);
    store.save(&|cfg| save.merge_into(cfg)).unwrap();

    let cfg = load(&h);
    assert!(!cfg.in_failure);
    assert_eq!(cfg.hardware_state, "hardwareOff");
    assert_eq!(BroadcastState::from_cfg(&cfg).tag(), "permanentSlate");

    // The next tick runs the slate family normally again.
    h.clock.advance(Duration::seconds(30));
    let cfg = tick(&h);
    assert_ne!(cfg.broadcast_state, "permanentFailure");
}

fn editable_projection(cfg: &BroadcastConfig) -> BroadcastSave {
    BroadcastSave {
        skey: cfg.skey,
        name: cfg.name.clone(),
        uuid: cfg.uuid.clone(),
        start: cfg.start,
        end: cfg.end,
        account: cfg.account.clone(),
        live_privacy: cfg.live_privacy.clone(),
        post_live_privacy: cfg.post_live_privacy.clone(),
        resolution: cfg.resolution.clone(),
        description: cfg.description.clone(),
        stream_name: cfg.stream_name.clone(),
        camera_mac: cfg.camera_mac,
        controller_mac: cfg.controller_mac,
        battery_voltage_pin: cfg.battery_voltage_pin.clone(),
        required_streaming_voltage: cfg.required_streaming_voltage,
        voltage_recovery_timeout_hours: cfg.voltage_recovery_timeout_hours,
        on_actions: cfg.on_actions.clone(),
        off_actions: cfg.off_actions.clone(),
        shutdown_actions: cfg.shutdown_actions.clone(),
        rtmp_var_name: cfg.rtmp_var_name.clone(),
        enabled: cfg.enabled,
        using_forwarder: cfg.using_forwarder,
        checking_health: cfg.checking_health,
        send_chat_msg: cfg.send_chat_msg,
        notify_suppress_rules: cfg.notify_suppress_rules.clone(),
        sensor_list: cfg.sensor_list.clone(),
        forwarder_host: cfg.forwarder_host.clone(),
        register_openfish: cfg.register_openfish,
        openfish_capture_source: cfg.openfish_capture_source.clone(),
        hardware_state: None,
    }
}

/// Suppress rules withhold matching notifications but never the log.
#[test]
fn suppressed_kinds_are_not_notified() {
    let h = harness();
    let mut cfg = perm_cfg(h.clock.now());
    cfg.notify_suppress_rules = r#"{"SuppressKinds":["broadcast-hardware"]}"#.to_owned();
    cfg.events = vec![WireEvent {
        tag: "hardwareStartFailedEvent".to_owned(),
        message: None,
        cause: Some(Box::new(WireEvent {
            tag: "generic".to_owned(),
            message: Some("camera unreachable".to_owned()),
            cause: None,
        })),
    }];
    // Idle outside the window so nothing else fires.
    cfg.start = h.clock.now() + Duration::hours(2);
    cfg.end = h.clock.now() + Duration::hours(8);
    seed(&h, &cfg);

    tick(&h);
    assert!(
        h.log.tags().contains(&"hardwareStartFailedEvent".to_owned()),
        "the event still flows through the bus"
    );
    assert!(h.notifier.sent().is_empty(), "notification suppressed");
}

#[test]
fn unsuppressed_error_events_notify() {
    let h = harness();
    let mut cfg = perm_cfg(h.clock.now());
    cfg.events = vec![WireEvent::bare("controllerFailureEvent")];
    cfg.start = h.clock.now() + Duration::hours(2);
    cfg.end = h.clock.now() + Duration::hours(8);
    seed(&h, &cfg);

    tick(&h);
    assert!(
        h.notifier
            .sent()
            .iter()
            .any(|(kind, msg)| kind == "broadcast-hardware" && msg.contains(NAME)),
        "expected a hardware notification, got {:?}",
        h.notifier.sent()
    );
}

/// A context is never global: two broadcasts tick against the same deps
/// without sharing state.
#[test]
fn contexts_are_isolated_per_broadcast() {
    let h = harness();
    let cfg_a = perm_cfg(h.clock.now());
    seed(&h, &cfg_a);
    let mut cfg_b = BroadcastConfig::blank(SKEY, "Other Cam");
    cfg_b.enabled = false;
    h.store
        .put(&cfg_b.key(), &serde_json::to_string(&cfg_b).unwrap())
        .unwrap();

    let scope = TickScope::new();
    let ctx_a: Arc<TickContext> = run_tick(&scope, &h.deps, &h.site, load(&h)).unwrap();
    let ctx_b = run_tick(&scope, &h.deps, &h.site, cfg_b.clone()).unwrap();
    scope.cancel();

    assert_eq!(ctx_a.cfg().name, NAME);
    assert_eq!(ctx_b.cfg().name, "Other Cam");
}
