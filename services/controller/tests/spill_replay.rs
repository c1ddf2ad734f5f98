//! The persistence/recovery protocol: events published after a tick's scope
//! is cancelled spill to the record, exactly once each, and replay at the
//! start of the next tick.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use controller::clock::Clock;
use controller::system::{TickDeps, run_tick};
use oc_events::TickScope;
use oc_protocol::{BroadcastConfig, Site, WireEvent, broadcast_key};
use oc_test_utils::{
    EventLog, FakeDeviceStore, FakeMediaStore, FakePlatform, ManualClock, MemStore,
    RecordingForwarder, RecordingNotifier,
};

const CONTROLLER_MAC: u64 = 1;
const CAMERA_MAC: u64 = 2;
const SKEY: i64 = 3;

struct Harness {
    store: Arc<MemStore>,
    devices: Arc<FakeDeviceStore>,
    platform: Arc<FakePlatform>,
    clock: Arc<ManualClock>,
    log: EventLog,
    deps: TickDeps,
    site: Site,
}

fn harness(background_start: bool) -> Harness {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let clock = ManualClock::new(start);
    let store = MemStore::new();
    let devices = FakeDeviceStore::new(clock.clone());
    devices.set_up(CONTROLLER_MAC, true);
    devices.set_sensor(CONTROLLER_MAC, "A4", 26.0);
    devices.set_device_var(CONTROLLER_MAC, "AlarmVoltage", "20");
    let platform = FakePlatform::new();
    let log = EventLog::new();

    let deps = TickDeps {
        store: store.clone(),
        devices: devices.clone(),
        media: FakeMediaStore::new(),
        platform: platform.clone(),
        forwarder: RecordingForwarder::new(),
        notifier: RecordingNotifier::new(),
        clock: clock.clone(),
        background_start,
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
        clock,
        log,
        deps,
        site,
    }
}

fn base_cfg(now: DateTime<Utc>) -> BroadcastConfig {
    let mut cfg = BroadcastConfig::blank(SKEY, "Reef Cam");
    cfg.enabled = true;
    cfg.start = now - Duration::hours(1);
    cfg.end = now + Duration::hours(5);
    cfg.controller_mac = CONTROLLER_MAC;
    cfg.camera_mac = CAMERA_MAC;
    cfg.battery_voltage_pin = "A4".to_owned();
    cfg.on_actions = "Power1=1".to_owned();
    cfg.stream_name = "reef-cam".to_owned();
    cfg
}

fn load(h: &Harness) -> BroadcastConfig {
    use controller::store::EntityStore;
    let json = h
        .store
        .get(&broadcast_key(SKEY, "Reef Cam"))
        .unwrap()
        .unwrap();
    serde_json::from_str(&json).unwrap()
}

fn seed(h: &Harness, cfg: &BroadcastConfig) {
    use controller::store::EntityStore;
    h.store
        .put(&cfg.key(), &serde_json::to_string(cfg).unwrap())
        .unwrap();
}

/// Spilled events replay in order ahead of the time event, and the list is
/// empty after an uncancelled tick.
#[test]
fn spilled_events_replay_in_order_then_clear() {
    let h = harness(false);
    let mut cfg = base_cfg(h.clock.now());
    cfg.active = true;
    cfg.broadcast_state = "directLive".to_owned();
    cfg.broadcast_id = "bid-1".to_owned();
    cfg.stream_id = "sid-1".to_owned();
    cfg.events = vec![
        WireEvent::bare("goodHealthEvent"),
        WireEvent::bare("statusCheckDueEvent"),
    ];
    seed(&h, &cfg);

    let scope = TickScope::new();
    run_tick(&scope, &h.deps, &h.site, load(&h)).unwrap();
    scope.cancel();

    let tags = h.log.tags();
    assert_eq!(
        &tags[..2],
        &["goodHealthEvent".to_owned(), "statusCheckDueEvent".to_owned()],
        "replayed events must run first, in order"
    );
    assert!(tags.contains(&"timeEvent".to_owned()));
    assert!(
        load(&h).events.is_empty(),
        "events must be empty after an uncancelled tick"
    );
}

/// An unreadable spilled record is dropped; the rest still replay.
#[test]
fn unreadable_spilled_event_is_dropped() {
    let h = harness(false);
    let mut cfg = base_cfg(h.clock.now());
    cfg.active = true;
    cfg.broadcast_state = "directLive".to_owned();
    cfg.events = vec![
        WireEvent::bare("noSuchEventTag"),
        WireEvent::bare("goodHealthEvent"),
    ];
    seed(&h, &cfg);

    let scope = TickScope::new();
    run_tick(&scope, &h.deps, &h.site, load(&h)).unwrap();
    scope.cancel();

    let tags = h.log.tags();
    assert!(tags.contains(&"goodHealthEvent".to_owned()));
    assert!(!tags.iter().any(|t| t == "noSuchEventTag"));
    assert!(load(&h).events.is_empty());
}

/// A detached platform start that completes after the tick's scope is
/// cancelled spills its completion event; the next tick replays it and the
/// broadcast still reaches live.
#[test]
fn late_start_completion_spills_and_replays() {
    let h = harness(true);
    let cfg = base_cfg(h.clock.now());
    seed(&h, &cfg);
    h.platform.set_start_delay_ms(150);

    // Tick 1: idle -> starting, hardware comes up next tick.
    h.clock.advance(Duration::seconds(30));
    let scope = TickScope::new();
    run_tick(&scope, &h.deps, &h.site, load(&h)).unwrap();
    scope.cancel();

    // Tick 2: the camera reports; the platform start is detached and still
    // sleeping when the scope is cancelled.
    h.devices.set_up(CAMERA_MAC, true);
    h.clock.advance(Duration::seconds(30));
    let scope = TickScope::new();
    run_tick(&scope, &h.deps, &h.site, load(&h)).unwrap();
    scope.cancel();

    // Wait out the detached call; its completion must spill to the record.
    std::thread::sleep(std::time::Duration::from_millis(500));
    let cfg = load(&h);
    assert_eq!(cfg.broadcast_state, "directStarting");
    assert_eq!(
        cfg.events,
        vec![WireEvent::bare("startedEvent")],
        "the late completion must appear in the spill exactly once"
    );

    // Tick 3 replays the spilled completion and the broadcast goes live.
    h.clock.advance(Duration::seconds(30));
    let scope = TickScope::new();
    run_tick(&scope, &h.deps, &h.site, load(&h)).unwrap();
    scope.cancel();

    let cfg = load(&h);
    assert_eq!(cfg.broadcast_state, "directLive");
    assert!(cfg.events.is_empty());
    assert_eq!(h.platform.started(), vec!["Reef Cam".to_owned()]);
}
