//! Broadcast manager operations: the day-of reuse rule, rate-limited
//! creation, secondary setup, and stop semantics.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use controller::clock::Clock;
use controller::limiter::TOKEN_BUCKET_KEY;
use controller::manager::BroadcastManager;
use controller::sm::TickContext;
use controller::store::EntityStore;
use oc_protocol::{BroadcastConfig, Site, broadcast_key};
use oc_test_utils::{
    FakeDeviceStore, FakeMediaStore, FakePlatform, ManualClock, MemStore, RecordingForwarder,
    RecordingNotifier,
};

const CAMERA_MAC: u64 = 2;
const SKEY: i64 = 9;

struct Harness {
    ctx: Arc<TickContext>,
    store: Arc<MemStore>,
    devices: Arc<FakeDeviceStore>,
    platform: Arc<FakePlatform>,
    clock: Arc<ManualClock>,
}

fn base_cfg(now: DateTime<Utc>) -> BroadcastConfig {
    let mut cfg = BroadcastConfig::blank(SKEY, "Jetty Cam");
    cfg.enabled = true;
    cfg.start = now - Duration::hours(1);
    cfg.end = now + Duration::hours(6);
    cfg.camera_mac = CAMERA_MAC;
    cfg.stream_name = "jetty-cam".to_owned();
    cfg.live_privacy = "public".to_owned();
    cfg
}

fn harness(cfg: BroadcastConfig) -> Harness {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let clock = ManualClock::new(start);
    let store = MemStore::new();
    store
        .put(&cfg.key(), &serde_json::to_string(&cfg).unwrap())
        .unwrap();
    let devices = FakeDeviceStore::new(clock.clone());
    let platform = FakePlatform::new();
    let site = Site {
        skey: SKEY,
        name: "test-site".to_owned(),
        utc_offset_mins: 0,
        notify_recipient: String::new(),
    };
    let ctx = TickContext::new(
        cfg,
        site,
        store.clone(),
        devices.clone(),
        FakeMediaStore::new(),
        platform.clone(),
        RecordingForwarder::new(),
        RecordingNotifier::new(),
        clock.clone(),
        false,
    );
    Harness {
        ctx,
        store,
        devices,
        platform,
        clock,
    }
}

fn manager(h: &Harness) -> BroadcastManager {
    BroadcastManager::new(h.ctx.clone())
}

// ---------------------------------------------------------------------------
// Reuse rule
// ---------------------------------------------------------------------------

#[test]
fn reuse_when_scheduled_today_and_upcoming() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.broadcast_id = "bid-old".to_owned();
    cfg.stream_id = "sid-old".to_owned();
    cfg.rtmp_key = "key-old".to_owned();
    let h = harness(cfg);
    h.platform.set_scheduled_start(Some(h.clock.now()));
    h.platform.set_status("upcoming");

    manager(&h).create_broadcast().unwrap();

    assert_eq!(h.platform.created(), 0, "no new platform broadcast");
    // Reuse never touches the token bucket.
    assert!(h.store.get(TOKEN_BUCKET_KEY).unwrap().is_none());
    assert_eq!(h.ctx.cfg().broadcast_id, "bid-old");
}

#[test]
fn no_reuse_when_scheduled_yesterday() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.broadcast_id = "bid-old".to_owned();
    cfg.stream_id = "sid-old".to_owned();
    let h = harness(cfg);
    h.platform
        .set_scheduled_start(Some(h.clock.now() - Duration::days(1)));
    h.platform.set_status("upcoming");

    manager(&h).create_broadcast().unwrap();

    assert_eq!(h.platform.created(), 1);
    assert_eq!(h.ctx.cfg().broadcast_id, "bid-1");
}

#[test]
fn no_reuse_when_status_terminal_or_unknown() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.broadcast_id = "bid-old".to_owned();
    cfg.stream_id = "sid-old".to_owned();
    let h = harness(cfg);
    h.platform.set_scheduled_start(Some(h.clock.now()));
    h.platform.set_status("complete");

    manager(&h).create_broadcast().unwrap();
    assert_eq!(h.platform.created(), 1);

    // An empty (unknown) status is also not reusable.
    h.platform.set_status("");
    h.platform.set_scheduled_start(Some(h.clock.now()));
    manager(&h).create_broadcast().unwrap();
    assert_eq!(h.platform.created(), 2);
}

#[test]
fn reuse_refreshes_missing_rtmp_key() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.broadcast_id = "bid-old".to_owned();
    cfg.stream_id = "sid-old".to_owned();
    cfg.rtmp_key = String::new();
    let h = harness(cfg);
    h.platform.set_scheduled_start(Some(h.clock.now()));
    h.platform.set_status("upcoming");

    manager(&h).create_broadcast().unwrap();

    assert_eq!(h.ctx.cfg().rtmp_key, "rtmp-key-jetty-cam");
}

#[test]
fn create_consumes_one_token_per_attempt() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let h = harness(base_cfg(start));
    let m = manager(&h);

    m.create_broadcast().unwrap();
    // The recorded ids are not reusable (no scheduled start on the fake),
    // so a second attempt creates and pays again.
    m.create_broadcast().unwrap();

    assert_eq!(h.platform.created(), 2);
    let bucket: serde_json::Value =
        serde_json::from_str(&h.store.get(TOKEN_BUCKET_KEY).unwrap().unwrap()).unwrap();
    let tokens = bucket["tokens"].as_f64().unwrap();
    assert!((tokens - 28.0).abs() < 1e-6, "two tokens spent, got {tokens}");
}

#[test]
fn scheduled_name_carries_local_date() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let h = harness(base_cfg(start));
    manager(&h).create_broadcast().unwrap();
    assert_eq!(
        h.platform.created_names(),
        vec!["Jetty Cam 01/06/2025".to_owned()]
    );
}

// ---------------------------------------------------------------------------
// Secondary setup
// ---------------------------------------------------------------------------

#[test]
fn setup_secondary_creates_unlisted_clone_and_points_camera() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.using_forwarder = true;
    cfg.forwarder_host = "10.1.1.5:8300".to_owned();
    let h = harness(cfg);

    manager(&h).setup_secondary().unwrap();

    let json = h
        .store
        .get(&broadcast_key(SKEY, "Jetty Cam(Secondary)"))
        .unwrap()
        .expect("secondary record created");
    let secondary: BroadcastConfig = serde_json::from_str(&json).unwrap();
    assert!(secondary.enabled);
    assert!(secondary.using_forwarder);
    assert!(secondary.send_chat_msg);
    assert_eq!(secondary.live_privacy, "unlisted");
    assert_eq!(secondary.controller_mac, 0);
    assert_eq!(secondary.on_actions, "");
    assert_eq!(secondary.shutdown_actions, "");
    assert_eq!(secondary.start, h.ctx.cfg().start);
    assert_eq!(secondary.end, h.ctx.cfg().end);

    assert_eq!(
        h.devices.var_value(CAMERA_MAC, "HTTPAddress").as_deref(),
        Some("10.1.1.5:8300")
    );
    assert_eq!(
        h.devices.var_value(CAMERA_MAC, "Outputs").as_deref(),
        Some("HTTP")
    );
}

#[test]
#[should_panic(expected = "setup_secondary called for secondary broadcast")]
fn setup_secondary_rejects_secondary_names() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.name = "Jetty Cam(Secondary)".to_owned();
    let h = harness(cfg);
    let _ = manager(&h).setup_secondary();
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[test]
fn stop_broadcast_completes_and_applies_post_privacy() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.broadcast_id = "bid-44".to_owned();
    cfg.active = true;
    cfg.post_live_privacy = "unlisted".to_owned();
    let h = harness(cfg);
    h.platform.set_status("live");

    manager(&h).stop_broadcast().unwrap();

    assert_eq!(h.platform.completed(), vec!["bid-44".to_owned()]);
    assert!(!h.ctx.cfg().active);
}

#[test]
fn stop_broadcast_skips_already_terminal() {
    let start: DateTime<Utc> = "2025-06-01T08:00:00Z".parse().unwrap();
    let mut cfg = base_cfg(start);
    cfg.broadcast_id = "bid-45".to_owned();
    cfg.active = true;
    let h = harness(cfg);
    h.platform.set_status("complete");

    manager(&h).stop_broadcast().unwrap();

    assert!(h.platform.completed().is_empty());
    assert!(!h.ctx.cfg().active);
}
