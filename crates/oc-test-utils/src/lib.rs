// oc-test-utils: Shared fakes for the controller test suites.
//
// Provides in-memory stands-ins for every external collaborator the control
// core consumes: the entity store, the device-variable store, the media
// store, the video platform, the forwarder, the notifier, and the clock.
// Plus an event log that taps a tick's bus to record delivery order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use controller::clock::Clock;
use controller::device::{DeviceError, DeviceStore};
use controller::forward::{ForwarderControl, ForwarderError, SlateOptions};
use controller::media::{MediaStore, ScalarReading};
use controller::notify::{Notifier, NotifyError};
use controller::platform::{BroadcastIds, CreateRequest, PlatformError, PlatformService};
use controller::store::{EntityStore, StoreError};
use oc_events::{Bus, Event, NotifyKind, Subscriber, bus::HandlerError};
use oc_protocol::BroadcastConfig;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// A clock tests wind by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(ManualClock {
            now: Mutex::new(start),
        })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory `EntityStore` with the same transactional update semantics as
/// the SQLite adapter.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemStore::default())
    }
}

impl EntityStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.map).get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.map).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<String, StoreError>,
    ) -> Result<(), StoreError> {
        let mut map = lock(&self.map);
        let next = apply(map.get(key).cloned())?;
        map.insert(key.to_owned(), next);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.map)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FakeDeviceStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceInner {
    up: BTreeMap<u64, bool>,
    vars: BTreeMap<(u64, String), String>,
    sensors: BTreeMap<(u64, String), f64>,
}

/// Scripted device-variable store: tests set liveness, sensor values and
/// variables directly.  Calibration is the identity.
pub struct FakeDeviceStore {
    clock: Arc<ManualClock>,
    inner: Mutex<DeviceInner>,
}

impl FakeDeviceStore {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(FakeDeviceStore {
            clock,
            inner: Mutex::new(DeviceInner::default()),
        })
    }

    /// Mark a device as reporting (heartbeat fresh) or not.
    pub fn set_up(&self, mac: u64, up: bool) {
        lock(&self.inner).up.insert(mac, up);
    }

    pub fn set_sensor(&self, mac: u64, pin: &str, value: f64) {
        lock(&self.inner)
            .sensors
            .insert((mac, pin.to_owned()), value);
    }

    pub fn set_device_var(&self, mac: u64, name: &str, value: &str) {
        lock(&self.inner)
            .vars
            .insert((mac, name.to_owned()), value.to_owned());
    }

    pub fn var_value(&self, mac: u64, name: &str) -> Option<String> {
        lock(&self.inner).vars.get(&(mac, name.to_owned())).cloned()
    }
}

impl DeviceStore for FakeDeviceStore {
    fn var(&self, mac: u64, name: &str) -> Result<Option<String>, DeviceError> {
        Ok(self.var_value(mac, name))
    }

    fn set_var(&self, mac: u64, name: &str, value: &str) -> Result<(), DeviceError> {
        self.set_device_var(mac, name, value);
        Ok(())
    }

    fn sensor_value(&self, mac: u64, pin: &str) -> Result<f64, DeviceError> {
        lock(&self.inner)
            .sensors
            .get(&(mac, pin.to_owned()))
            .copied()
            .ok_or(DeviceError::NoSuchEntity)
    }

    fn calibrate(&self, _mac: u64, _pin: &str, raw: f64) -> Result<f64, DeviceError> {
        Ok(raw)
    }

    fn last_heartbeat(&self, mac: u64) -> Result<Option<DateTime<Utc>>, DeviceError> {
        let up = lock(&self.inner).up.get(&mac).copied().unwrap_or(false);
        Ok(up.then(|| self.clock.now()))
    }

    fn monitor_period(&self, _mac: u64) -> Result<Duration, DeviceError> {
        Ok(Duration::seconds(60))
    }
}

// ---------------------------------------------------------------------------
// FakeMediaStore
// ---------------------------------------------------------------------------

/// Media store with directly-set latest readings.
#[derive(Default)]
pub struct FakeMediaStore {
    readings: Mutex<BTreeMap<String, ScalarReading>>,
}

impl FakeMediaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeMediaStore::default())
    }

    pub fn set_reading(&self, sensor_id: &str, timestamp: DateTime<Utc>, value: f64) {
        lock(&self.readings)
            .insert(sensor_id.to_owned(), ScalarReading { timestamp, value });
    }
}

impl MediaStore for FakeMediaStore {
    fn latest_scalar(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ScalarReading>, StoreError> {
        Ok(lock(&self.readings)
            .get(sensor_id)
            .copied()
            .filter(|r| r.timestamp >= since))
    }
}

// ---------------------------------------------------------------------------
// FakePlatform
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlatformInner {
    status: String,
    no_items: bool,
    health: VecDeque<String>,
    default_health: String,
    scheduled_start: Option<DateTime<Utc>>,
    fail_start: bool,
    start_delay_ms: u64,
    next_ids: u32,
    created: Vec<CreateRequest>,
    started: Vec<String>,
    completed: Vec<String>,
    chat_messages: Vec<(String, String)>,
}

/// Scripted video platform.
pub struct FakePlatform {
    inner: Mutex<PlatformInner>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(FakePlatform {
            inner: Mutex::new(PlatformInner {
                status: "live".to_owned(),
                ..PlatformInner::default()
            }),
        })
    }

    pub fn set_status(&self, status: &str) {
        lock(&self.inner).status = status.to_owned();
    }

    /// Make `broadcast_status` report "no broadcast items" (carrying the
    /// current status string).
    pub fn set_no_items(&self, no_items: bool) {
        lock(&self.inner).no_items = no_items;
    }

    /// Queue a health result; once the queue drains, `default_health`
    /// applies.
    pub fn push_health(&self, issue: &str) {
        lock(&self.inner).health.push_back(issue.to_owned());
    }

    pub fn set_default_health(&self, issue: &str) {
        lock(&self.inner).default_health = issue.to_owned();
    }

    pub fn set_scheduled_start(&self, t: Option<DateTime<Utc>>) {
        lock(&self.inner).scheduled_start = t;
    }

    pub fn set_fail_start(&self, fail: bool) {
        lock(&self.inner).fail_start = fail;
    }

    /// Make `start_broadcast` sleep before completing, to exercise the
    /// spill-after-cancel path of detached starts.
    pub fn set_start_delay_ms(&self, ms: u64) {
        lock(&self.inner).start_delay_ms = ms;
    }

    pub fn created(&self) -> usize {
        lock(&self.inner).created.len()
    }

    /// Names of the broadcasts created so far, in order.
    pub fn created_names(&self) -> Vec<String> {
        lock(&self.inner)
            .created
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        lock(&self.inner).started.clone()
    }

    pub fn completed(&self) -> Vec<String> {
        lock(&self.inner).completed.clone()
    }

    pub fn chat_messages(&self) -> Vec<(String, String)> {
        lock(&self.inner).chat_messages.clone()
    }
}

impl PlatformService for FakePlatform {
    fn create_broadcast(
        &self,
        req: &CreateRequest,
    ) -> Result<(BroadcastIds, String), PlatformError> {
        let mut inner = lock(&self.inner);
        inner.next_ids += 1;
        let n = inner.next_ids;
        inner.created.push(req.clone());
        Ok((
            BroadcastIds {
                broadcast_id: format!("bid-{n}"),
                stream_id: format!("sid-{n}"),
                chat_id: format!("cid-{n}"),
            },
            format!("rtmp-key-{n}"),
        ))
    }

    fn start_broadcast(
        &self,
        name: &str,
        _broadcast_id: &str,
        _stream_id: &str,
    ) -> Result<(), PlatformError> {
        let delay = lock(&self.inner).start_delay_ms;
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
        let mut inner = lock(&self.inner);
        if inner.fail_start {
            return Err(PlatformError::Request("scripted start failure".to_owned()));
        }
        inner.started.push(name.to_owned());
        Ok(())
    }

    fn broadcast_status(&self, _broadcast_id: &str) -> Result<String, PlatformError> {
        let inner = lock(&self.inner);
        if inner.no_items {
            return Err(PlatformError::NoBroadcastItems {
                status: inner.status.clone(),
            });
        }
        Ok(inner.status.clone())
    }

    fn broadcast_scheduled_start(
        &self,
        _broadcast_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PlatformError> {
        Ok(lock(&self.inner).scheduled_start)
    }

    fn broadcast_health(&self, _stream_id: &str) -> Result<String, PlatformError> {
        let mut inner = lock(&self.inner);
        Ok(inner
            .health
            .pop_front()
            .unwrap_or_else(|| inner.default_health.clone()))
    }

    fn rtmp_key(&self, stream_name: &str) -> Result<String, PlatformError> {
        Ok(format!("rtmp-key-{stream_name}"))
    }

    fn complete_broadcast(&self, broadcast_id: &str) -> Result<(), PlatformError> {
        lock(&self.inner).completed.push(broadcast_id.to_owned());
        Ok(())
    }

    fn post_chat_message(&self, chat_id: &str, msg: &str) -> Result<(), PlatformError> {
        lock(&self.inner)
            .chat_messages
            .push((chat_id.to_owned(), msg.to_owned()));
        Ok(())
    }

    fn set_broadcast_privacy(
        &self,
        _broadcast_id: &str,
        _privacy: &str,
    ) -> Result<(), PlatformError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingForwarder
// ---------------------------------------------------------------------------

/// Forwarder client that records requests instead of speaking HTTP.
#[derive(Default)]
pub struct RecordingForwarder {
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingForwarder::default())
    }

    /// `(status, slate variant)` pairs in call order.
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        lock(&self.requests).clone()
    }
}

impl ForwarderControl for RecordingForwarder {
    fn stream(&self, _cfg: &BroadcastConfig) -> Result<(), ForwarderError> {
        lock(&self.requests).push(("play".to_owned(), None));
        Ok(())
    }

    fn slate(&self, _cfg: &BroadcastConfig, opts: &SlateOptions) -> Result<(), ForwarderError> {
        lock(&self.requests)
            .push(("slate".to_owned(), opts.variant.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

/// Notifier that records `(kind, message)` pairs.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingNotifier::default())
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, _skey: i64, kind: NotifyKind, message: &str) -> Result<(), NotifyError> {
        lock(&self.sent)
            .push((kind.as_str().to_owned(), message.to_owned()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Records the tag of every event delivered on a tick's bus, across ticks.
/// Hand `hook()` to `TickDeps::hooks`.
#[derive(Clone, Default)]
pub struct EventLog {
    tags: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog::default()
    }

    pub fn tags(&self) -> Vec<String> {
        lock(&self.tags).clone()
    }

    pub fn clear(&self) {
        lock(&self.tags).clear();
    }

    pub fn hook(&self) -> Arc<dyn Fn() -> Box<dyn Subscriber> + Send + Sync> {
        let log = self.clone();
        Arc::new(move || Box::new(EventLogSubscriber { log: log.clone() }))
    }
}

struct EventLogSubscriber {
    log: EventLog,
}

impl Subscriber for EventLogSubscriber {
    fn name(&self) -> &'static str {
        "event-log"
    }

    fn handle(&mut self, event: &Event, _bus: &Bus) -> Result<(), HandlerError> {
        lock(&self.log.tags).push(event.tag().to_owned());
        Ok(())
    }
}
