//! Stateless broadcast operations over the video platform.
//!
//! The broadcast state machine drives these; none of them keep state beyond
//! what the config record holds.  Creation is rate-limited through the
//! shared persisted token bucket and reuses an existing day-of broadcast
//! when the platform still has a usable one.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use oc_events::{Bus, Cause, Event};
use oc_protocol::{BroadcastConfig, SECONDARY_SUFFIX, is_secondary};

use crate::device::{DeviceError, DeviceStore as _};
use crate::limiter::OceanTokenBucketLimiter;
use crate::media::MediaStore as _;
use crate::platform::{CreateRequest, PlatformError, PlatformService as _, is_terminal_status};
use crate::sm::TickContext;
use crate::store::{ConfigStore, StoreError};

/// Consecutive bad health reports tolerated before `badHealthEvent` fires.
pub const MAX_HEALTH_ISSUES: i64 = 4;

/// How far back a sensor reading may be and still appear in chat.
pub const CHAT_SENSOR_WINDOW_MINS: i64 = 60;

#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The shared token bucket is empty.
    #[error("broadcast create request limit exceeded")]
    RequestLimitExceeded,
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub struct BroadcastManager {
    ctx: Arc<TickContext>,
}

impl BroadcastManager {
    pub fn new(ctx: Arc<TickContext>) -> Self {
        BroadcastManager { ctx }
    }

    /// Delegate to the config store scoped to this broadcast.
    pub fn save(&self, update: &dyn Fn(&mut BroadcastConfig)) -> Result<(), StoreError> {
        self.ctx.save(update)
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Ensure a usable platform broadcast exists: reuse today's if possible,
    /// otherwise create one (consuming a rate-limiter token) and record the
    /// returned identifiers.
    pub fn create_broadcast(&self) -> Result<(), BroadcastError> {
        if self.reusable()? {
            debug!(broadcast = %self.ctx.cfg().name, "reusing existing platform broadcast");
            let (rtmp_key, stream_name) = {
                let cfg = self.ctx.cfg();
                (cfg.rtmp_key.clone(), cfg.stream_name.clone())
            };
            if rtmp_key.is_empty() && !stream_name.is_empty() {
                let key = self.ctx.platform.rtmp_key(&stream_name)?;
                self.ctx.save(&move |cfg| cfg.rtmp_key = key.clone())?;
            }
            return Ok(());
        }

        let limiter = OceanTokenBucketLimiter::new(self.ctx.store.clone(), self.ctx.clock.clone());
        if !limiter.request_token()? {
            return Err(BroadcastError::RequestLimitExceeded);
        }

        let cfg = self.ctx.snapshot();
        let now = self.ctx.now();
        let local_date = now.with_timezone(&self.ctx.site_offset()).format("%d/%m/%Y");
        let req = CreateRequest {
            name: format!("{} {local_date}", cfg.name),
            description: cfg.description.clone(),
            stream_name: cfg.stream_name.clone(),
            privacy: cfg.live_privacy.clone(),
            resolution: cfg.resolution.clone(),
            account: cfg.account.clone(),
            start: now + chrono::Duration::minutes(1),
            end: cfg.end,
        };
        let (ids, rtmp_key) = self.ctx.platform.create_broadcast(&req)?;
        info!(
            broadcast = %cfg.name,
            broadcast_id = %ids.broadcast_id,
            "created platform broadcast"
        );
        self.ctx.save(&move |cfg| {
            cfg.broadcast_id = ids.broadcast_id.clone();
            cfg.stream_id = ids.stream_id.clone();
            cfg.chat_id = ids.chat_id.clone();
            cfg.rtmp_key = rtmp_key.clone();
        })?;

        let cfg = self.ctx.snapshot();
        if cfg.using_forwarder && !cfg.is_secondary() {
            self.setup_secondary()?;
        }
        Ok(())
    }

    /// An existing platform broadcast is reused iff its ids are present, it
    /// is scheduled for today's local calendar date, and its status is known
    /// and non-terminal.
    fn reusable(&self) -> Result<bool, BroadcastError> {
        let cfg = self.ctx.snapshot();
        if cfg.broadcast_id.is_empty() || cfg.stream_id.is_empty() {
            return Ok(false);
        }
        let Some(scheduled) = self
            .ctx
            .platform
            .broadcast_scheduled_start(&cfg.broadcast_id)?
        else {
            return Ok(false);
        };
        let offset = self.ctx.site_offset();
        let today = self.ctx.now().with_timezone(&offset).date_naive();
        if scheduled.with_timezone(&offset).date_naive() != today {
            return Ok(false);
        }
        let status = self.ctx.platform.broadcast_status(&cfg.broadcast_id)?;
        Ok(!status.is_empty() && !is_terminal_status(&status))
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Ask the platform to transition the broadcast to live.  The call may
    /// take a while, so it is spawned on a detached thread in production;
    /// completion publishes back to the bus (spilling if the tick already
    /// ended).
    pub fn start_broadcast(&self, bus: &Bus) {
        let (name, broadcast_id, stream_id) = {
            let cfg = self.ctx.cfg();
            (
                cfg.name.clone(),
                cfg.broadcast_id.clone(),
                cfg.stream_id.clone(),
            )
        };
        let platform = self.ctx.platform.clone();
        let shared = bus.shared();
        let work = move || {
            match platform.start_broadcast(&name, &broadcast_id, &stream_id) {
                Ok(()) => shared.publish(Event::Started),
                Err(e) => shared.publish(Event::StartFailed {
                    cause: Some(Cause::generic(format!("platform start failed: {e}"))),
                }),
            };
        };
        if self.ctx.background_start {
            if let Err(e) = std::thread::Builder::new()
                .name("start-broadcast".to_owned())
                .spawn(work)
            {
                warn!(%e, "could not spawn start thread");
            }
        } else {
            work();
        }
    }

    /// Complete the platform broadcast unless it is already terminal, and
    /// clear the active flag.
    pub fn stop_broadcast(&self) -> Result<(), BroadcastError> {
        let broadcast_id = self.ctx.cfg().broadcast_id.clone();
        if !broadcast_id.is_empty() {
            let status = match self.ctx.platform.broadcast_status(&broadcast_id) {
                Ok(s) => s,
                Err(PlatformError::NoBroadcastItems { status }) => status,
                Err(e) => return Err(e.into()),
            };
            if !is_terminal_status(&status) {
                self.ctx.platform.complete_broadcast(&broadcast_id)?;
            }
            let post_privacy = self.ctx.cfg().post_live_privacy.clone();
            if !post_privacy.is_empty() {
                self.ctx
                    .platform
                    .set_broadcast_privacy(&broadcast_id, &post_privacy)?;
            }
        }
        self.ctx.save(&|cfg| cfg.active = false)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Periodic checks
    // -----------------------------------------------------------------------

    /// Query broadcast status; a missing or terminal broadcast publishes
    /// `finishEvent`.
    ///
    /// A "no broadcast items" response that also reports a terminal status
    /// publishes twice.  Long-standing behavior; the machines tolerate the
    /// duplicate.
    pub fn handle_status(&self, bus: &Bus) -> Result<(), BroadcastError> {
        let broadcast_id = self.ctx.cfg().broadcast_id.clone();
        if broadcast_id.is_empty() {
            return Ok(());
        }
        let status = match self.ctx.platform.broadcast_status(&broadcast_id) {
            Ok(s) => s,
            Err(PlatformError::NoBroadcastItems { status }) => {
                bus.publish(Event::Finish);
                status
            }
            Err(e) => return Err(e.into()),
        };
        if is_terminal_status(&status) {
            bus.publish(Event::Finish);
        }
        Ok(())
    }

    /// Query stream health.  Healthy resets the issue counter and publishes
    /// `goodHealthEvent`; the fifth consecutive issue publishes
    /// `badHealthEvent` and resets the counter.
    pub fn handle_health(&self, bus: &Bus) -> Result<(), BroadcastError> {
        let stream_id = self.ctx.cfg().stream_id.clone();
        if stream_id.is_empty() {
            return Ok(());
        }
        let issue = self.ctx.platform.broadcast_health(&stream_id)?;
        if issue.is_empty() {
            self.ctx.save(&|cfg| cfg.issues = 0)?;
            bus.publish(Event::GoodHealth);
            return Ok(());
        }
        let issues = self.ctx.cfg().issues + 1;
        if issues > MAX_HEALTH_ISSUES {
            self.ctx.save(&|cfg| cfg.issues = 0)?;
            bus.publish(Event::BadHealth { issue });
        } else {
            self.ctx.save(&move |cfg| cfg.issues = issues)?;
        }
        Ok(())
    }

    /// Post the periodic sensor chat message, if any flagged sensor has a
    /// recent reading.  Sensors with no recent data are skipped silently.
    pub fn handle_chat_message(&self) -> Result<(), BroadcastError> {
        let cfg = self.ctx.snapshot();
        if !cfg.send_chat_msg || cfg.chat_id.is_empty() {
            return Ok(());
        }
        let since = self.ctx.now() - chrono::Duration::minutes(CHAT_SENSOR_WINDOW_MINS);
        let mut lines = Vec::new();
        for sensor in cfg.sensor_list.iter().filter(|s| s.send_msg) {
            match self.ctx.media.latest_scalar(&sensor.sensor_id, since)? {
                Some(reading) => {
                    let value = reading.value * sensor.scale_factor;
                    lines.push(format!("{}: {value:.1} {}", sensor.quantity, sensor.units));
                }
                None => debug!(sensor = %sensor.sensor_id, "no recent reading; skipping"),
            }
        }
        if lines.is_empty() {
            return Ok(());
        }
        let msg = lines.join(" | ");
        self.ctx.platform.post_chat_message(&cfg.chat_id, &msg)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Secondary
    // -----------------------------------------------------------------------

    /// Create or refresh the `{name}(Secondary)` record the forwarder's
    /// second output streams to: unlisted, no hardware actions, chat on, the
    /// primary's schedule and resolution.  Also points the camera at the
    /// forwarder by writing its `HTTPAddress` and `Outputs` variables.
    ///
    /// # Panics
    /// Panics when called for a name already carrying the secondary suffix.
    pub fn setup_secondary(&self) -> Result<(), BroadcastError> {
        let primary = self.ctx.snapshot();
        assert!(
            !is_secondary(&primary.name),
            "setup_secondary called for secondary broadcast {}",
            primary.name
        );

        let secondary_name = format!("{}{SECONDARY_SUFFIX}", primary.name);
        let store = ConfigStore::new(self.ctx.store.clone(), primary.skey, secondary_name);
        store.save(&|sec| {
            sec.uuid = None;
            sec.start = primary.start;
            sec.end = primary.end;
            sec.account = primary.account.clone();
            sec.live_privacy = "unlisted".to_owned();
            sec.post_live_privacy = "unlisted".to_owned();
            sec.resolution = primary.resolution.clone();
            sec.stream_name = format!("{}-secondary", primary.stream_name);
            sec.camera_mac = primary.camera_mac;
            sec.controller_mac = 0;
            sec.on_actions = String::new();
            sec.off_actions = String::new();
            sec.shutdown_actions = String::new();
            sec.using_forwarder = true;
            sec.send_chat_msg = true;
            sec.sensor_list = primary.sensor_list.clone();
            sec.forwarder_host = primary.forwarder_host.clone();
            sec.enabled = true;
        })?;

        self.ctx
            .devices
            .set_var(primary.camera_mac, "HTTPAddress", &primary.forwarder_host)?;
        self.ctx.devices.set_var(primary.camera_mac, "Outputs", "HTTP")?;
        Ok(())
    }
}
