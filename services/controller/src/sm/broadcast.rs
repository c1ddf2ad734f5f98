//! The broadcast state machine: the higher-level broadcast lifecycle.
//!
//! Owns starting, live, slate transitions, health handling and the failure
//! policies, and drives the hardware machine through request events on the
//! shared bus.  Constructing the machine also renormalises the daily
//! schedule and decodes the current state from the record's derived flags.

use std::sync::Arc;
use tracing::{debug, info, warn};

use chrono::{DateTime, TimeZone, Utc};
use oc_events::{Bus, Cause, Event, NotifyKind, Subscriber, bus::HandlerError};

use crate::forward::{ForwarderControl as _, SlateOptions};
use crate::manager::BroadcastManager;
use crate::manager::broadcast::BroadcastError;

use super::broadcast_state::{
    BroadcastState, FIX_INTERVAL_SECS, Family, LiveData, MAX_FIX_ATTEMPTS, MAX_START_FAILURES,
    STARTING_TIMEOUT_SECS, TRANSITION_TIMEOUT_SECS, UnhealthyData, VOLTAGE_WAIT_SLACK_SECS,
};
use super::broadcast_state::{
    CHAT_MSG_INTERVAL_SECS, HEALTH_CHECK_INTERVAL_SECS, STATUS_CHECK_INTERVAL_SECS,
};
use super::{TickContext, Timed};

pub struct BroadcastMachine {
    ctx: Arc<TickContext>,
    manager: BroadcastManager,
    state: BroadcastState,
}

impl BroadcastMachine {
    /// Normalise the schedule to today's site-local date, then decode the
    /// current state from the record.
    pub fn new(ctx: Arc<TickContext>) -> Self {
        normalize_schedule(&ctx);
        let state = BroadcastState::from_cfg(&ctx.cfg());
        let manager = BroadcastManager::new(ctx.clone());
        BroadcastMachine {
            ctx,
            manager,
            state,
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.state
    }

    fn family(&self) -> Family {
        self.state.family()
    }

    fn in_window(&self, now: DateTime<Utc>) -> bool {
        let cfg = self.ctx.cfg();
        cfg.start <= now && now < cfg.end
    }

    fn past_end(&self, now: DateTime<Utc>) -> bool {
        now >= self.ctx.cfg().end
    }

    // -----------------------------------------------------------------------
    // Entry actions
    // -----------------------------------------------------------------------

    /// Ensure a platform broadcast exists and kick off the start sequence:
    /// hardware first for the families that own a camera, straight to the
    /// live transition for the secondary.
    fn enter_starting(&self, bus: &Bus) -> BroadcastState {
        let timed = Timed::new(self.ctx.now(), STARTING_TIMEOUT_SECS);
        match self.manager.create_broadcast() {
            Ok(()) => match self.family() {
                Family::Secondary => self.manager.start_broadcast(bus),
                Family::Permanent | Family::Direct => {
                    bus.publish(Event::HardwareStartRequest);
                }
            },
            Err(BroadcastError::RequestLimitExceeded) => {
                bus.publish(Event::CriticalFailure {
                    cause: Some(Cause::generic("broadcast create request limit exceeded")),
                });
            }
            Err(e) => {
                bus.publish(Event::StartFailed {
                    cause: Some(Cause::generic(format!("broadcast create failed: {e}"))),
                });
            }
        }
        match self.family() {
            Family::Permanent => BroadcastState::PermStarting(timed),
            Family::Secondary => BroadcastState::SecStarting(timed),
            Family::Direct => BroadcastState::DirectStarting(timed),
        }
    }

    fn enter_live(&self, live: LiveData) -> BroadcastState {
        match self.family() {
            Family::Permanent => {
                self.request_forwarder_stream();
                BroadcastState::PermLive(live)
            }
            Family::Secondary => BroadcastState::SecLive(live),
            Family::Direct => BroadcastState::DirectLive(live),
        }
    }

    fn enter_failure(&self) -> BroadcastState {
        match self.family() {
            Family::Permanent => {
                self.request_forwarder_slate(None);
                BroadcastState::PermFailure
            }
            Family::Direct => BroadcastState::DirectFailure,
            // The secondary has no failure mode of its own; it idles.
            Family::Secondary => BroadcastState::SecIdle,
        }
    }

    fn request_forwarder_stream(&self) {
        let cfg = self.ctx.snapshot();
        if let Err(e) = self.ctx.forwarder.stream(&cfg) {
            warn!(broadcast = %cfg.name, %e, "forwarder stream request failed");
            self.ctx.notify(
                NotifyKind::Forwarder,
                &format!("broadcast {}: forwarder stream request failed: {e}", cfg.name),
            );
        }
    }

    fn request_forwarder_slate(&self, variant: Option<&str>) {
        let cfg = self.ctx.snapshot();
        let opts = SlateOptions {
            variant: variant.map(str::to_owned),
        };
        if let Err(e) = self.ctx.forwarder.slate(&cfg, &opts) {
            warn!(broadcast = %cfg.name, %e, "forwarder slate request failed");
            self.ctx.notify(
                NotifyKind::Forwarder,
                &format!("broadcast {}: forwarder slate request failed: {e}", cfg.name),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Failure policies
    // -----------------------------------------------------------------------

    /// Count a start failure; repeated failures disable the broadcast and
    /// notify the operator.
    fn note_start_failure(&self, reason: &str) {
        let failures = self.ctx.cfg().start_failures + 1;
        if failures >= MAX_START_FAILURES {
            let name = self.ctx.cfg().name.clone();
            warn!(broadcast = %name, reason, "disabling broadcast after repeated start failures");
            self.ctx.save_logged("start failure policy", &|cfg| {
                cfg.start_failures = 0;
                cfg.enabled = false;
            });
            self.ctx.notify(
                NotifyKind::Hardware,
                &format!("broadcast {name} disabled after {MAX_START_FAILURES} failed start attempts: {reason}"),
            );
        } else {
            self.ctx
                .save_logged("start failure count", &move |cfg| {
                    cfg.start_failures = failures;
                });
        }
    }

    // -----------------------------------------------------------------------
    // Time handling
    // -----------------------------------------------------------------------

    fn on_time(&mut self, now: DateTime<Utc>, bus: &Bus) {
        use BroadcastState as S;
        match self.state {
            S::PermIdle | S::SecIdle | S::DirectIdle => {
                let enabled = self.ctx.cfg().enabled;
                if enabled && self.in_window(now) {
                    bus.publish(Event::Start);
                    self.state = self.enter_starting(bus);
                }
            }

            S::PermStarting(t) | S::SecStarting(t) | S::DirectStarting(t) => {
                if t.timed_out(now) {
                    self.note_start_failure("start attempt timed out");
                    self.state = self.family().idle();
                }
            }

            S::PermLive(live) => {
                let live = self.cadence(live, now, bus);
                if self.past_end(now) {
                    bus.publish(Event::Finish);
                }
                self.state = S::PermLive(live);
            }
            S::SecLive(live) => {
                let live = self.cadence(live, now, bus);
                if self.past_end(now) {
                    bus.publish(Event::Finish);
                }
                self.state = S::SecLive(live);
            }
            S::DirectLive(live) => {
                let live = self.cadence(live, now, bus);
                if self.past_end(now) {
                    bus.publish(Event::Finish);
                }
                self.state = S::DirectLive(live);
            }

            S::PermLiveUnhealthy(d) => {
                let d = self.unhealthy_tick(d, now, bus, true);
                if self.past_end(now) {
                    bus.publish(Event::Finish);
                }
                self.state = S::PermLiveUnhealthy(d);
            }
            S::SecLiveUnhealthy(d) => {
                // The secondary owns no hardware; it just keeps watching.
                let live = self.cadence(d.live, now, bus);
                if self.past_end(now) {
                    bus.publish(Event::Finish);
                }
                self.state = S::SecLiveUnhealthy(UnhealthyData { live, ..d });
            }
            S::DirectLiveUnhealthy(d) => {
                let d = self.unhealthy_tick(d, now, bus, false);
                if self.past_end(now) {
                    bus.publish(Event::Finish);
                }
                self.state = S::DirectLiveUnhealthy(d);
            }

            S::PermSlate(live) => {
                let live = self.cadence(live, now, bus);
                self.state = S::PermSlate(live);
                if self.in_window(now) {
                    bus.publish(Event::HardwareStartRequest);
                    self.state = S::PermTransitionSlateToLive(Timed::new(
                        now,
                        TRANSITION_TIMEOUT_SECS,
                    ));
                }
            }
            S::PermSlateUnhealthy(d) => {
                let d = self.unhealthy_tick(d, now, bus, true);
                self.state = S::PermSlateUnhealthy(d);
            }

            S::PermTransitionLiveToSlate(t) => {
                if t.timed_out(now) {
                    let name = self.ctx.cfg().name.clone();
                    warn!(broadcast = %name, "slate transition timed out; falling back to live");
                    self.ctx.notify(
                        NotifyKind::Software,
                        &format!("broadcast {name}: transition to slate timed out"),
                    );
                    self.state = self.enter_live(LiveData::default());
                }
            }
            S::PermTransitionSlateToLive(t) => {
                if t.timed_out(now) {
                    let name = self.ctx.cfg().name.clone();
                    warn!(broadcast = %name, "live transition timed out; falling back to slate");
                    self.ctx.notify(
                        NotifyKind::Software,
                        &format!("broadcast {name}: transition to live timed out"),
                    );
                    self.request_forwarder_slate(None);
                    self.state = S::PermSlate(LiveData::default());
                }
            }

            S::PermVoltageRecoverySlate(t) => {
                if t.timed_out(now) {
                    self.state = self.enter_failure();
                }
            }

            S::PermFailure | S::DirectFailure => {}
        }
    }

    /// Publish the periodic check events that have come due, stamping the
    /// live data.
    fn cadence(&self, mut live: LiveData, now: DateTime<Utc>, bus: &Bus) -> LiveData {
        let checking_health = self.ctx.cfg().checking_health;
        if checking_health
            && (now - live.last_health_check).num_seconds() > HEALTH_CHECK_INTERVAL_SECS
        {
            bus.publish(Event::HealthCheckDue);
            live.last_health_check = now;
        }
        if (now - live.last_status_check).num_seconds() > STATUS_CHECK_INTERVAL_SECS {
            bus.publish(Event::StatusCheckDue);
            live.last_status_check = now;
        }
        if (now - live.last_chat_msg).num_seconds() > CHAT_MSG_INTERVAL_SECS {
            bus.publish(Event::ChatMessageDue);
            live.last_chat_msg = now;
        }
        live
    }

    /// The unhealthy fix policy: every five minutes reset the hardware (and
    /// re-request the forwarder stream when one is in play); the attempt
    /// after the last publishes `fixFailureEvent`.
    fn unhealthy_tick(
        &self,
        mut d: UnhealthyData,
        now: DateTime<Utc>,
        bus: &Bus,
        with_forwarder: bool,
    ) -> UnhealthyData {
        d.live = self.cadence(d.live, now, bus);
        if (now - d.last_fix_attempt).num_seconds() <= FIX_INTERVAL_SECS {
            return d;
        }
        d.last_fix_attempt = now;
        if d.fix_attempts < MAX_FIX_ATTEMPTS {
            d.fix_attempts += 1;
            info!(
                broadcast = %self.ctx.cfg().name,
                attempt = d.fix_attempts,
                "unhealthy; resetting hardware"
            );
            bus.publish(Event::HardwareResetRequest);
            if with_forwarder {
                self.request_forwarder_stream();
            }
        } else {
            bus.publish(Event::FixFailure {
                cause: Some(Cause::generic("stream health did not recover after resets")),
            });
        }
        d
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    fn on_start(&mut self, bus: &Bus) {
        use BroadcastState as S;
        if matches!(self.state, S::PermIdle | S::SecIdle | S::DirectIdle) {
            // A replayed or external start request while idle.
            self.state = self.enter_starting(bus);
        }
    }

    fn on_hardware_started(&mut self, bus: &Bus) {
        use BroadcastState as S;
        match self.state {
            // Hardware is up; ask the platform to go live.
            S::PermStarting(_) | S::DirectStarting(_) => self.manager.start_broadcast(bus),
            S::PermTransitionSlateToLive(_) => {
                self.state = self.enter_live(LiveData::default());
            }
            _ => {}
        }
    }

    fn on_started(&mut self) {
        use BroadcastState as S;
        match self.state {
            S::PermStarting(_) | S::SecStarting(_) | S::DirectStarting(_) => {
                info!(broadcast = %self.ctx.cfg().name, "broadcast live");
                self.ctx.save_logged("start counters", &|cfg| {
                    cfg.start_failures = 0;
                });
                self.state = self.enter_live(LiveData::default());
            }
            _ => {}
        }
    }

    fn on_start_failed(&mut self, event: &Event) {
        use BroadcastState as S;
        if matches!(
            self.state,
            S::PermStarting(_) | S::SecStarting(_) | S::DirectStarting(_)
        ) {
            self.note_start_failure(&event.to_string());
            self.state = self.family().idle();
        }
    }

    fn on_finish(&mut self, bus: &Bus) {
        use BroadcastState as S;
        match self.state {
            S::PermLive(_) | S::PermLiveUnhealthy(_) => {
                bus.publish(Event::HardwareStopRequest);
                self.request_forwarder_slate(None);
                self.state =
                    S::PermTransitionLiveToSlate(Timed::new(self.ctx.now(), TRANSITION_TIMEOUT_SECS));
            }
            S::SecLive(_) | S::SecLiveUnhealthy(_) => {
                if let Err(e) = self.manager.stop_broadcast() {
                    warn!(broadcast = %self.ctx.cfg().name, %e, "stop broadcast failed");
                }
                self.state = S::SecIdle;
            }
            S::DirectLive(_) | S::DirectLiveUnhealthy(_) => {
                if let Err(e) = self.manager.stop_broadcast() {
                    warn!(broadcast = %self.ctx.cfg().name, %e, "stop broadcast failed");
                }
                bus.publish(Event::HardwareStopRequest);
                self.state = S::DirectIdle;
            }
            _ => {}
        }
    }

    fn on_hardware_stopped(&mut self) {
        use BroadcastState as S;
        if matches!(self.state, S::PermTransitionLiveToSlate(_)) {
            self.state = S::PermSlate(LiveData::default());
        }
    }

    fn on_good_health(&mut self) {
        use BroadcastState as S;
        match self.state {
            S::PermLiveUnhealthy(d) => self.state = S::PermLive(d.live),
            S::PermSlateUnhealthy(d) => self.state = S::PermSlate(d.live),
            S::SecLiveUnhealthy(d) => self.state = S::SecLive(d.live),
            S::DirectLiveUnhealthy(d) => self.state = S::DirectLive(d.live),
            _ => {}
        }
    }

    fn on_bad_health(&mut self, event: &Event) {
        use BroadcastState as S;
        let issue = match event {
            Event::BadHealth { issue } => issue.clone(),
            _ => String::new(),
        };
        match self.state {
            S::PermLive(live) => {
                warn!(broadcast = %self.ctx.cfg().name, %issue, "stream unhealthy");
                self.state = S::PermLiveUnhealthy(UnhealthyData::from_live(live));
            }
            S::PermSlate(live) => {
                self.state = S::PermSlateUnhealthy(UnhealthyData::from_live(live));
            }
            S::SecLive(live) => self.state = S::SecLiveUnhealthy(UnhealthyData::from_live(live)),
            S::DirectLive(live) => {
                warn!(broadcast = %self.ctx.cfg().name, %issue, "stream unhealthy");
                self.state = S::DirectLiveUnhealthy(UnhealthyData::from_live(live));
            }
            _ => {}
        }
    }

    fn on_fix_failure(&mut self) {
        use BroadcastState as S;
        if matches!(
            self.state,
            S::PermLiveUnhealthy(_) | S::PermSlateUnhealthy(_) | S::DirectLiveUnhealthy(_)
        ) {
            self.state = self.enter_failure();
        }
    }

    fn on_low_voltage(&mut self) {
        use BroadcastState as S;
        let now = self.ctx.now();
        let recovery_secs = self.ctx.cfg().voltage_recovery_timeout_hours * 3600;
        match self.state {
            // A start attempt waits out the battery: extend its deadline by
            // the recovery window plus slack.
            S::PermStarting(mut t) => {
                t.reset(now, recovery_secs + VOLTAGE_WAIT_SLACK_SECS);
                self.state = S::PermStarting(t);
            }
            S::SecStarting(mut t) => {
                t.reset(now, recovery_secs + VOLTAGE_WAIT_SLACK_SECS);
                self.state = S::SecStarting(t);
            }
            S::DirectStarting(mut t) => {
                t.reset(now, recovery_secs + VOLTAGE_WAIT_SLACK_SECS);
                self.state = S::DirectStarting(t);
            }
            S::PermTransitionSlateToLive(_) => {
                self.request_forwarder_slate(Some("LowVoltage"));
                self.state = S::PermVoltageRecoverySlate(Timed::new(now, recovery_secs));
            }
            _ => {}
        }
    }

    fn on_voltage_recovered(&mut self, bus: &Bus) {
        use BroadcastState as S;
        if matches!(self.state, S::PermVoltageRecoverySlate(_)) {
            bus.publish(Event::HardwareStartRequest);
            self.state =
                S::PermTransitionSlateToLive(Timed::new(self.ctx.now(), TRANSITION_TIMEOUT_SECS));
        }
    }

    fn on_controller_failure(&mut self, event: &Event) {
        use BroadcastState as S;
        if matches!(
            self.state,
            S::PermStarting(_) | S::SecStarting(_) | S::DirectStarting(_)
        ) {
            self.note_start_failure(&event.to_string());
            self.state = self.family().idle();
        }
    }

    fn on_invalid_configuration(&mut self, event: &Event) {
        warn!(broadcast = %self.ctx.cfg().name, event = %event, "invalid configuration; disabling");
        self.ctx
            .save_logged("disable on invalid configuration", &|cfg| {
                cfg.enabled = false;
            });
        self.state = self.family().idle();
    }

    /// Write the flag tuple, tag and data back onto the record.
    fn persist(&self) {
        let state = self.state;
        self.ctx
            .save_logged("broadcast state", &move |cfg| state.update_cfg(cfg));
    }
}

impl Subscriber for BroadcastMachine {
    fn name(&self) -> &'static str {
        "broadcast-sm"
    }

    fn handle(&mut self, event: &Event, bus: &Bus) -> Result<(), HandlerError> {
        let before = self.state;
        match event {
            Event::Time { now } => self.on_time(*now, bus),
            Event::Start => self.on_start(bus),
            Event::Started => self.on_started(),
            Event::StartFailed { .. } | Event::CriticalFailure { .. } => {
                self.on_start_failed(event);
            }
            Event::Finish => self.on_finish(bus),
            Event::GoodHealth => self.on_good_health(),
            Event::BadHealth { .. } => self.on_bad_health(event),
            Event::FixFailure { .. } => self.on_fix_failure(),
            Event::HardwareStarted => self.on_hardware_started(bus),
            Event::HardwareStopped => self.on_hardware_stopped(),
            Event::LowVoltage => self.on_low_voltage(),
            Event::VoltageRecovered => self.on_voltage_recovered(bus),
            Event::ControllerFailure { .. } => self.on_controller_failure(event),
            Event::InvalidConfiguration { .. } => self.on_invalid_configuration(event),
            _ => {}
        }
        if before != self.state {
            debug!(
                broadcast = %self.ctx.cfg().name,
                from = before.tag(),
                to = self.state.tag(),
                event = %event,
                "broadcast transition"
            );
        }
        self.persist();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Schedule normalisation
// ---------------------------------------------------------------------------

/// Rewrite the schedule onto today's site-local calendar date, preserving
/// the configured time of day.  Broadcasts repeat daily by construction.
fn normalize_schedule(ctx: &TickContext) {
    let (start, end) = {
        let cfg = ctx.cfg();
        (cfg.start, cfg.end)
    };
    if start == DateTime::<Utc>::MIN_UTC && end == DateTime::<Utc>::MIN_UTC {
        return;
    }
    let offset = ctx.site_offset();
    let today = ctx.now().with_timezone(&offset).date_naive();
    let renormalize = |t: DateTime<Utc>| -> DateTime<Utc> {
        let local_time = t.with_timezone(&offset).time();
        match offset.from_local_datetime(&today.and_time(local_time)) {
            chrono::LocalResult::Single(local) | chrono::LocalResult::Ambiguous(local, _) => {
                local.with_timezone(&Utc)
            }
            chrono::LocalResult::None => t,
        }
    };
    let (new_start, new_end) = (renormalize(start), renormalize(end));
    if new_start != start || new_end != end {
        ctx.save_logged("schedule normalisation", &move |cfg| {
            cfg.start = new_start;
            cfg.end = new_end;
        });
    }
}
