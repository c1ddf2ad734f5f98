//! Per-tick assembly: wire the machines to a fresh bus, replay spilled
//! events, publish the time event, persist what results.
//!
//! The controller is stateless between ticks.  Everything below runs on the
//! tick's (blocking) thread; the only permitted escape is the detached
//! platform start call, whose completion publishes back to the bus and
//! spills once the scope is cancelled.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use oc_events::{Bus, Event, Subscriber, TickScope, bus::HandlerError};
use oc_protocol::{BroadcastConfig, Site};

use crate::clock::Clock;
use crate::device::DeviceStore;
use crate::forward::ForwarderControl;
use crate::manager::BroadcastManager;
use crate::media::MediaStore;
use crate::notify::{Notifier, NotifyHandler};
use crate::platform::{PlatformService, STATUS_LIVE};
use crate::sm::{BroadcastMachine, HardwareMachine, TickContext};
use crate::store::{EntityStore, StoreError};

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The injected collaborators shared by every tick.
#[derive(Clone)]
pub struct TickDeps {
    pub store: Arc<dyn EntityStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub media: Arc<dyn MediaStore>,
    pub platform: Arc<dyn PlatformService>,
    pub forwarder: Arc<dyn ForwarderControl>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    /// Spawn platform start calls on a detached thread.  Tests run inline.
    pub background_start: bool,
    /// Extra per-tick subscribers, appended after the built-in handlers.
    /// Each factory is invoked once per tick.
    pub hooks: Vec<Arc<dyn Fn() -> Box<dyn Subscriber> + Send + Sync>>,
}

impl TickDeps {
    fn context(&self, cfg: BroadcastConfig, site: &Site) -> Arc<TickContext> {
        TickContext::new(
            cfg,
            site.clone(),
            self.store.clone(),
            self.devices.clone(),
            self.media.clone(),
            self.platform.clone(),
            self.forwarder.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            self.background_start,
        )
    }
}

/// Run one tick for one broadcast.
///
/// The caller owns the scope and cancels it when the tick's request ends;
/// events published after that spill to the record and replay next tick.
pub fn run_tick(
    scope: &TickScope,
    deps: &TickDeps,
    site: &Site,
    cfg: BroadcastConfig,
) -> Result<Arc<TickContext>, TickError> {
    let ctx = deps.context(cfg, site);

    if !ctx.cfg().enabled {
        settle_disabled(&ctx);
        return Ok(ctx);
    }

    let bus = Bus::new(scope.clone());
    let spill_ctx = ctx.clone();
    bus.set_spill(move |ev| {
        let wire = ev.to_wire();
        debug!(broadcast = %spill_ctx.cfg().name, event = %ev, "spilling event to record");
        if let Err(e) = spill_ctx.save(&move |cfg| cfg.events.push(wire.clone())) {
            warn!(%e, "event spill failed; event lost");
        }
    });

    let broadcast_sm = BroadcastMachine::new(ctx.clone());
    let hardware_sm = HardwareMachine::new(ctx.clone());

    // Subscription order is part of the contract: notifications see every
    // event first, the machines react, the check fan-out runs last.
    let (name, suppress_rules) = {
        let cfg = ctx.cfg();
        (cfg.name.clone(), cfg.notify_suppress_rules.clone())
    };
    bus.subscribe(Box::new(NotifyHandler::new(
        ctx.site.skey,
        name,
        &suppress_rules,
        ctx.notifier.clone(),
    )));
    bus.subscribe(Box::new(broadcast_sm));
    bus.subscribe(Box::new(hardware_sm));
    bus.subscribe(Box::new(CheckHandler {
        manager: BroadcastManager::new(ctx.clone()),
    }));
    for hook in &deps.hooks {
        bus.subscribe(hook());
    }

    replay_spilled(&ctx, &bus);

    bus.publish(Event::Time { now: ctx.now() });
    Ok(ctx)
}

/// A disabled broadcast never runs a tick: derived start/transition flags
/// are forced off, and a platform broadcast left live is completed and its
/// id cleared.
fn settle_disabled(ctx: &TickContext) {
    let cfg = ctx.snapshot();
    if cfg.active || cfg.attempting_to_start || cfg.transitioning {
        ctx.save_logged("settle disabled flags", &|cfg| {
            cfg.active = false;
            cfg.attempting_to_start = false;
            cfg.transitioning = false;
        });
    }
    if cfg.broadcast_id.is_empty() {
        return;
    }
    match ctx.platform.broadcast_status(&cfg.broadcast_id) {
        Ok(status) if status == STATUS_LIVE => {
            info!(broadcast = %cfg.name, "disabled broadcast still live; completing");
            if let Err(e) = ctx.platform.complete_broadcast(&cfg.broadcast_id) {
                warn!(broadcast = %cfg.name, %e, "complete failed");
                return;
            }
            ctx.save_logged("clear completed broadcast id", &|cfg| {
                cfg.broadcast_id = String::new();
            });
        }
        Ok(_) => {}
        Err(e) => debug!(broadcast = %cfg.name, %e, "status unavailable for disabled broadcast"),
    }
}

/// Replay the events spilled after the previous tick was cancelled, oldest
/// first, then clear the list.
fn replay_spilled(ctx: &TickContext, bus: &Bus) {
    let spilled = ctx.cfg().events.clone();
    if spilled.is_empty() {
        return;
    }
    ctx.save_logged("drain spilled events", &|cfg| cfg.events.clear());
    for wire in &spilled {
        match Event::from_wire(wire) {
            Ok(ev) => {
                info!(broadcast = %ctx.cfg().name, event = %ev, "replaying spilled event");
                bus.publish(ev);
            }
            Err(e) => warn!(tag = %wire.tag, %e, "dropping unreadable spilled event"),
        }
    }
}

// ---------------------------------------------------------------------------
// Check fan-out
// ---------------------------------------------------------------------------

/// Turns the due events the broadcast machine publishes into manager calls;
/// the managers publish the resulting health/status events back.
struct CheckHandler {
    manager: BroadcastManager,
}

impl Subscriber for CheckHandler {
    fn name(&self) -> &'static str {
        "checks"
    }

    fn handle(&mut self, event: &Event, bus: &Bus) -> Result<(), HandlerError> {
        match event {
            Event::HealthCheckDue => self.manager.handle_health(bus).map_err(into_handler_err),
            Event::StatusCheckDue => self.manager.handle_status(bus).map_err(into_handler_err),
            Event::ChatMessageDue => self.manager.handle_chat_message().map_err(into_handler_err),
            _ => Ok(()),
        }
    }
}

fn into_handler_err(e: crate::manager::broadcast::BroadcastError) -> HandlerError {
    Box::new(e)
}
