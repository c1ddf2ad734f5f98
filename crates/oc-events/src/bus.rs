//! The per-tick event bus.
//!
//! Single-threaded cooperative pub/sub bound to a tick's cancellable scope.
//! Delivery is fire-and-forget: FIFO per publish, handlers run to completion
//! before the next event, and secondary events published from inside a
//! handler are delivered before the outermost `publish` returns.  Once the
//! scope is cancelled every further publish diverts to the spill sink — the
//! persistent `events` list — and nothing else happens.
//!
//! Subscriptions happen at tick assembly, before the first publish.
//! Subscribing from inside a handler is not supported.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, trace, warn};

use crate::event::Event;

/// A handler error.  Logged by the bus, never rethrown, never aborts
/// sibling handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A bus subscriber.  Handlers receive every publish in subscription order
/// and may publish secondary events through the bus reference.
pub trait Subscriber: Send {
    /// Short name used in handler failure logs.
    fn name(&self) -> &'static str;

    fn handle(&mut self, event: &Event, bus: &Bus) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// TickScope
// ---------------------------------------------------------------------------

/// The cancellation scope of a single tick.
///
/// Cancellable by construction: cloning shares the flag, so the driver holds
/// one handle and the bus another.  Cancellation is one-way and permanent.
#[derive(Debug, Clone, Default)]
pub struct TickScope {
    cancelled: Arc<AtomicBool>,
}

impl TickScope {
    pub fn new() -> Self {
        TickScope {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type SpillSink = Box<dyn FnMut(&Event) + Send>;

/// The per-tick event bus.  Created fresh for every tick.
pub struct Bus {
    scope: TickScope,
    subscribers: Mutex<Vec<Box<dyn Subscriber>>>,
    queue: Mutex<VecDeque<Event>>,
    draining: AtomicBool,
    spill: Mutex<Option<SpillSink>>,
    self_ref: OnceLock<Weak<Bus>>,
}

impl Bus {
    pub fn new(scope: TickScope) -> Arc<Self> {
        let bus = Arc::new(Bus {
            scope,
            subscribers: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            spill: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        bus.self_ref
            .set(Arc::downgrade(&bus))
            .unwrap_or_else(|_| unreachable!("self_ref set once at construction"));
        bus
    }

    /// A shared handle to this bus, for handlers that hand the bus to a
    /// background task (e.g. a detached platform start call).
    pub fn shared(&self) -> Arc<Bus> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| unreachable!("bus outlives its own method call"))
    }

    pub fn scope(&self) -> &TickScope {
        &self.scope
    }

    /// Install the spill sink events are diverted to after cancellation.
    pub fn set_spill(&self, sink: impl FnMut(&Event) + Send + 'static) {
        *lock(&self.spill) = Some(Box::new(sink));
    }

    /// Append a handler.  Handlers receive every future publish in
    /// subscription order.
    pub fn subscribe(&self, sub: Box<dyn Subscriber>) {
        lock(&self.subscribers).push(sub);
    }

    /// Publish an event.
    ///
    /// If the scope is cancelled the event goes to the spill sink and no
    /// handler runs.  Otherwise the event is queued and the calling thread
    /// drains the queue, invoking every handler per event in subscription
    /// order.  Handler errors are logged and do not stop delivery.
    pub fn publish(&self, event: Event) {
        if self.scope.is_cancelled() {
            debug!(event = %event, "scope cancelled; spilling event");
            match lock(&self.spill).as_mut() {
                Some(sink) => sink(&event),
                None => warn!(event = %event, "no spill sink; event dropped"),
            }
            return;
        }

        trace!(event = %event, "publish");
        lock(&self.queue).push_back(event);

        // One drainer at a time; re-entrant publishes from handlers just
        // queue and are picked up by the active drain below.
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            loop {
                let next = lock(&self.queue).pop_front();
                let Some(ev) = next else { break };
                self.deliver(&ev);
            }
            self.draining.store(false, Ordering::SeqCst);
            // An event may have landed between the final pop and the flag
            // reset; reclaim the drain if so.
            if lock(&self.queue).is_empty() || self.draining.swap(true, Ordering::SeqCst) {
                break;
            }
        }
    }

    fn deliver(&self, event: &Event) {
        let mut subs = lock(&self.subscribers);
        for sub in subs.iter_mut() {
            if let Err(err) = sub.handle(event, self) {
                warn!(handler = sub.name(), event = %event, %err, "event handler failed");
            }
        }
    }
}

/// Poison-tolerant lock: a panicking handler must not wedge the tick.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records every delivered tag into a shared log.
    struct Tap {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Subscriber for Tap {
        fn name(&self) -> &'static str {
            "tap"
        }
        fn handle(&mut self, event: &Event, _bus: &Bus) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(event.tag());
            Ok(())
        }
    }

    /// Publishes `Finish` once, the first time it sees `Start`.
    struct Chainer {
        fired: bool,
    }

    impl Subscriber for Chainer {
        fn name(&self) -> &'static str {
            "chainer"
        }
        fn handle(&mut self, event: &Event, bus: &Bus) -> Result<(), HandlerError> {
            if matches!(event, Event::Start) && !self.fired {
                self.fired = true;
                bus.publish(Event::Finish);
            }
            Ok(())
        }
    }

    struct Failing;

    impl Subscriber for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn handle(&mut self, _event: &Event, _bus: &Bus) -> Result<(), HandlerError> {
            Err("deliberate".into())
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let bus = Bus::new(TickScope::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Box::new(Tap { log: log.clone() }));
        bus.publish(Event::Start);
        bus.publish(Event::Finish);
        assert_eq!(*log.lock().unwrap(), vec!["startEvent", "finishEvent"]);
    }

    #[test]
    fn secondary_events_deliver_before_publish_returns() {
        let bus = Bus::new(TickScope::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Box::new(Chainer { fired: false }));
        bus.subscribe(Box::new(Tap { log: log.clone() }));
        bus.publish(Event::Start);
        // By the time publish returns, the chained Finish has been seen.
        assert_eq!(*log.lock().unwrap(), vec!["startEvent", "finishEvent"]);
    }

    #[test]
    fn handler_error_does_not_abort_siblings() {
        let bus = Bus::new(TickScope::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Box::new(Failing));
        bus.subscribe(Box::new(Tap { log: log.clone() }));
        bus.publish(Event::Start);
        assert_eq!(*log.lock().unwrap(), vec!["startEvent"]);
    }

    #[test]
    fn cancelled_scope_spills_each_event_exactly_once() {
        let scope = TickScope::new();
        let bus = Bus::new(scope.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Box::new(Tap { log: log.clone() }));

        let spilled = Arc::new(Mutex::new(Vec::new()));
        let spilled2 = spilled.clone();
        bus.set_spill(move |ev| spilled2.lock().unwrap().push(ev.tag()));

        bus.publish(Event::Start);
        scope.cancel();
        bus.publish(Event::Finish);
        bus.publish(Event::HardwareStarted);

        assert_eq!(*log.lock().unwrap(), vec!["startEvent"]);
        assert_eq!(
            *spilled.lock().unwrap(),
            vec!["finishEvent", "hardwareStartedEvent"]
        );
    }

    #[test]
    fn publish_from_another_thread_lands_on_spill_after_cancel() {
        let scope = TickScope::new();
        let bus = Bus::new(scope.clone());
        let spilled = Arc::new(Mutex::new(Vec::new()));
        let spilled2 = spilled.clone();
        bus.set_spill(move |ev| spilled2.lock().unwrap().push(ev.tag()));
        scope.cancel();

        let shared = bus.shared();
        let t = std::thread::spawn(move || shared.publish(Event::Started));
        t.join().unwrap();
        assert_eq!(*spilled.lock().unwrap(), vec!["startedEvent"]);
    }
}
