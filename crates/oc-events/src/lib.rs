// oc-events: Event variants, the tag registry, and the per-tick event bus.
//
// Events round-trip through persisted configuration as `{type, message?,
// cause?}` records (`oc_protocol::WireEvent`); the registry maps the stable
// string tags back to fresh values so the reader never needs the concrete
// type at compile time.

pub mod bus;
pub mod event;
pub mod registry;

pub use bus::{Bus, Subscriber, TickScope};
pub use event::{Cause, Event, EventError, NotifyKind};
pub use registry::{Registry, event_registry};
