//! The coupled state machines and their shared per-tick context.

pub mod broadcast;
pub mod broadcast_state;
pub mod hardware;
pub mod hardware_state;

pub use broadcast::BroadcastMachine;
pub use broadcast_state::BroadcastState;
pub use hardware::HardwareMachine;
pub use hardware_state::HardwareState;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use oc_events::NotifyKind;
use oc_protocol::{BroadcastConfig, Site};

use crate::clock::Clock;
use crate::device::DeviceStore;
use crate::forward::ForwarderControl;
use crate::media::MediaStore;
use crate::notify::Notifier;
use crate::platform::PlatformService;
use crate::store::{ConfigStore, EntityStore, StoreError};

// ---------------------------------------------------------------------------
// TickContext
// ---------------------------------------------------------------------------

/// Everything one tick's collaborators share: the config record, the
/// injected services, and the clock.  Built fresh per tick, never global.
pub struct TickContext {
    cfg: Mutex<BroadcastConfig>,
    pub site: Site,
    pub config_store: ConfigStore,
    pub store: Arc<dyn EntityStore>,
    pub devices: Arc<dyn DeviceStore>,
    pub media: Arc<dyn MediaStore>,
    pub platform: Arc<dyn PlatformService>,
    pub forwarder: Arc<dyn ForwarderControl>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    /// Run platform start calls on a detached thread.  Tests run inline.
    pub background_start: bool,
}

impl TickContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The in-memory view of the config record.
    ///
    /// Never hold this guard across a `save` or a bus publish.
    pub fn cfg(&self) -> MutexGuard<'_, BroadcastConfig> {
        self.cfg
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> BroadcastConfig {
        self.cfg().clone()
    }

    /// Transactionally apply `update` to the stored record and, on success,
    /// to the in-memory view, so callers see the post-image.
    pub fn save(&self, update: &dyn Fn(&mut BroadcastConfig)) -> Result<(), StoreError> {
        self.config_store.save(update)?;
        update(&mut self.cfg());
        Ok(())
    }

    /// `save`, with store failures logged and swallowed — the machines treat
    /// a failed save as retry-next-tick.
    pub fn save_logged(&self, what: &str, update: &dyn Fn(&mut BroadcastConfig)) {
        if let Err(e) = self.save(update) {
            warn!(broadcast = %self.cfg().name, what, %e, "config save failed; continuing");
        }
    }

    /// Send an operator notification directly (outside the error-event
    /// path), logging delivery failures.
    pub fn notify(&self, kind: NotifyKind, message: &str) {
        let skey = self.site.skey;
        if let Err(e) = self.notifier.send(skey, kind, message) {
            warn!(site = skey, %e, "notification send failed");
        }
    }

    /// The site's fixed UTC offset.
    pub fn site_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.site.utc_offset_mins * 60).unwrap_or_else(|| Utc.fix())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: BroadcastConfig,
        site: Site,
        store: Arc<dyn EntityStore>,
        devices: Arc<dyn DeviceStore>,
        media: Arc<dyn MediaStore>,
        platform: Arc<dyn PlatformService>,
        forwarder: Arc<dyn ForwarderControl>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        background_start: bool,
    ) -> Arc<Self> {
        let config_store = ConfigStore::new(store.clone(), cfg.skey, cfg.name.clone());
        Arc::new(TickContext {
            cfg: Mutex::new(cfg),
            site,
            config_store,
            store,
            devices,
            media,
            platform,
            forwarder,
            notifier,
            clock,
            background_start,
        })
    }
}

// ---------------------------------------------------------------------------
// Timed state data
// ---------------------------------------------------------------------------

/// Entry timestamp plus timeout, shared by every state with a deadline.
/// Timeouts are wall-clock since entry and observed only on time events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timed {
    pub last_entered: DateTime<Utc>,
    pub timeout_secs: i64,
}

impl Timed {
    pub fn new(now: DateTime<Utc>, timeout_secs: i64) -> Self {
        Timed {
            last_entered: now,
            timeout_secs,
        }
    }

    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        now - self.last_entered > chrono::Duration::seconds(self.timeout_secs)
    }

    /// Restart the deadline from `now` with a fresh duration.
    pub fn reset(&mut self, now: DateTime<Utc>, timeout_secs: i64) {
        self.last_entered = now;
        self.timeout_secs = timeout_secs;
    }
}

impl Default for Timed {
    fn default() -> Self {
        Timed {
            last_entered: DateTime::<Utc>::MIN_UTC,
            timeout_secs: 0,
        }
    }
}
