//! The tick driver: one sweep over a site's broadcasts.
//!
//! Invoked by the authenticated `/checkbroadcasts` trigger.  Each broadcast
//! ticks inside its own cancellable scope; the scope is cancelled as soon as
//! its tick returns, so anything still in flight (a detached platform start)
//! spills its events for the next sweep.  A failing broadcast never aborts
//! the sweep.

use thiserror::Error;
use tracing::{info, warn};

use oc_events::TickScope;
use oc_protocol::{BroadcastConfig, Site, broadcast_key_prefix, site_key};

use crate::store::{EntityStore, StoreError};
use crate::system::{TickDeps, run_tick};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one site sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub broadcasts: usize,
    pub failures: usize,
}

pub struct TickDriver {
    deps: TickDeps,
}

impl TickDriver {
    pub fn new(deps: TickDeps) -> Self {
        TickDriver { deps }
    }

    /// Tick every broadcast configured for the site, in key order.
    ///
    /// Only one sweep per site should run at a time; the HTTP trigger is
    /// expected not to overlap its own requests.
    pub fn tick_site(&self, skey: i64) -> Result<SweepSummary, DriverError> {
        let site = self.load_site(skey)?;
        let keys = self.deps.store.list_keys(&broadcast_key_prefix(skey))?;
        let mut summary = SweepSummary::default();

        for key in keys {
            let Some(json) = self.deps.store.get(&key)? else {
                continue;
            };
            let cfg: BroadcastConfig = match serde_json::from_str(&json) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%key, %e, "skipping unreadable broadcast record");
                    summary.failures += 1;
                    continue;
                }
            };
            summary.broadcasts += 1;

            let scope = TickScope::new();
            let result = run_tick(&scope, &self.deps, &site, cfg);
            // The tick has returned; anything still running must spill.
            scope.cancel();
            if let Err(e) = result {
                warn!(%key, %e, "tick failed");
                summary.failures += 1;
            }
        }

        info!(
            site = skey,
            broadcasts = summary.broadcasts,
            failures = summary.failures,
            "site sweep complete"
        );
        Ok(summary)
    }

    fn load_site(&self, skey: i64) -> Result<Site, DriverError> {
        match self.deps.store.get(&site_key(skey))? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(site) => Ok(site),
                Err(e) => {
                    warn!(site = skey, %e, "unreadable site record; using defaults");
                    Ok(default_site(skey))
                }
            },
            None => Ok(default_site(skey)),
        }
    }
}

fn default_site(skey: i64) -> Site {
    Site {
        skey,
        name: format!("site-{skey}"),
        utc_offset_mins: 0,
        notify_recipient: String::new(),
    }
}
