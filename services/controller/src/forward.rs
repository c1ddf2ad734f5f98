//! Forwarder client.
//!
//! The forwarder bridges intermittent camera input into a persistent platform
//! stream by splicing in a slate video.  The controller only ever tells it
//! two things: pipe the camera through ("play") or run the slate loop, for a
//! given camera MAC and RTMP destinations.  Best-effort HTTP PUT with a
//! bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use oc_protocol::{BroadcastConfig, ForwarderRequest, broadcast_key, mac_hex, SECONDARY_SUFFIX};

use crate::platform::RTMP_DESTINATION_BASE;
use crate::store::EntityStore;

const FORWARDER_ATTEMPTS: usize = 3;
const FORWARDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("no forwarder host configured")]
    NoHost,
    #[error("forwarder request failed after {attempts} attempts: {last}")]
    Unreachable { attempts: usize, last: String },
    #[error("forwarder rejected request: {0}")]
    Rejected(String),
}

/// Options for a slate request.
#[derive(Debug, Clone, Default)]
pub struct SlateOptions {
    /// Slate variant to play, e.g. `"LowVoltage"`.  None selects the default.
    pub variant: Option<String>,
}

pub trait ForwarderControl: Send + Sync {
    /// Pipe the camera's MPEG-TS input through to the RTMP endpoints.
    fn stream(&self, cfg: &BroadcastConfig) -> Result<(), ForwarderError>;

    /// Play the slate loop to the RTMP endpoints.
    fn slate(&self, cfg: &BroadcastConfig, opts: &SlateOptions) -> Result<(), ForwarderError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// `ForwarderControl` over `PUT http://{forwarder-host}/control`.
pub struct HttpForwarder {
    client: reqwest::blocking::Client,
    store: Arc<dyn EntityStore>,
}

impl HttpForwarder {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(FORWARDER_TIMEOUT)
            .build()
            .unwrap_or_default();
        HttpForwarder { client, store }
    }

    /// Primary and secondary RTMP destinations for this broadcast, in order.
    /// The secondary URL comes from the `{name}(Secondary)` record when that
    /// record exists and holds a key.
    fn urls(&self, cfg: &BroadcastConfig) -> Vec<String> {
        let mut urls = Vec::with_capacity(2);
        if !cfg.rtmp_key.is_empty() {
            urls.push(format!("{RTMP_DESTINATION_BASE}{}", cfg.rtmp_key));
        }
        let secondary_name = format!("{}{SECONDARY_SUFFIX}", cfg.name);
        match self.store.get(&broadcast_key(cfg.skey, &secondary_name)) {
            Ok(Some(json)) => {
                if let Ok(secondary) = serde_json::from_str::<BroadcastConfig>(&json) {
                    if !secondary.rtmp_key.is_empty() {
                        urls.push(format!("{RTMP_DESTINATION_BASE}{}", secondary.rtmp_key));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(broadcast = %cfg.name, %e, "secondary record unreadable"),
        }
        urls
    }

    fn send(
        &self,
        cfg: &BroadcastConfig,
        status: &str,
        variant: Option<&str>,
    ) -> Result<(), ForwarderError> {
        if cfg.forwarder_host.is_empty() {
            return Err(ForwarderError::NoHost);
        }
        let mut url = format!("http://{}/control", cfg.forwarder_host);
        if let Some(variant) = variant {
            url.push_str("?type=");
            url.push_str(variant);
        }
        let body = ForwarderRequest {
            mac: mac_hex(cfg.camera_mac),
            urls: self.urls(cfg),
            status: status.to_owned(),
        };

        let mut last = String::new();
        for attempt in 1..=FORWARDER_ATTEMPTS {
            match self.client.put(&url).json(&body).send() {
                Ok(resp) if resp.status().is_success() => {
                    debug!(broadcast = %cfg.name, status, attempt, "forwarder accepted");
                    return Ok(());
                }
                Ok(resp) => {
                    return Err(ForwarderError::Rejected(format!(
                        "status {}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    warn!(broadcast = %cfg.name, status, attempt, %e, "forwarder attempt failed");
                    last = e.to_string();
                }
            }
        }
        Err(ForwarderError::Unreachable {
            attempts: FORWARDER_ATTEMPTS,
            last,
        })
    }
}

impl ForwarderControl for HttpForwarder {
    fn stream(&self, cfg: &BroadcastConfig) -> Result<(), ForwarderError> {
        self.send(cfg, "play", None)
    }

    fn slate(&self, cfg: &BroadcastConfig, opts: &SlateOptions) -> Result<(), ForwarderError> {
        self.send(cfg, "slate", opts.variant.as_deref())
    }
}
