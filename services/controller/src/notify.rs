//! Operator notifications and suppression rules.
//!
//! Every error-capable event dispatched on the tick bus is logged; unless a
//! suppress rule matches it is also forwarded to the notifier.  Delivery
//! transport (email, SMS) sits outside the core.

use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use oc_events::{Bus, Event, NotifyKind, Subscriber, bus::HandlerError};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification send failed: {0}")]
    Send(String),
}

pub trait Notifier: Send + Sync {
    fn send(&self, skey: i64, kind: NotifyKind, message: &str) -> Result<(), NotifyError>;
}

/// Notifier that only writes the site log.  Used when no delivery transport
/// is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, skey: i64, kind: NotifyKind, message: &str) -> Result<(), NotifyError> {
        error!(site = skey, kind = %kind, message, "notification");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Suppression rules
// ---------------------------------------------------------------------------

/// Parsed `notify-suppress-rules` JSON.  An empty source string means no
/// rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SuppressRules {
    #[serde(default, rename = "SuppressKinds")]
    pub suppress_kinds: Vec<String>,
    #[serde(default, rename = "SuppressContaining")]
    pub suppress_containing: Vec<String>,
}

impl SuppressRules {
    pub fn parse(source: &str) -> Result<Self, serde_json::Error> {
        if source.trim().is_empty() {
            return Ok(SuppressRules::default());
        }
        serde_json::from_str(source)
    }

    /// Should a notification of this kind and message be withheld?
    pub fn suppresses(&self, kind: NotifyKind, message: &str) -> bool {
        if self.suppress_kinds.iter().any(|k| k == kind.as_str()) {
            return true;
        }
        self.suppress_containing
            .iter()
            .any(|s| !s.is_empty() && message.contains(s))
    }
}

// ---------------------------------------------------------------------------
// Bus handler
// ---------------------------------------------------------------------------

/// Subscribed first on every tick bus: intercepts error-capable events and
/// converts them to notifications unless suppressed.
pub struct NotifyHandler {
    skey: i64,
    broadcast: String,
    rules: SuppressRules,
    notifier: Arc<dyn Notifier>,
}

impl NotifyHandler {
    pub fn new(
        skey: i64,
        broadcast: impl Into<String>,
        rules_source: &str,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let rules = SuppressRules::parse(rules_source).unwrap_or_else(|e| {
            warn!(site = skey, %e, "bad notify-suppress-rules; ignoring");
            SuppressRules::default()
        });
        NotifyHandler {
            skey,
            broadcast: broadcast.into(),
            rules,
            notifier,
        }
    }
}

impl Subscriber for NotifyHandler {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn handle(&mut self, event: &Event, _bus: &Bus) -> Result<(), HandlerError> {
        if event.kind().is_none() {
            return Ok(());
        }
        let kind = event.resolved_kind();
        let message = format!("broadcast {}: {event}", self.broadcast);
        if self.rules.suppresses(kind, &message) {
            warn!(site = self.skey, kind = %kind, %message, "suppressed notification");
            return Ok(());
        }
        warn!(site = self.skey, kind = %kind, %message, "dispatching notification");
        self.notifier
            .send(self.skey, kind, &message)
            .map_err(|e| Box::new(e) as HandlerError)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
