//! The abstract video platform contract the broadcast manager consumes.
//!
//! The concrete client bindings (OAuth, quota handling, API surface) live
//! outside the control core; deployments inject an implementation.  The
//! default build runs disconnected and reports every call as unavailable,
//! which the machines treat as logged-and-continue.

use chrono::{DateTime, Utc};
use thiserror::Error;

// Known status strings returned by `broadcast_status`.  Empty means unknown.
pub const STATUS_UPCOMING: &str = "upcoming";
pub const STATUS_LIVE: &str = "live";
pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_REVOKED: &str = "revoked";

/// Base of RTMP ingestion URLs; the stream key is appended.
pub const RTMP_DESTINATION_BASE: &str = "rtmp://ingest.example.com/live2/";

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform has no broadcast items for the queried id.  Carries the
    /// status string when the response reported one anyway.
    #[error("no broadcast items")]
    NoBroadcastItems { status: String },
    #[error("platform bindings not configured")]
    Unavailable,
    #[error("platform request failed: {0}")]
    Request(String),
}

/// Identifiers of one platform broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastIds {
    pub broadcast_id: String,
    pub stream_id: String,
    pub chat_id: String,
}

/// Parameters for creating a scheduled broadcast.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub description: String,
    pub stream_name: String,
    pub privacy: String,
    pub resolution: String,
    pub account: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub trait PlatformService: Send + Sync {
    /// Create a scheduled broadcast; returns its ids and the RTMP key.
    fn create_broadcast(&self, req: &CreateRequest) -> Result<(BroadcastIds, String), PlatformError>;

    /// Transition the broadcast towards live.  Blocking; the manager decides
    /// whether to run it on a background thread.
    fn start_broadcast(
        &self,
        name: &str,
        broadcast_id: &str,
        stream_id: &str,
    ) -> Result<(), PlatformError>;

    fn broadcast_status(&self, broadcast_id: &str) -> Result<String, PlatformError>;

    fn broadcast_scheduled_start(
        &self,
        broadcast_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PlatformError>;

    /// Empty string means healthy; anything else is an actionable issue.
    fn broadcast_health(&self, stream_id: &str) -> Result<String, PlatformError>;

    fn rtmp_key(&self, stream_name: &str) -> Result<String, PlatformError>;

    fn complete_broadcast(&self, broadcast_id: &str) -> Result<(), PlatformError>;

    fn post_chat_message(&self, chat_id: &str, msg: &str) -> Result<(), PlatformError>;

    fn set_broadcast_privacy(&self, broadcast_id: &str, privacy: &str)
    -> Result<(), PlatformError>;
}

/// The placeholder service wired when no platform bindings are injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedPlatform;

impl PlatformService for DisconnectedPlatform {
    fn create_broadcast(
        &self,
        _req: &CreateRequest,
    ) -> Result<(BroadcastIds, String), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn start_broadcast(
        &self,
        _name: &str,
        _broadcast_id: &str,
        _stream_id: &str,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn broadcast_status(&self, _broadcast_id: &str) -> Result<String, PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn broadcast_scheduled_start(
        &self,
        _broadcast_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn broadcast_health(&self, _stream_id: &str) -> Result<String, PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn rtmp_key(&self, _stream_name: &str) -> Result<String, PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn complete_broadcast(&self, _broadcast_id: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn post_chat_message(&self, _chat_id: &str, _msg: &str) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    fn set_broadcast_privacy(
        &self,
        _broadcast_id: &str,
        _privacy: &str,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }
}

/// Is this status terminal for reuse purposes?
pub fn is_terminal_status(status: &str) -> bool {
    status == STATUS_COMPLETE || status == STATUS_REVOKED
}
