//! Shared create-rate limiter.
//!
//! One token bucket for the whole service, persisted in the entity store so
//! every instance and every broadcast draws from the same budget.  A consumed
//! token covers a single create attempt — retries consume additional tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::store::{EntityStore, StoreError};

/// Fixed store scope of the bucket.
pub const TOKEN_BUCKET_KEY: &str = "token_bucket.ocean_token_bucket";

pub const BUCKET_CAPACITY: f64 = 30.0;
pub const BUCKET_REFILL_PER_HOUR: f64 = 2.0;

/// The persisted bucket value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

/// Token bucket limiter over the entity store.
///
/// Every attempt is a read-modify-write: refill by elapsed time (clamped to
/// capacity), then consume one token if at least one is available.  The
/// post-attempt state persists whether or not a token was granted.
pub struct OceanTokenBucketLimiter {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    capacity: f64,
    refill_per_hour: f64,
}

impl OceanTokenBucketLimiter {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        OceanTokenBucketLimiter {
            store,
            clock,
            capacity: BUCKET_CAPACITY,
            refill_per_hour: BUCKET_REFILL_PER_HOUR,
        }
    }

    /// Try to take one token.  Returns whether the attempt is allowed.
    pub fn request_token(&self) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut granted = false;
        self.store.update(TOKEN_BUCKET_KEY, &mut |current| {
            let mut bucket = match current {
                Some(json) => serde_json::from_str::<BucketState>(&json)?,
                None => BucketState {
                    tokens: self.capacity,
                    last_refill: now,
                },
            };
            let elapsed_hours =
                (now - bucket.last_refill).num_milliseconds() as f64 / 3_600_000.0;
            if elapsed_hours > 0.0 {
                bucket.tokens =
                    (bucket.tokens + elapsed_hours * self.refill_per_hour).min(self.capacity);
            }
            bucket.last_refill = now;
            granted = bucket.tokens >= 1.0;
            if granted {
                bucket.tokens -= 1.0;
            }
            Ok(serde_json::to_string(&bucket)?)
        })?;
        Ok(granted)
    }

    /// The current persisted state, for diagnostics and tests.
    pub fn peek(&self) -> Result<Option<BucketState>, StoreError> {
        match self.store.get(TOKEN_BUCKET_KEY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::Duration;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct StepClock(Mutex<DateTime<Utc>>);

    impl Clock for StepClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn limiter(start: DateTime<Utc>) -> (OceanTokenBucketLimiter, Arc<StepClock>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteStore::open(file.path()).unwrap());
        let clock = Arc::new(StepClock(Mutex::new(start)));
        (
            OceanTokenBucketLimiter::new(store, clock.clone()),
            clock,
            file,
        )
    }

    #[test]
    fn fresh_bucket_starts_full_and_consumes() {
        let t0 = Utc::now();
        let (limiter, _clock, _f) = limiter(t0);
        assert!(limiter.request_token().unwrap());
        let state = limiter.peek().unwrap().unwrap();
        assert!((state.tokens - 29.0).abs() < 1e-9);
    }

    #[test]
    fn empty_bucket_denies_and_persists_attempt() {
        let t0 = Utc::now();
        let (limiter, _clock, _f) = limiter(t0);
        // Drain.
        for _ in 0..30 {
            assert!(limiter.request_token().unwrap());
        }
        assert!(!limiter.request_token().unwrap());
        let state = limiter.peek().unwrap().unwrap();
        assert!(state.tokens < 1.0);
        assert_eq!(state.last_refill, t0);
    }

    #[test]
    fn refill_tracks_elapsed_hours_clamped_to_capacity() {
        let t0 = Utc::now();
        let (limiter, clock, _f) = limiter(t0);
        for _ in 0..30 {
            limiter.request_token().unwrap();
        }
        // Two tokens per hour: after 90 minutes there are 3 tokens.
        *clock.0.lock().unwrap() = t0 + Duration::minutes(90);
        assert!(limiter.request_token().unwrap());
        let state = limiter.peek().unwrap().unwrap();
        assert!((state.tokens - 2.0).abs() < 1e-9);

        // A very long gap refills to capacity, not beyond.
        *clock.0.lock().unwrap() = t0 + Duration::days(30);
        assert!(limiter.request_token().unwrap());
        let state = limiter.peek().unwrap().unwrap();
        assert!((state.tokens - 29.0).abs() < 1e-9);
    }
}
