//! Per-user rate limiting.
//!
//! Token bucket over a fixed window, one bucket per `(user, operation)` key.
//! Keys are derived from the authenticated user id — never the network
//! address, so NAT'd users cannot starve each other. Exceeding a limit yields
//! a retryable error with Retry-After semantics; connections are not dropped.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::directory::UserId;
use crate::error::RelayError;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: u32,
    last_refill: u64,
    window_start: u64,
    request_count: u32,
}

impl Bucket {
    fn new(max_tokens: u32) -> Self {
        let now = now_secs();
        Self {
            tokens: max_tokens,
            last_refill: now,
            window_start: now,
            request_count: 0,
        }
    }

    fn try_consume(&mut self, limit: u32, window_secs: u64) -> bool {
        let now = now_secs();

        // Reset window if needed
        if now >= self.window_start + window_secs {
            self.window_start = now;
            self.request_count = 0;
            self.tokens = limit;
        }

        // Refill tokens based on time elapsed
        let elapsed = now.saturating_sub(self.last_refill);
        if elapsed > 0 && window_secs > 0 {
            let refill = (elapsed * u64::from(limit) / window_secs) as u32;
            self.tokens = (self.tokens + refill).min(limit);
            self.last_refill = now;
        }

        if self.tokens > 0 && self.request_count < limit {
            self.tokens -= 1;
            self.request_count += 1;
            true
        } else {
            false
        }
    }

    fn seconds_until_reset(&self, window_secs: u64) -> u64 {
        (self.window_start + window_secs).saturating_sub(now_secs())
    }
}

/// A named per-user limit, e.g. 10 friend requests per hour.
pub struct RateLimiter {
    operation: &'static str,
    limit: u32,
    window_secs: u64,
    buckets: DashMap<UserId, Bucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(operation: &'static str, limit: u32, window_secs: u64) -> Self {
        Self {
            operation,
            limit,
            window_secs,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for `user_id`, or fail with a retryable error.
    pub fn check(&self, user_id: UserId) -> Result<(), RelayError> {
        let mut bucket = self
            .buckets
            .entry(user_id)
            .or_insert_with(|| Bucket::new(self.limit));

        if bucket.try_consume(self.limit, self.window_secs) {
            return Ok(());
        }
        let retry_after_seconds = bucket.seconds_until_reset(self.window_secs).max(1);
        tracing::debug!(
            user_id,
            operation = self.operation,
            retry_after_seconds,
            "rate limit exceeded"
        );
        Err(RelayError::RateLimited {
            retry_after_seconds,
        })
    }
}

/// The relay's standing limits, keyed by authenticated user id.
pub struct RateLimits {
    /// WebSocket events (messages + files)
    pub events: RateLimiter,
    /// Friend request creation
    pub friend_requests: RateLimiter,
    /// Remaining authenticated HTTP endpoints
    pub http: RateLimiter,
}

impl RateLimits {
    #[must_use]
    pub fn new(events_per_minute: u32, friend_requests_per_hour: u32, http_per_minute: u32) -> Self {
        Self {
            events: RateLimiter::new("events", events_per_minute, 60),
            friend_requests: RateLimiter::new("friend_request", friend_requests_per_hour, 3600),
            http: RateLimiter::new("http", http_per_minute, 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_enforced_per_user() {
        let limiter = RateLimiter::new("test", 3, 3600);
        for _ in 0..3 {
            limiter.check(10).unwrap();
        }
        let err = limiter.check(10).unwrap_err();
        assert!(matches!(err, RelayError::RateLimited { .. }));

        // a different user has an independent bucket
        limiter.check(11).unwrap();
    }

    #[test]
    fn rate_limited_error_carries_retry_after() {
        let limiter = RateLimiter::new("test", 1, 3600);
        limiter.check(10).unwrap();
        match limiter.check(10) {
            Err(RelayError::RateLimited {
                retry_after_seconds,
            }) => {
                assert!(retry_after_seconds >= 1);
                assert!(retry_after_seconds <= 3600);
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }

    #[test]
    fn window_reset_restores_tokens() {
        let limiter = RateLimiter::new("test", 2, 1);
        limiter.check(10).unwrap();
        limiter.check(10).unwrap();
        assert!(limiter.check(10).is_err());

        std::thread::sleep(std::time::Duration::from_millis(1100));
        limiter.check(10).unwrap();
    }

    #[test]
    fn default_floors_match_policy() {
        let limits = RateLimits::new(120, 10, 20);
        assert_eq!(limits.friend_requests.limit, 10);
        assert_eq!(limits.friend_requests.window_secs, 3600);
        assert_eq!(limits.http.window_secs, 60);
    }
}
