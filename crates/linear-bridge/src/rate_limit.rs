//! # Rate Limiting
//!
//! Sliding-window rate limiting keyed by client address. Each client keeps a
//! log of recent request timestamps; a request is admitted only while both the
//! per-minute and the per-hour counts are below their thresholds.
//!
//! State lives in process memory and is lost on restart. Check-and-record runs
//! under a single write lock, so concurrent deliveries from the same client
//! cannot race past a threshold.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Rate limiting errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for '{key}': {limit}. Try again in {retry_after_secs} seconds")]
    LimitExceeded {
        key: String,
        limit: String,
        retry_after_secs: u64,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for rate limiting operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub cleanup_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 50,
            requests_per_hour: 100,
            cleanup_interval_seconds: 300,
        }
    }
}

impl RateLimitConfig {
    /// Reject thresholds that would block every request.
    pub fn validate(&self) -> RateLimitResult<()> {
        if self.requests_per_minute == 0 {
            return Err(RateLimitError::ConfigurationError(
                "Requests per minute cannot be zero".to_string(),
            ));
        }
        if self.requests_per_hour == 0 {
            return Err(RateLimitError::ConfigurationError(
                "Requests per hour cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remaining budget for a client after an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub minute_remaining: u32,
    pub hour_remaining: u32,
}

#[derive(Debug, Default)]
struct RateLimitEntry {
    requests: VecDeque<DateTime<Utc>>,
}

impl RateLimitEntry {
    /// Drop timestamps that fell out of the largest window.
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(1);
        self.requests.retain(|t| *t > horizon);
    }

    fn count_since(&self, start: DateTime<Utc>) -> usize {
        self.requests.iter().filter(|t| **t > start).count()
    }

    /// Seconds until the oldest request inside `window` leaves it.
    fn retry_after(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        let start = now - window;
        self.requests
            .iter()
            .filter(|t| **t > start)
            .min()
            .map_or(1, |oldest| {
                let wait = (*oldest + window - now).num_milliseconds();
                u64::try_from((wait + 999) / 1000).unwrap_or(1).max(1)
            })
    }
}

#[derive(Debug)]
struct LimiterState {
    limits: HashMap<String, RateLimitEntry>,
    last_cleanup: DateTime<Utc>,
}

/// Per-client sliding-window rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<LimiterState>,
}

impl RateLimiter {
    /// Create a rate limiter with the given thresholds
    pub fn new(config: RateLimitConfig) -> RateLimitResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: RwLock::new(LimiterState {
                limits: HashMap::new(),
                last_cleanup: Utc::now(),
            }),
        })
    }

    /// Get current configuration
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record a request for `key` at the current time
    pub async fn check_limit(&self, key: &str) -> RateLimitResult<RateLimitStatus> {
        self.check_limit_at(key, Utc::now()).await
    }

    /// Check and record a request for `key` at an explicit instant.
    ///
    /// A denied request is not recorded, so it does not extend the client's
    /// lockout.
    pub async fn check_limit_at(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RateLimitResult<RateLimitStatus> {
        let mut state = self.state.write().await;
        self.perform_cleanup(&mut state, now);

        let entry = state.limits.entry(key.to_string()).or_default();
        entry.prune(now);

        let minute = Duration::minutes(1);
        let in_minute = entry.count_since(now - minute);
        let in_hour = entry.requests.len();

        if in_minute >= self.config.requests_per_minute as usize {
            return Err(RateLimitError::LimitExceeded {
                key: key.to_string(),
                limit: format!("{} per 1 minute", self.config.requests_per_minute),
                retry_after_secs: entry.retry_after(now, minute),
            });
        }

        if in_hour >= self.config.requests_per_hour as usize {
            return Err(RateLimitError::LimitExceeded {
                key: key.to_string(),
                limit: format!("{} per 1 hour", self.config.requests_per_hour),
                retry_after_secs: entry.retry_after(now, Duration::hours(1)),
            });
        }

        entry.requests.push_back(now);

        let status = RateLimitStatus {
            minute_remaining: remaining(self.config.requests_per_minute, in_minute + 1),
            hour_remaining: remaining(self.config.requests_per_hour, in_hour + 1),
        };
        debug!(
            key = %key,
            minute_remaining = status.minute_remaining,
            hour_remaining = status.hour_remaining,
            "Rate limit check passed"
        );
        Ok(status)
    }

    /// Number of clients currently tracked
    pub async fn tracked_clients(&self) -> usize {
        self.state.read().await.limits.len()
    }

    /// Evict clients with no requests in the last hour, at most once per interval.
    fn perform_cleanup(&self, state: &mut LimiterState, now: DateTime<Utc>) {
        let interval = Duration::seconds(
            i64::try_from(self.config.cleanup_interval_seconds).unwrap_or(i64::MAX),
        );
        if now - state.last_cleanup < interval {
            return;
        }

        let before = state.limits.len();
        state.limits.retain(|_, entry| {
            entry.prune(now);
            !entry.requests.is_empty()
        });
        let removed = before - state.limits.len();
        if removed > 0 {
            debug!("Cleaned up {} idle rate limit entries", removed);
        }
        state.last_cleanup = now;
    }
}

fn remaining(limit: u32, used: usize) -> u32 {
    limit.saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
}
