//! Pure token-bucket and sliding-window state machines.
//!
//! Both algorithms operate over a `&mut RateLimitState` the caller owns —
//! this module does no I/O and holds no state of its own. `Storage`
//! implementations are responsible for persisting the state atomically
//! around each call (see `storage::Storage::check_rate_limit`).

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-tier, per-resource rate limit configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    /// Tokens (or requests) permitted per `window`.
    pub rate: u64,
    /// Window duration the `rate` applies to.
    pub window: Duration,
    /// Token bucket only: burst capacity. Defaults to `rate` when absent.
    pub burst: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
}

/// Persisted state for one `(user_id, resource)` rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitState {
    TokenBucket {
        tokens: f64,
        last_refill: DateTime<Utc>,
        capacity: u64,
        rate: u64,
        window: Duration,
    },
    SlidingWindow {
        /// Insertion-ordered request instants still inside the window.
        timestamps: VecDeque<DateTime<Utc>>,
        window: Duration,
        limit: u64,
    },
}

impl RateLimitState {
    pub fn new_token_bucket(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        let capacity = config.burst.unwrap_or(config.rate);
        RateLimitState::TokenBucket {
            tokens: capacity as f64,
            last_refill: now,
            capacity,
            rate: config.rate,
            window: config.window,
        }
    }

    pub fn new_sliding_window(config: &RateLimitConfig) -> Self {
        RateLimitState::SlidingWindow {
            timestamps: VecDeque::new(),
            window: config.window,
            limit: config.rate,
        }
    }
}

/// Outcome of a rate limit check, exposed to callers for `X-RateLimit-*`
/// header construction by a transport layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset: DateTime<Utc>,
    pub retry_after: Option<Duration>,
}

/// Evaluate and mutate a token bucket in place at instant `now`.
pub fn check_token_bucket(state: &mut RateLimitState, now: DateTime<Utc>) -> RateLimitDecision {
    let RateLimitState::TokenBucket {
        tokens,
        last_refill,
        capacity,
        rate,
        window,
    } = state
    else {
        panic!("check_token_bucket called with non-token-bucket state");
    };

    if *rate == 0 {
        return RateLimitDecision {
            allowed: true,
            remaining: *capacity,
            reset: now,
            retry_after: None,
        };
    }

    let elapsed = (now - *last_refill).to_std().unwrap_or(Duration::ZERO);
    let refill = elapsed.as_secs_f64() * (*rate as f64) / window.as_secs_f64();
    if refill > 0.0 {
        *tokens = (*tokens + refill).min(*capacity as f64);
        *last_refill = now;
    }

    let seconds_per_token = window.as_secs_f64() / (*rate as f64);

    if *tokens >= 1.0 {
        *tokens -= 1.0;
        let to_full = (*capacity as f64 - *tokens) * seconds_per_token;
        RateLimitDecision {
            allowed: true,
            remaining: tokens.floor() as u64,
            reset: now + chrono::Duration::from_std(Duration::from_secs_f64(to_full.max(0.0)))
                .unwrap_or_default(),
            retry_after: None,
        }
    } else {
        let since_refill = (now - *last_refill).to_std().unwrap_or(Duration::ZERO).as_secs_f64();
        let retry = (seconds_per_token - (since_refill % seconds_per_token)).max(0.0);
        let retry_after = Duration::from_secs_f64(retry);
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset: *last_refill
                + chrono::Duration::from_std(Duration::from_secs_f64(seconds_per_token))
                    .unwrap_or_default(),
            retry_after: Some(retry_after),
        }
    }
}

/// Evaluate and mutate a sliding window in place at instant `now`.
pub fn check_sliding_window(state: &mut RateLimitState, now: DateTime<Utc>) -> RateLimitDecision {
    let RateLimitState::SlidingWindow {
        timestamps,
        window,
        limit,
    } = state
    else {
        panic!("check_sliding_window called with non-sliding-window state");
    };

    if *limit == 0 {
        return RateLimitDecision {
            allowed: true,
            remaining: 0,
            reset: now,
            retry_after: None,
        };
    }

    let window_chrono = chrono::Duration::from_std(*window).unwrap_or_default();
    let cutoff = now - window_chrono;
    while let Some(front) = timestamps.front() {
        if *front <= cutoff {
            timestamps.pop_front();
        } else {
            break;
        }
    }

    if timestamps.len() as u64 >= *limit {
        let oldest = *timestamps.front().unwrap();
        let reset = oldest + window_chrono;
        let retry_after = (reset - now).to_std().unwrap_or(Duration::ZERO);
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset,
            retry_after: Some(retry_after),
        }
    } else {
        timestamps.push_back(now);
        let reset = timestamps
            .front()
            .map(|t| *t + window_chrono)
            .unwrap_or(now + window_chrono);
        RateLimitDecision {
            allowed: true,
            remaining: *limit - timestamps.len() as u64,
            reset,
            retry_after: None,
        }
    }
}

/// Dispatch to the algorithm named by the state's own variant.
pub fn check(state: &mut RateLimitState, now: DateTime<Utc>) -> RateLimitDecision {
    match state {
        RateLimitState::TokenBucket { .. } => check_token_bucket(state, now),
        RateLimitState::SlidingWindow { .. } => check_sliding_window(state, now),
    }
}
