//! Error taxonomy for the quota/rate-limit engine.
//!
//! Kinds, per the enforcement design: *validation* (rejected before any
//! write), *capacity* (`QuotaExceeded` / `RateLimitExceeded` — authoritative,
//! never retried automatically), *not-found* (falls back to the default
//! tier rather than erroring), *idempotency-replay* (silently returns the
//! original stored result), *cancellation* (the caller's `Deadline` was
//! cancelled before a mutating call committed — leaves no observable
//! effect), *transient* (handled by the fallback ladder; surfaced only once
//! every rung has failed), *fatal configuration* (raised at `Manager::new`,
//! never at runtime).

use thiserror::Error;

use crate::rate_limit::RateLimitDecision;

/// Errors a `Storage` implementation returns.
///
/// These MUST be distinguishable by the Manager — callers match on variant,
/// not on message text.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("requested amount exceeds available quota")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("amount must be positive")]
    InvalidAmount,

    #[error("invalid period")]
    InvalidPeriod,

    #[error("entitlement not found for user")]
    EntitlementNotFound,

    #[error("idempotency key already used")]
    IdempotencyKeyExists,

    #[error("operation cancelled before commit")]
    Cancelled,

    #[error("transient storage failure: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Errors raised at `Manager::new`. Never raised at runtime — a
/// successfully constructed `Manager` cannot later discover a config error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("default_tier {0:?} is not present in tiers")]
    UnknownDefaultTier(String),

    #[error("tier {tier:?} consumption_order lists a bounded period kind more than once")]
    InvalidConsumptionOrder { tier: String },
}

/// Errors surfaced by `Manager` public operations.
///
/// The wire conventions a transport layer would map these to (not
/// implemented by this crate — see SPEC_FULL.md §6):
///
/// | Variant | convention |
/// |---|---|
/// | `QuotaExceeded` | 429, `X-Quota-Used` / `X-Quota-Limit` |
/// | `RateLimitExceeded` | 429, `X-RateLimit-{Limit,Remaining,Reset}`, `Retry-After` |
/// | `EntitlementNotFound` | never surfaced — `Manager` falls back to the default tier |
/// | `InvalidAmount` / `InvalidPeriod` | 400 |
/// | `Cancelled` | 499 (client closed request) |
/// | `Transient` | 500 or 503 |
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("amount must be positive")]
    InvalidAmount,

    #[error("invalid period")]
    InvalidPeriod,

    #[error("quota exceeded: {used}/{limit}")]
    QuotaExceeded { used: i64, limit: i64 },

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        info: RateLimitDecision,
        retry_after: std::time::Duration,
    },

    #[error("idempotency key already used with a different effect")]
    IdempotencyKeyExists,

    #[error("operation cancelled before commit")]
    Cancelled,

    #[error("transient storage failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<StorageError> for ManagerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::QuotaExceeded { used, limit } => ManagerError::QuotaExceeded { used, limit },
            StorageError::InvalidAmount => ManagerError::InvalidAmount,
            StorageError::InvalidPeriod => ManagerError::InvalidPeriod,
            // EntitlementNotFound never reaches a caller as an error — the
            // Manager resolves it to the default tier before any Storage
            // call that could return this variant on the read path. A
            // write-path occurrence (a concurrent deletion a Storage chose
            // to support) degrades to Transient rather than inventing a new
            // caller-visible state.
            StorageError::EntitlementNotFound => {
                ManagerError::Transient(anyhow::anyhow!("entitlement disappeared mid-operation"))
            }
            StorageError::IdempotencyKeyExists => ManagerError::IdempotencyKeyExists,
            StorageError::Cancelled => ManagerError::Cancelled,
            StorageError::Transient(e) => ManagerError::Transient(e),
        }
    }
}
