//! The abstract persistence contract the Manager is built against.
//!
//! This crate ships no concrete backend — relational, document, key-value,
//! or otherwise. `Storage` is the seam an embedding application implements
//! against its own database. A minimal in-memory reference implementation
//! used by this crate's own test suite lives in `memory_storage` behind the
//! `test-util` feature; it is not meant for production use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::errors::StorageError;
use crate::period::Period;
use crate::rate_limit::{RateLimitConfig, RateLimitDecision};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A handle that can cancel every clone of the `Deadline` it was issued
/// from. Calling a `CancellationToken` held by a request's original caller
/// is how a cancelled `Consume` is supposed to reach every suspension point
/// downstream without each one polling a shared flag on its own schedule.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

/// Cooperative deadline propagated end-to-end through every suspension
/// point (every `Storage` call, every `Cache` call, every user-supplied
/// callback). `Storage` implementations that require lock timeouts surface
/// them as `StorageError::Transient` rather than blocking past `deadline`.
///
/// Carries a `tokio::sync::Notify`-backed cancellation flag alongside the
/// time bound, rather than pulling in `tokio-util`'s `CancellationToken` for
/// a single type. A cancelled `Deadline` must be observed before a mutating
/// `Storage` call commits; after commit, cancellation is moot.
#[derive(Debug, Clone)]
pub struct Deadline {
    at: tokio::time::Instant,
    cancel: Arc<CancelState>,
}

impl Deadline {
    pub fn after(d: StdDuration) -> Self {
        Self {
            at: tokio::time::Instant::now() + d,
            cancel: Arc::new(CancelState::default()),
        }
    }

    pub fn far_future() -> Self {
        Self::after(StdDuration::from_secs(365 * 24 * 3600))
    }

    pub fn is_expired(&self) -> bool {
        tokio::time::Instant::now() >= self.at
    }

    pub fn remaining(&self) -> StdDuration {
        self.at.saturating_duration_since(tokio::time::Instant::now())
    }

    /// Checked cooperatively at each suspension point — cheap, no await.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.cancelled.load(Ordering::Acquire)
    }

    /// True once either the time bound has elapsed or cancellation fired.
    /// `Storage` implementations should check this immediately before the
    /// commit of any mutating operation and return `StorageError::Cancelled`
    /// rather than write past it.
    pub fn should_abort(&self) -> bool {
        self.is_expired() || self.is_cancelled()
    }

    /// Resolves once this deadline is cancelled. A `Storage` backed by a
    /// real suspension primitive (a driver's own cancel-aware future, a
    /// channel select) can race this against its own work instead of
    /// polling `is_cancelled()`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.cancel.notify.notified().await;
    }

    /// Issues a token that can cancel this `Deadline` and every clone
    /// derived from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken {
            state: self.cancel.clone(),
        }
    }
}

/// Per-user entitlement: the record linking a user to a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: String,
    pub tier_name: String,
    pub subscription_start: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// Computed read-only state; no background job flips this.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }
}

/// A usage counter for one `(user_id, resource, period)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub user_id: String,
    pub resource: String,
    pub period_key: String,
    pub used: i64,
    pub limit: i64,
    pub tier_at_write: String,
    pub updated_at: DateTime<Utc>,
    /// Set by the Fallback Policy when this snapshot was produced by a
    /// degraded decision rather than primary storage.
    #[serde(default)]
    pub is_degraded: bool,
}

impl Usage {
    pub const UNLIMITED: i64 = -1;

    pub fn is_unlimited(&self) -> bool {
        self.limit == Self::UNLIMITED
    }

    pub fn remaining(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.limit - self.used).max(0))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub idempotency_key: String,
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    pub timestamp: DateTime<Utc>,
    pub new_used_after: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub idempotency_key: String,
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    pub reason: String,
    pub metadata: std::collections::HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopUpRecord {
    pub idempotency_key: String,
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    pub idempotency_key: Option<String>,
    pub tier_name: String,
    /// The limit this consume must be checked against. `Storage` has no
    /// notion of tiers, so the caller (the Manager, which does) resolves
    /// this from tier configuration — or, for forever credits, from the
    /// counter's own previously-accumulated limit — and hands it down for
    /// atomic enforcement in the same read-modify-write as the counter
    /// update.
    pub effective_limit: i64,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    pub idempotency_key: Option<String>,
    pub reason: String,
    pub metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LimitMutationRequest {
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct ApplyTierChangeRequest {
    pub user_id: String,
    pub resource: String,
    pub old_limit: i64,
    pub new_limit: i64,
    pub period: Period,
}

#[derive(Debug, Clone)]
pub struct RateLimitCheckRequest {
    pub user_id: String,
    pub resource: String,
    pub config: RateLimitConfig,
    pub now: DateTime<Utc>,
}

/// The abstract persistence contract. All mutating operations are
/// transactional or idempotent; implementations MUST preserve
/// read-your-writes within a single `Manager` instance.
///
/// Two invariants are load-bearing enough that they're stated here rather
/// than left for an implementer to discover the hard way (see
/// SPEC_FULL.md §9): `apply_tier_change` takes `resource` explicitly — no
/// conforming implementation may special-case a single hardcoded resource
/// name — and `check_rate_limit` MUST be a single atomic read-modify-write;
/// splitting the read and the write across a transaction boundary
/// reproduces a known TOCTOU bug this contract exists to rule out.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_entitlement(
        &self,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<Option<Entitlement>, StorageError>;

    async fn set_entitlement(
        &self,
        entitlement: Entitlement,
        deadline: Deadline,
    ) -> Result<(), StorageError>;

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
        deadline: Deadline,
    ) -> Result<Option<Usage>, StorageError>;

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: Usage,
        period: &Period,
        deadline: Deadline,
    ) -> Result<(), StorageError>;

    /// Atomic: read the counter, check `existing + amount <= req.effective_limit`,
    /// write, and — iff `req.idempotency_key` is `Some` — create a
    /// `ConsumptionRecord` under the same key in the same transaction.
    /// Idempotent replays MUST return the original `new_used` and MUST NOT
    /// re-apply the delta, regardless of the replayed amount.
    async fn consume_quota(
        &self,
        req: ConsumeRequest,
        deadline: Deadline,
    ) -> Result<i64, StorageError>;

    /// Atomic: `used <- max(0, used - amount)`; creates a `RefundRecord`;
    /// idempotent by key. No usage row is a no-op success.
    async fn refund_quota(&self, req: RefundRequest, deadline: Deadline) -> Result<i64, StorageError>;

    /// Atomic limit increase (forever-credit top-up). Idempotent by key;
    /// first writer wins on replay with a different payload.
    async fn add_limit(
        &self,
        req: LimitMutationRequest,
        deadline: Deadline,
    ) -> Result<i64, StorageError>;

    /// Atomic limit decrease, clamped to 0.
    async fn subtract_limit(
        &self,
        req: LimitMutationRequest,
        deadline: Deadline,
    ) -> Result<i64, StorageError>;

    /// Atomic write of a new limit that preserves `used`. Per-resource —
    /// see the trait-level doc comment.
    async fn apply_tier_change(
        &self,
        req: ApplyTierChangeRequest,
        deadline: Deadline,
    ) -> Result<(), StorageError>;

    /// Atomic read-modify-write of `RateLimitState`.
    async fn check_rate_limit(
        &self,
        req: RateLimitCheckRequest,
        deadline: Deadline,
    ) -> Result<RateLimitDecision, StorageError>;

    async fn get_consumption_record(
        &self,
        idempotency_key: &str,
        deadline: Deadline,
    ) -> Result<Option<ConsumptionRecord>, StorageError>;

    async fn get_refund_record(
        &self,
        idempotency_key: &str,
        deadline: Deadline,
    ) -> Result<Option<RefundRecord>, StorageError>;

    /// Server clock, used to bound clock skew across process replicas.
    async fn now(&self, deadline: Deadline) -> Result<DateTime<Utc>, StorageError>;
}
