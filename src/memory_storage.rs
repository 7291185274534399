//! A minimal in-memory `Storage` used by this crate's own test suite.
//!
//! Not a production backend — no persistence, no replication, no
//! compaction of idempotency records. Every mutating method locks the
//! single key it touches via a per-key `tokio::sync::Mutex`, never a global
//! lock, matching the fine-grained sharding this crate's concurrency model
//! requires.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::errors::StorageError;
use crate::period::Period;
use crate::rate_limit::{self, RateLimitDecision, RateLimitState};
use crate::storage::{
    ApplyTierChangeRequest, ConsumeRequest, ConsumptionRecord, Deadline, Entitlement,
    LimitMutationRequest, RateLimitCheckRequest, RefundRecord, RefundRequest, Storage, Usage,
};

fn usage_key(user_id: &str, resource: &str, period_key: &str) -> String {
    format!("{user_id}:{resource}:{period_key}")
}

/// Row-level locks, one per usage key, so concurrent consumes against
/// different `(user_id, resource, period)` never contend.
pub struct InMemoryStorage {
    entitlements: DashMap<String, Entitlement>,
    usage: DashMap<String, Mutex<Usage>>,
    rate_limits: DashMap<String, Mutex<RateLimitState>>,
    consumption_records: DashMap<String, ConsumptionRecord>,
    refund_records: DashMap<String, RefundRecord>,
    top_up_records: DashMap<String, ()>,
    // Guards creation of a usage row so two concurrent first-writers for the
    // same key can't both decide "absent" and race to insert.
    creation_lock: StdMutex<()>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entitlements: DashMap::new(),
            usage: DashMap::new(),
            rate_limits: DashMap::new(),
            consumption_records: DashMap::new(),
            refund_records: DashMap::new(),
            top_up_records: DashMap::new(),
            creation_lock: StdMutex::new(()),
        }
    }

    fn get_or_create_row(&self, key: &str, seed: Usage) {
        let _guard = self.creation_lock.lock().unwrap();
        self.usage.entry(key.to_string()).or_insert_with(|| Mutex::new(seed));
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_entitlement(
        &self,
        user_id: &str,
        _deadline: Deadline,
    ) -> Result<Option<Entitlement>, StorageError> {
        Ok(self.entitlements.get(user_id).map(|e| e.clone()))
    }

    async fn set_entitlement(
        &self,
        entitlement: Entitlement,
        deadline: Deadline,
    ) -> Result<(), StorageError> {
        if deadline.should_abort() {
            return Err(StorageError::Cancelled);
        }
        self.entitlements.insert(entitlement.user_id.clone(), entitlement);
        Ok(())
    }

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
        _deadline: Deadline,
    ) -> Result<Option<Usage>, StorageError> {
        let key = usage_key(user_id, resource, &period.key());
        match self.usage.get(&key) {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: Usage,
        period: &Period,
        _deadline: Deadline,
    ) -> Result<(), StorageError> {
        let key = usage_key(user_id, resource, &period.key());
        self.get_or_create_row(&key, usage.clone());
        *self.usage.get(&key).unwrap().lock().await = usage;
        Ok(())
    }

    async fn consume_quota(
        &self,
        req: ConsumeRequest,
        deadline: Deadline,
    ) -> Result<i64, StorageError> {
        if req.amount < 0 {
            return Err(StorageError::InvalidAmount);
        }

        if let Some(key) = &req.idempotency_key {
            if let Some(record) = self.consumption_records.get(key) {
                return Ok(record.new_used_after);
            }
        }

        let key = usage_key(&req.user_id, &req.resource, &req.period.key());
        self.get_or_create_row(
            &key,
            Usage {
                user_id: req.user_id.clone(),
                resource: req.resource.clone(),
                period_key: req.period.key(),
                used: 0,
                limit: req.effective_limit,
                tier_at_write: req.tier_name.clone(),
                updated_at: Utc::now(),
                is_degraded: false,
            },
        );

        let row = self.usage.get(&key).unwrap();
        let mut usage = row.lock().await;

        // Checked with the row locked, immediately before the write this
        // call would otherwise commit — a cancellation observed any earlier
        // couldn't rule out a racing writer slipping in between the check
        // and the lock.
        if deadline.should_abort() {
            return Err(StorageError::Cancelled);
        }

        // The caller (the Manager) resolves the limit this consume must be
        // checked against — see the doc comment on `ConsumeRequest`. Trust
        // it rather than re-deriving anything from the stored row.
        let new_used = usage.used + req.amount;
        if req.effective_limit != Usage::UNLIMITED && new_used > req.effective_limit {
            return Err(StorageError::QuotaExceeded {
                used: usage.used,
                limit: req.effective_limit,
            });
        }

        usage.used = new_used;
        usage.limit = req.effective_limit;
        usage.updated_at = Utc::now();
        usage.tier_at_write = req.tier_name.clone();

        if let Some(key) = req.idempotency_key {
            self.consumption_records.insert(
                key.clone(),
                ConsumptionRecord {
                    idempotency_key: key,
                    user_id: req.user_id,
                    resource: req.resource,
                    amount: req.amount,
                    period: req.period,
                    timestamp: usage.updated_at,
                    new_used_after: new_used,
                },
            );
        }

        Ok(new_used)
    }

    async fn refund_quota(&self, req: RefundRequest, deadline: Deadline) -> Result<i64, StorageError> {
        if req.amount < 0 {
            return Err(StorageError::InvalidAmount);
        }

        if let Some(key) = &req.idempotency_key {
            if self.refund_records.contains_key(key) {
                let key = usage_key(&req.user_id, &req.resource, &req.period.key());
                if let Some(row) = self.usage.get(&key) {
                    return Ok(row.lock().await.used);
                }
                return Ok(0);
            }
        }

        let key = usage_key(&req.user_id, &req.resource, &req.period.key());
        let new_used = match self.usage.get(&key) {
            Some(row) => {
                let mut usage = row.lock().await;
                if deadline.should_abort() {
                    return Err(StorageError::Cancelled);
                }
                usage.used = (usage.used - req.amount).max(0);
                usage.updated_at = Utc::now();
                usage.used
            }
            None => 0,
        };

        if let Some(key) = req.idempotency_key {
            self.refund_records.insert(
                key.clone(),
                RefundRecord {
                    idempotency_key: key,
                    user_id: req.user_id,
                    resource: req.resource,
                    amount: req.amount,
                    period: req.period,
                    reason: req.reason,
                    metadata: req.metadata,
                    timestamp: Utc::now(),
                },
            );
        }

        Ok(new_used)
    }

    async fn add_limit(
        &self,
        req: LimitMutationRequest,
        deadline: Deadline,
    ) -> Result<i64, StorageError> {
        if self.top_up_records.contains_key(&req.idempotency_key) {
            let key = usage_key(&req.user_id, &req.resource, &req.period.key());
            if let Some(row) = self.usage.get(&key) {
                return Ok(row.lock().await.limit);
            }
            return Ok(0);
        }

        let key = usage_key(&req.user_id, &req.resource, &req.period.key());
        self.get_or_create_row(
            &key,
            Usage {
                user_id: req.user_id.clone(),
                resource: req.resource.clone(),
                period_key: req.period.key(),
                used: 0,
                limit: 0,
                tier_at_write: String::new(),
                updated_at: Utc::now(),
                is_degraded: false,
            },
        );
        let row = self.usage.get(&key).unwrap();
        let mut usage = row.lock().await;
        if deadline.should_abort() {
            return Err(StorageError::Cancelled);
        }
        if usage.limit != Usage::UNLIMITED {
            usage.limit += req.amount;
        }
        usage.updated_at = Utc::now();
        self.top_up_records.insert(req.idempotency_key, ());
        Ok(usage.limit)
    }

    async fn subtract_limit(
        &self,
        req: LimitMutationRequest,
        deadline: Deadline,
    ) -> Result<i64, StorageError> {
        if self.top_up_records.contains_key(&req.idempotency_key) {
            let key = usage_key(&req.user_id, &req.resource, &req.period.key());
            if let Some(row) = self.usage.get(&key) {
                return Ok(row.lock().await.limit);
            }
            return Ok(0);
        }

        let key = usage_key(&req.user_id, &req.resource, &req.period.key());
        let new_limit = match self.usage.get(&key) {
            Some(row) => {
                let mut usage = row.lock().await;
                if deadline.should_abort() {
                    return Err(StorageError::Cancelled);
                }
                if usage.limit != Usage::UNLIMITED {
                    usage.limit = (usage.limit - req.amount).max(0);
                }
                usage.updated_at = Utc::now();
                usage.limit
            }
            None => 0,
        };
        self.top_up_records.insert(req.idempotency_key, ());
        Ok(new_limit)
    }

    async fn apply_tier_change(
        &self,
        req: ApplyTierChangeRequest,
        deadline: Deadline,
    ) -> Result<(), StorageError> {
        let key = usage_key(&req.user_id, &req.resource, &req.period.key());
        self.get_or_create_row(
            &key,
            Usage {
                user_id: req.user_id.clone(),
                resource: req.resource.clone(),
                period_key: req.period.key(),
                used: 0,
                limit: req.new_limit,
                tier_at_write: String::new(),
                updated_at: Utc::now(),
                is_degraded: false,
            },
        );
        let row = self.usage.get(&key).unwrap();
        let mut usage = row.lock().await;
        if deadline.should_abort() {
            return Err(StorageError::Cancelled);
        }
        usage.limit = req.new_limit;
        usage.updated_at = Utc::now();
        Ok(())
    }

    async fn check_rate_limit(
        &self,
        req: RateLimitCheckRequest,
        _deadline: Deadline,
    ) -> Result<RateLimitDecision, StorageError> {
        let key = format!("{}:{}", req.user_id, req.resource);
        self.rate_limits.entry(key.clone()).or_insert_with(|| {
            Mutex::new(match req.config.algorithm {
                rate_limit::RateLimitAlgorithm::TokenBucket => {
                    RateLimitState::new_token_bucket(&req.config, req.now)
                }
                rate_limit::RateLimitAlgorithm::SlidingWindow => {
                    RateLimitState::new_sliding_window(&req.config)
                }
            })
        });
        let row = self.rate_limits.get(&key).unwrap();
        let mut state = row.lock().await;
        Ok(rate_limit::check(&mut state, req.now))
    }

    async fn get_consumption_record(
        &self,
        idempotency_key: &str,
        _deadline: Deadline,
    ) -> Result<Option<ConsumptionRecord>, StorageError> {
        Ok(self.consumption_records.get(idempotency_key).map(|r| r.clone()))
    }

    async fn get_refund_record(
        &self,
        idempotency_key: &str,
        _deadline: Deadline,
    ) -> Result<Option<RefundRecord>, StorageError> {
        Ok(self.refund_records.get(idempotency_key).map(|r| r.clone()))
    }

    async fn now(&self, _deadline: Deadline) -> Result<chrono::DateTime<Utc>, StorageError> {
        Ok(Utc::now())
    }
}
