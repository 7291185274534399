//! The orchestration core: resolves tier and period, checks rate limits,
//! drains a layered pool of quota sources, and maintains the write-through
//! cache and degradation ladder around a pluggable `Storage`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, instrument, warn};

use crate::cache::Cache;
use crate::config::{ManagerConfig, TierConfig};
use crate::errors::{ConfigError, ManagerError, StorageError};
use crate::fallback::FallbackPolicy;
use crate::period::{cycle, Period, PeriodKind};
use crate::storage::{
    ApplyTierChangeRequest, ConsumeRequest, Deadline, Entitlement, LimitMutationRequest,
    RateLimitCheckRequest, RefundRequest, Storage, Usage,
};

/// Options recognized by `Manager::consume`.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub idempotency_key: Option<String>,
    pub dry_run: bool,
}

/// Options recognized by `Manager::refund`. `reason` is free-form and
/// persisted verbatim.
#[derive(Debug, Clone, Default)]
pub struct RefundOptions {
    pub idempotency_key: Option<String>,
    pub reason: String,
    pub metadata: HashMap<String, String>,
}

/// Invoked synchronously when a successful consume crosses a configured
/// warning threshold upward. A single instance is registered at
/// construction time, never per-request.
#[async_trait]
pub trait WarningHandler: Send + Sync {
    async fn on_threshold_crossed(&self, usage: &Usage, threshold: f64) -> anyhow::Result<()>;
}

/// The decision engine. Cheaply `Clone`-able storage and config are held by
/// reference/Arc; `Cache` and `FallbackPolicy` are owned exclusively, as
/// described by the ownership rules this crate follows throughout.
pub struct Manager {
    storage: Arc<dyn Storage>,
    config: ManagerConfig,
    cache: Cache,
    fallback: FallbackPolicy,
    warning_handler: Option<Arc<dyn WarningHandler>>,
}

impl Manager {
    pub fn new(storage: Arc<dyn Storage>, config: ManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Cache::new(config.cache);
        let fallback = FallbackPolicy::new(config.fallback.clone());
        Ok(Self {
            storage,
            config,
            cache,
            fallback,
            warning_handler: None,
        })
    }

    /// Registers the single warning-handler instance for this Manager's
    /// lifetime. Not a per-request hook — see the trait's doc comment.
    pub fn register_warning_handler(&mut self, handler: Arc<dyn WarningHandler>) {
        self.warning_handler = Some(handler);
    }

    #[instrument(skip(self, options), fields(user_id = %user_id, resource = %resource, amount))]
    pub async fn consume(
        &self,
        user_id: &str,
        resource: &str,
        amount: i64,
        period_kind: PeriodKind,
        options: ConsumeOptions,
    ) -> Result<Usage, ManagerError> {
        if amount <= 0 {
            return Err(ManagerError::InvalidAmount);
        }

        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let entitlement = self.resolve_entitlement(user_id, deadline.clone()).await?;
        let tier_name = self.effective_tier_name(&entitlement, now);
        let tier = self.tier_or_default(&tier_name);
        let subscription_start = entitlement.as_ref().map(|e| e.subscription_start).unwrap_or(now);

        if options.dry_run {
            return self
                .quota_snapshot(user_id, resource, period_kind, tier, subscription_start, now, deadline)
                .await;
        }

        if let Some(rl_config) = tier.rate_limits.get(resource).copied() {
            if rl_config.rate > 0 {
                let decision = self
                    .storage
                    .check_rate_limit(
                        RateLimitCheckRequest {
                            user_id: user_id.to_string(),
                            resource: resource.to_string(),
                            config: rl_config,
                            now,
                        },
                        deadline.clone(),
                    )
                    .await?;
                if !decision.allowed {
                    return Err(ManagerError::RateLimitExceeded {
                        retry_after: decision.retry_after.unwrap_or_default(),
                        info: decision,
                    });
                }
            }
        }

        let order = tier.consumption_order_for(period_kind);
        let mut remaining = amount;
        let mut consumed: Vec<(Period, i64)> = Vec::new();
        let mut primary_before: Option<Usage> = None;
        let mut primary_after: Option<Usage> = None;
        let mut last_written: Option<Usage> = None;

        for kind in order {
            if remaining <= 0 {
                break;
            }

            let source_period = cycle(subscription_start, now, kind);
            let existing = self
                .get_usage_cached(user_id, resource, &source_period, deadline.clone())
                .await?;

            // An existing counter's `limit` carries forward whatever a prior
            // `ApplyTierChange` prorated it to; the tier's static quota is
            // only the seed for a row that doesn't exist yet.
            let effective_limit = match kind {
                PeriodKind::Forever => existing.as_ref().map(|u| u.limit).unwrap_or(0),
                _ => match existing.as_ref() {
                    Some(u) => u.limit,
                    None => match tier.quota_for(kind, resource) {
                        Some(limit) => limit,
                        None => continue,
                    },
                },
            };

            let existing_used = existing.as_ref().map(|u| u.used).unwrap_or(0);
            let take = if effective_limit == Usage::UNLIMITED {
                remaining
            } else {
                remaining.min((effective_limit - existing_used).max(0))
            };
            if take <= 0 {
                continue;
            }

            if kind == period_kind {
                primary_before = Some(existing.clone().unwrap_or_else(|| Usage {
                    user_id: user_id.to_string(),
                    resource: resource.to_string(),
                    period_key: source_period.key(),
                    used: 0,
                    limit: effective_limit,
                    tier_at_write: tier.name.clone(),
                    updated_at: now,
                    is_degraded: false,
                }));
            }

            let source_key = source_period.key();
            let consume_req = ConsumeRequest {
                user_id: user_id.to_string(),
                resource: resource.to_string(),
                amount: take,
                period: source_period,
                idempotency_key: options
                    .idempotency_key
                    .as_ref()
                    .map(|k| format!("{k}:{source_key}")),
                tier_name: tier.name.clone(),
                effective_limit,
            };

            let new_used = match self.storage.consume_quota(consume_req.clone(), deadline.clone()).await {
                Ok(v) => v,
                Err(StorageError::Transient(e)) => {
                    match self
                        .fallback
                        .resolve_consume(&self.cache, &consume_req, StorageError::Transient(e))
                        .await
                    {
                        Ok(usage) => usage.used,
                        Err(e) => return Err(e.into()),
                    }
                }
                // This source couldn't absorb the draw this call computed for
                // it — most commonly `QuotaExceeded`, when a concurrent
                // consume advanced `used` past what this call's snapshot of
                // `existing_used` (taken without a per-user lock, per §5)
                // assumed was still available. Treat it as contributing 0 and
                // let the remaining sources in `order` cover the rest; only
                // once every source has been tried does the end-of-loop
                // `remaining > 0` branch roll back what this call did commit
                // and raise `QuotaExceeded`.
                Err(_) => continue,
            };

            let updated = Usage {
                user_id: user_id.to_string(),
                resource: resource.to_string(),
                period_key: source_key,
                used: new_used,
                limit: effective_limit,
                tier_at_write: tier.name.clone(),
                updated_at: now,
                is_degraded: false,
            };
            self.cache.put_usage(updated.clone());
            consumed.push((source_period, take));
            remaining -= take;

            if kind == period_kind {
                primary_after = Some(updated.clone());
            }
            last_written = Some(updated);
        }

        if remaining > 0 {
            self.rollback_partial_consume(user_id, resource, &options, &consumed, deadline.clone())
                .await;
            let reported = self
                .quota_snapshot(user_id, resource, period_kind, tier, subscription_start, now, deadline)
                .await?;
            return Err(ManagerError::QuotaExceeded {
                used: reported.used,
                limit: reported.limit,
            });
        }

        if let (Some(before), Some(after)) = (&primary_before, &primary_after) {
            self.evaluate_warning_thresholds(tier, resource, before, after).await;
        }

        // `primary_after` is only set when a source at `period_kind` itself
        // absorbed part of the request. A resource with no quota defined at
        // that period (e.g. only forever credits) still satisfied the
        // request from a different source in the consumption order — report
        // that source's counter rather than a stale zero read of a period
        // that was never touched.
        match primary_after.or(last_written) {
            Some(usage) => Ok(usage),
            None => {
                self.quota_snapshot(user_id, resource, period_kind, tier, subscription_start, now, deadline)
                    .await
            }
        }
    }

    /// Best-effort compensation for sources consumed earlier in a call that
    /// ultimately failed with `QuotaExceeded`. Persistent failure here is
    /// logged and left as an auditable inconsistency, never hidden.
    async fn rollback_partial_consume(
        &self,
        user_id: &str,
        resource: &str,
        options: &ConsumeOptions,
        consumed: &[(Period, i64)],
        deadline: Deadline,
    ) {
        for (source_period, take) in consumed.iter().rev() {
            let source_key = source_period.key();
            let rollback_key = options
                .idempotency_key
                .as_ref()
                .map(|k| format!("{k}:rollback:{source_key}"));
            let refund_req = RefundRequest {
                user_id: user_id.to_string(),
                resource: resource.to_string(),
                amount: *take,
                period: *source_period,
                idempotency_key: rollback_key,
                reason: "compensating rollback of partial consume".to_string(),
                metadata: HashMap::new(),
            };
            match self.storage.refund_quota(refund_req, deadline).await {
                Ok(_) => self.cache.invalidate_usage(user_id, resource, &source_key),
                Err(e) => error!(error = %e, source = %source_key, "rollback refund failed, leaving auditable inconsistency"),
            }
        }
    }

    #[instrument(skip(self, options), fields(user_id = %user_id, resource = %resource, amount))]
    pub async fn refund(
        &self,
        user_id: &str,
        resource: &str,
        amount: i64,
        period_kind: PeriodKind,
        options: RefundOptions,
    ) -> Result<Usage, ManagerError> {
        if amount <= 0 {
            return Err(ManagerError::InvalidAmount);
        }

        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let entitlement = self.resolve_entitlement(user_id, deadline.clone()).await?;
        let subscription_start = entitlement.as_ref().map(|e| e.subscription_start).unwrap_or(now);
        let period = cycle(subscription_start, now, period_kind);

        let req = RefundRequest {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            amount,
            period,
            idempotency_key: options.idempotency_key,
            reason: options.reason,
            metadata: options.metadata,
        };
        self.storage.refund_quota(req, deadline).await?;
        self.cache.invalidate_usage(user_id, resource, &period.key());
        self.get_quota(user_id, resource, period_kind).await
    }

    /// Upserts the entitlement; on tier change, prorates every monthly quota
    /// the new tier defines and grants the new tier's forever credits
    /// exactly once, keyed so replays (e.g. a retried billing webhook) are
    /// no-ops.
    #[instrument(skip(self, entitlement), fields(user_id = %entitlement.user_id, tier = %entitlement.tier_name))]
    pub async fn set_entitlement(&self, mut entitlement: Entitlement) -> Result<(), ManagerError> {
        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let previous = self.resolve_entitlement(&entitlement.user_id, deadline.clone()).await?;
        entitlement.updated_at = now;

        let old_tier_name = previous.as_ref().map(|e| e.tier_name.clone());
        let is_tier_change = old_tier_name.as_deref() != Some(entitlement.tier_name.as_str());

        self.storage.set_entitlement(entitlement.clone(), deadline.clone()).await?;
        self.cache.put_entitlement(entitlement.clone());

        if is_tier_change {
            let old_tier = old_tier_name.as_deref().and_then(|n| self.config.tier(n));
            let new_tier = self.tier_or_default(&entitlement.tier_name);

            let period = cycle(entitlement.subscription_start, now, PeriodKind::Monthly);
            let remaining_fraction = remaining_fraction_of_cycle(&period, now);

            for (resource, &new_limit) in &new_tier.monthly_quotas {
                let old_limit = old_tier
                    .and_then(|t| t.monthly_quotas.get(resource).copied())
                    .unwrap_or(0);
                let used = self
                    .get_usage_cached(&entitlement.user_id, resource, &period, deadline.clone())
                    .await?
                    .map(|u| u.used)
                    .unwrap_or(0);
                let prorated = prorate(old_limit, new_limit, used, remaining_fraction);

                self.storage
                    .apply_tier_change(
                        ApplyTierChangeRequest {
                            user_id: entitlement.user_id.clone(),
                            resource: resource.clone(),
                            old_limit,
                            new_limit: prorated,
                            period,
                        },
                        deadline.clone(),
                    )
                    .await?;
                self.cache
                    .invalidate_usage(&entitlement.user_id, resource, &period.key());
            }

            for (resource, &amount) in &new_tier.initial_forever_credits {
                let forever_period = cycle(entitlement.subscription_start, now, PeriodKind::Forever);
                let key = format!("initial:{}:{}:{resource}", entitlement.user_id, entitlement.tier_name);
                match self
                    .storage
                    .add_limit(
                        LimitMutationRequest {
                            user_id: entitlement.user_id.clone(),
                            resource: resource.clone(),
                            amount,
                            period: forever_period,
                            idempotency_key: key,
                        },
                        deadline.clone(),
                    )
                    .await
                {
                    Ok(_) | Err(StorageError::IdempotencyKeyExists) => {}
                    Err(e) => return Err(e.into()),
                }
                self.cache
                    .invalidate_usage(&entitlement.user_id, resource, &forever_period.key());
            }
        }

        Ok(())
    }

    /// Exposes the same proration logic as `set_entitlement` for callers
    /// that already know the old/new limit delta for one resource.
    #[instrument(skip(self), fields(user_id = %user_id, resource = %resource))]
    pub async fn apply_tier_change(
        &self,
        user_id: &str,
        resource: &str,
        old_limit: i64,
        new_limit: i64,
    ) -> Result<Usage, ManagerError> {
        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let entitlement = self.resolve_entitlement(user_id, deadline.clone()).await?;
        let subscription_start = entitlement.as_ref().map(|e| e.subscription_start).unwrap_or(now);
        let period = cycle(subscription_start, now, PeriodKind::Monthly);
        let remaining_fraction = remaining_fraction_of_cycle(&period, now);
        let used = self
            .get_usage_cached(user_id, resource, &period, deadline.clone())
            .await?
            .map(|u| u.used)
            .unwrap_or(0);
        let prorated = prorate(old_limit, new_limit, used, remaining_fraction);

        self.storage
            .apply_tier_change(
                ApplyTierChangeRequest {
                    user_id: user_id.to_string(),
                    resource: resource.to_string(),
                    old_limit,
                    new_limit: prorated,
                    period,
                },
                deadline,
            )
            .await?;
        self.cache.invalidate_usage(user_id, resource, &period.key());
        self.get_quota(user_id, resource, PeriodKind::Monthly).await
    }

    #[instrument(skip(self), fields(user_id = %user_id, resource = %resource))]
    pub async fn top_up_limit(
        &self,
        user_id: &str,
        resource: &str,
        amount: i64,
        idempotency_key: String,
    ) -> Result<Usage, ManagerError> {
        if amount <= 0 {
            return Err(ManagerError::InvalidAmount);
        }
        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let entitlement = self.resolve_entitlement(user_id, deadline.clone()).await?;
        let subscription_start = entitlement.as_ref().map(|e| e.subscription_start).unwrap_or(now);
        let period = cycle(subscription_start, now, PeriodKind::Forever);

        match self
            .storage
            .add_limit(
                LimitMutationRequest {
                    user_id: user_id.to_string(),
                    resource: resource.to_string(),
                    amount,
                    period,
                    idempotency_key,
                },
                deadline,
            )
            .await
        {
            Ok(_) | Err(StorageError::IdempotencyKeyExists) => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.invalidate_usage(user_id, resource, &period.key());
        self.get_quota(user_id, resource, PeriodKind::Forever).await
    }

    pub async fn get_quota(
        &self,
        user_id: &str,
        resource: &str,
        period_kind: PeriodKind,
    ) -> Result<Usage, ManagerError> {
        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let entitlement = self.resolve_entitlement(user_id, deadline.clone()).await?;
        let tier_name = self.effective_tier_name(&entitlement, now);
        let tier = self.tier_or_default(&tier_name);
        let subscription_start = entitlement.as_ref().map(|e| e.subscription_start).unwrap_or(now);
        self.quota_snapshot(user_id, resource, period_kind, tier, subscription_start, now, deadline)
            .await
    }

    pub async fn get_current_cycle(&self, user_id: &str) -> Result<Period, ManagerError> {
        let deadline = Deadline::far_future();
        let now = self.storage.now(deadline.clone()).await?;
        let entitlement = self.resolve_entitlement(user_id, deadline).await?;
        let subscription_start = entitlement.map(|e| e.subscription_start).unwrap_or(now);
        Ok(cycle(subscription_start, now, PeriodKind::Monthly))
    }

    async fn quota_snapshot(
        &self,
        user_id: &str,
        resource: &str,
        period_kind: PeriodKind,
        tier: &TierConfig,
        subscription_start: DateTime<Utc>,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<Usage, ManagerError> {
        let period = cycle(subscription_start, now, period_kind);
        if let Some(usage) = self.get_usage_cached(user_id, resource, &period, deadline).await? {
            return Ok(usage);
        }
        let limit = match period_kind {
            PeriodKind::Forever => 0,
            kind => tier.quota_for(kind, resource).unwrap_or(0),
        };
        Ok(Usage {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            period_key: period.key(),
            used: 0,
            limit,
            tier_at_write: tier.name.clone(),
            updated_at: now,
            is_degraded: false,
        })
    }

    async fn get_usage_cached(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
        deadline: Deadline,
    ) -> Result<Option<Usage>, ManagerError> {
        let key = period.key();
        if let Some(usage) = self.cache.get_usage(user_id, resource, &key) {
            return Ok(Some(usage));
        }
        let usage = self.storage.get_usage(user_id, resource, period, deadline).await?;
        if let Some(u) = &usage {
            self.cache.put_usage(u.clone());
        }
        Ok(usage)
    }

    async fn resolve_entitlement(
        &self,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<Option<Entitlement>, ManagerError> {
        if let Some(e) = self.cache.get_entitlement(user_id) {
            return Ok(Some(e));
        }
        let entitlement = self.storage.get_entitlement(user_id, deadline).await?;
        if let Some(e) = &entitlement {
            self.cache.put_entitlement(e.clone());
        }
        Ok(entitlement)
    }

    /// An expired entitlement reads as the default tier rather than a
    /// dedicated "expired" state — the spec leaves this as an
    /// implementation choice; an absent entitlement always does.
    fn effective_tier_name(&self, entitlement: &Option<Entitlement>, now: DateTime<Utc>) -> String {
        match entitlement {
            Some(e) if !e.is_expired(now) => e.tier_name.clone(),
            _ => self.config.default_tier.clone(),
        }
    }

    fn tier_or_default(&self, tier_name: &str) -> &TierConfig {
        self.config
            .tier(tier_name)
            .unwrap_or_else(|| self.config.tier(&self.config.default_tier).expect("validated at construction"))
    }

    async fn evaluate_warning_thresholds(
        &self,
        tier: &TierConfig,
        resource: &str,
        before: &Usage,
        after: &Usage,
    ) {
        let Some(handler) = &self.warning_handler else {
            return;
        };
        let Some(thresholds) = tier.warning_thresholds.get(resource) else {
            return;
        };
        if after.is_unlimited() || after.limit <= 0 {
            return;
        }
        let limit = after.limit as f64;
        let old_frac = before.used as f64 / limit;
        let new_frac = after.used as f64 / limit;
        for threshold in thresholds {
            if old_frac < *threshold && new_frac >= *threshold {
                if let Err(e) = handler.on_threshold_crossed(after, *threshold).await {
                    warn!(error = %e, threshold, "warning handler failed, ignoring");
                }
            }
        }
    }
}

/// Fraction of the cycle that remains at `now`, in `[0, 1]`. `1.0` for an
/// unbounded period (no proration basis).
fn remaining_fraction_of_cycle(period: &Period, now: DateTime<Utc>) -> f64 {
    let Some(end) = period.end else {
        return 1.0;
    };
    let total = (end - period.start).num_milliseconds() as f64;
    if total <= 0.0 {
        return 0.0;
    }
    let elapsed = (now - period.start).num_milliseconds() as f64;
    ((total - elapsed) / total).clamp(0.0, 1.0)
}

/// `used + round_ties_even((new_limit - old_limit) * remaining_fraction)`,
/// clamped to `[used, new_limit]` — resolves the proration-rounding open
/// question with ties-to-even.
fn prorate(old_limit: i64, new_limit: i64, used: i64, remaining_fraction: f64) -> i64 {
    if old_limit == Usage::UNLIMITED || new_limit == Usage::UNLIMITED {
        return new_limit;
    }
    let delta = (new_limit - old_limit) as f64 * remaining_fraction;
    let prorated = used + delta.round_ties_even() as i64;
    prorated.clamp(used, new_limit)
}
