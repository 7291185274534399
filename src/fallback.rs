//! Degradation ladder run when primary `Storage` returns `Transient`.
//!
//! Three rungs, tried in order: a fresh cache read, a secondary `Storage`,
//! then a bounded optimistic allowance. Any rung that produces an allow
//! decision tags the returned `Usage` with `is_degraded = true` so callers
//! can surface a warning — the Manager never hides a degraded decision from
//! its caller.

use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;

use crate::cache::Cache;
use crate::config::FallbackConfig;
use crate::errors::StorageError;
use crate::storage::{ConsumeRequest, Storage, Usage};

/// Runs the rungs in `FallbackConfig` order and tracks pending optimistic
/// debt. Owned exclusively by the Manager, same as `Cache`.
pub struct FallbackPolicy {
    config: FallbackConfig,
    /// Debt accrued by the optimistic-allowance rung, keyed by
    /// `(user_id, resource)`. Not persisted — an embedding application reads
    /// this via `pending_optimistic_debt` to drive its own reconciliation.
    pending_debt: DashMap<(String, String), i64>,
}

impl FallbackPolicy {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            pending_debt: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Total unbacked consumption currently owed for `(user_id, resource)`.
    pub fn pending_optimistic_debt(&self, user_id: &str, resource: &str) -> i64 {
        self.pending_debt
            .get(&(user_id.to_string(), resource.to_string()))
            .map(|d| *d)
            .unwrap_or(0)
    }

    /// Run the degradation ladder for a consume that failed with
    /// `StorageError::Transient` on the primary store. Returns the degraded
    /// `Usage` on success, or the original transient error if every
    /// configured rung is exhausted.
    #[tracing::instrument(skip(self, cache, req), fields(user_id = %req.user_id, resource = %req.resource))]
    pub async fn resolve_consume(
        &self,
        cache: &Cache,
        req: &ConsumeRequest,
        primary_error: StorageError,
    ) -> Result<Usage, StorageError> {
        if !self.config.enabled {
            return Err(primary_error);
        }

        if self.config.use_cache {
            if let Some(mut usage) = cache.get_usage_if_fresher_than(
                &req.user_id,
                &req.resource,
                &req.period.key(),
                self.config.max_staleness,
            ) {
                warn!("serving degraded decision from cache after primary storage failure");
                usage.is_degraded = true;
                return Ok(usage);
            }
        }

        if self.config.use_secondary_storage {
            if let Some(secondary) = &self.config.secondary {
                return self.consume_via_secondary(secondary.as_ref(), req).await;
            }
        }

        if self.config.optimistic_allowance_pct > 0.0 {
            if let Some(usage) = self.optimistic_allow(cache, req) {
                return Ok(usage);
            }
        }

        warn!("all fallback rungs exhausted, surfacing transient error");
        Err(primary_error)
    }

    async fn consume_via_secondary(
        &self,
        secondary: &dyn Storage,
        req: &ConsumeRequest,
    ) -> Result<Usage, StorageError> {
        warn!("delegating consume to secondary storage after primary failure");
        let deadline = crate::storage::Deadline::after(Duration::from_secs(5));
        let new_used = secondary.consume_quota(req.clone(), deadline).await?;
        let limit = secondary
            .get_usage(&req.user_id, &req.resource, &req.period, deadline)
            .await?
            .map(|u| u.limit)
            .unwrap_or(Usage::UNLIMITED);
        Ok(Usage {
            user_id: req.user_id.clone(),
            resource: req.resource.clone(),
            period_key: req.period.key(),
            used: new_used,
            limit,
            tier_at_write: req.tier_name.clone(),
            updated_at: req.period.start,
            is_degraded: true,
        })
    }

    /// Allow up to `optimistic_allowance_pct * limit` units of unbacked
    /// consumption beyond the last known cached usage. Returns `None` when
    /// no cached usage exists to compute a limit from, or the allowance is
    /// already exhausted.
    fn optimistic_allow(&self, cache: &Cache, req: &ConsumeRequest) -> Option<Usage> {
        let cached = cache.get_usage(&req.user_id, &req.resource, &req.period.key())?;
        if cached.is_unlimited() {
            let mut usage = cached;
            usage.is_degraded = true;
            return Some(usage);
        }

        let allowance = (cached.limit as f64 * self.config.optimistic_allowance_pct).floor() as i64;
        let key = (req.user_id.clone(), req.resource.clone());
        let mut debt_entry = self.pending_debt.entry(key).or_insert(0);
        let projected_used = cached.used + req.amount;
        let over_limit = (projected_used - cached.limit).max(0);

        if *debt_entry + over_limit > allowance {
            return None;
        }

        *debt_entry += over_limit;
        warn!(
            debt = *debt_entry,
            allowance, "allowing optimistic unbacked consumption"
        );

        Some(Usage {
            user_id: req.user_id.clone(),
            resource: req.resource.clone(),
            period_key: req.period.key(),
            used: projected_used,
            limit: cached.limit,
            tier_at_write: req.tier_name.clone(),
            updated_at: cached.updated_at,
            is_degraded: true,
        })
    }
}
