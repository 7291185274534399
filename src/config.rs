//! `Manager` configuration.
//!
//! No CLI surface and no environment variables live in this crate — the
//! embedding application constructs `ManagerConfig` however it wants
//! (env vars, a config file, a database row) and passes it to
//! `Manager::new`. Every field is plain, `serde`-(de)serializable data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::errors::ConfigError;
use crate::period::PeriodKind;
use crate::rate_limit::RateLimitConfig;
use crate::storage::Storage;

/// A named set of quota and rate-limit parameters. Process-static once a
/// `Manager` is constructed — tiers are never mutated in place, only
/// swapped for a new `ManagerConfig` at the next `Manager::new` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub monthly_quotas: HashMap<String, i64>,
    pub daily_quotas: HashMap<String, i64>,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    #[serde(default)]
    pub warning_thresholds: HashMap<String, Vec<f64>>,
    #[serde(default)]
    pub initial_forever_credits: HashMap<String, i64>,
    /// Ordered list of period kinds a consume draws from. Defaults to
    /// `[requested kind, Forever]` when empty — see `TierConfig::consumption_order_for`.
    #[serde(default)]
    pub consumption_order: Vec<PeriodKind>,
}

impl TierConfig {
    /// Effective consumption order for a request against `requested_kind`.
    pub fn consumption_order_for(&self, requested_kind: PeriodKind) -> Vec<PeriodKind> {
        if self.consumption_order.is_empty() {
            vec![requested_kind, PeriodKind::Forever]
        } else {
            self.consumption_order.clone()
        }
    }

    pub fn quota_for(&self, kind: PeriodKind, resource: &str) -> Option<i64> {
        match kind {
            PeriodKind::Daily => self.daily_quotas.get(resource).copied(),
            PeriodKind::Monthly => self.monthly_quotas.get(resource).copied(),
            PeriodKind::Forever => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub use_cache: bool,
    pub use_secondary_storage: bool,
    pub secondary: Option<Arc<dyn Storage>>,
    /// How old a cached usage entry may be for the cache rung of the
    /// Fallback Policy to serve it — independent of `Cache`'s own
    /// `usage_ttl`. Defaults to zero, which means the cache rung never
    /// serves a result until this is set explicitly.
    pub max_staleness: Duration,
    pub optimistic_allowance_pct: f64,
}

impl std::fmt::Debug for FallbackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackConfig")
            .field("enabled", &self.enabled)
            .field("use_cache", &self.use_cache)
            .field("use_secondary_storage", &self.use_secondary_storage)
            .field("secondary", &self.secondary.is_some())
            .field("max_staleness", &self.max_staleness)
            .field("optimistic_allowance_pct", &self.optimistic_allowance_pct)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub default_tier: String,
    pub tiers: HashMap<String, TierConfig>,
    pub cache: CacheConfig,
    pub fallback: FallbackConfig,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(ConfigError::UnknownDefaultTier(self.default_tier.clone()));
        }

        for tier in self.tiers.values() {
            // A `rate == 0` entry is the documented bypass sentinel, not an
            // error — the Manager skips the limiter entirely for it.
            let mut seen = std::collections::HashSet::new();
            for k in &tier.consumption_order {
                if !seen.insert(*k) {
                    return Err(ConfigError::InvalidConsumptionOrder {
                        tier: tier.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.get(name)
    }
}
