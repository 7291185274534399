//! Write-through read cache for entitlements and usage, with independently
//! configured per-kind TTLs.
//!
//! A single in-process `DashMap` tier — this crate ships no Redis adapter,
//! so the two-tier shape the teacher's `TieredCache` used for entitlements
//! and spend counters collapses to one tier here. A cache miss is not an
//! error; it simply sends the caller to `Storage`.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::storage::{Entitlement, Usage};

struct Entry<T> {
    value: T,
    inserted_at: Instant,
}

/// TTLs for each cached kind. Entitlement TTL is minutes-scale; usage TTL
/// is seconds-scale, per the data model's expected churn rate.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub entitlement_ttl: Duration,
    pub usage_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entitlement_ttl: Duration::from_secs(5 * 60),
            usage_ttl: Duration::from_secs(10),
        }
    }
}

pub struct Cache {
    config: CacheConfig,
    entitlements: DashMap<String, Entry<Entitlement>>,
    usage: DashMap<String, Entry<Usage>>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entitlements: DashMap::new(),
            usage: DashMap::new(),
        }
    }

    pub fn get_entitlement(&self, user_id: &str) -> Option<Entitlement> {
        let entry = self.entitlements.get(user_id)?;
        if entry.inserted_at.elapsed() > self.config.entitlement_ttl {
            drop(entry);
            self.entitlements.remove(user_id);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put_entitlement(&self, entitlement: Entitlement) {
        self.entitlements.insert(
            entitlement.user_id.clone(),
            Entry {
                value: entitlement,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_entitlement(&self, user_id: &str) {
        self.entitlements.remove(user_id);
    }

    fn usage_key(user_id: &str, resource: &str, period_key: &str) -> String {
        format!("{user_id}:{resource}:{period_key}")
    }

    pub fn get_usage(&self, user_id: &str, resource: &str, period_key: &str) -> Option<Usage> {
        let key = Self::usage_key(user_id, resource, period_key);
        let entry = self.usage.get(&key)?;
        if entry.inserted_at.elapsed() > self.config.usage_ttl {
            drop(entry);
            self.usage.remove(&key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Like `get_usage`, but additionally rejects an entry older than
    /// `max_age` — a bound independent of this cache's own `usage_ttl`, used
    /// by the Fallback Policy's cache rung to honor its configured
    /// `max_staleness` rather than whatever TTL this cache happens to be
    /// configured with.
    pub fn get_usage_if_fresher_than(
        &self,
        user_id: &str,
        resource: &str,
        period_key: &str,
        max_age: Duration,
    ) -> Option<Usage> {
        let key = Self::usage_key(user_id, resource, period_key);
        let entry = self.usage.get(&key)?;
        let age = entry.inserted_at.elapsed();
        if age > self.config.usage_ttl {
            drop(entry);
            self.usage.remove(&key);
            return None;
        }
        if age > max_age {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put_usage(&self, usage: Usage) {
        let key = Self::usage_key(&usage.user_id, &usage.resource, &usage.period_key);
        self.usage.insert(
            key,
            Entry {
                value: usage,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_usage(&self, user_id: &str, resource: &str, period_key: &str) {
        self.usage.remove(&Self::usage_key(user_id, resource, period_key));
    }
}
