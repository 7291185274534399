//! End-to-end tests against `Manager` backed by the in-memory reference
//! `Storage`. Exercises the public API the way an embedding application
//! would, rather than reaching into internals the way the `#[cfg(test)]`
//! unit modules beside each component do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use meterly::cache::CacheConfig;
use meterly::config::FallbackConfig;
use meterly::memory_storage::InMemoryStorage;
use meterly::rate_limit::{RateLimitAlgorithm, RateLimitConfig};
use meterly::{ConsumeOptions, Entitlement, Manager, ManagerConfig, ManagerError, PeriodKind, RefundOptions, Storage, TierConfig};

fn tier(name: &str) -> TierConfig {
    TierConfig {
        name: name.to_string(),
        monthly_quotas: HashMap::new(),
        daily_quotas: HashMap::new(),
        rate_limits: HashMap::new(),
        warning_thresholds: HashMap::new(),
        initial_forever_credits: HashMap::new(),
        consumption_order: Vec::new(),
    }
}

fn config(tiers: Vec<TierConfig>, default_tier: &str) -> ManagerConfig {
    let mut map = HashMap::new();
    for t in tiers {
        map.insert(t.name.clone(), t);
    }
    ManagerConfig {
        default_tier: default_tier.to_string(),
        tiers: map,
        cache: CacheConfig::default(),
        fallback: FallbackConfig::default(),
    }
}

async fn entitle(manager: &Manager, user_id: &str, tier_name: &str, start: chrono::DateTime<Utc>) {
    manager
        .set_entitlement(Entitlement {
            user_id: user_id.to_string(),
            tier_name: tier_name.to_string(),
            subscription_start: start,
            expires_at: None,
            updated_at: start,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn partial_consume_across_sources_rolls_back_on_final_shortfall() {
    // monthly.api_calls = 10, no forever credits granted. Consuming from a
    // tier whose consumption_order is [monthly, forever] should drain the
    // 10 remaining monthly units, then fail against an empty forever source
    // and roll the monthly draw back out — leaving `used` at its pre-call
    // value, not partially applied.
    let mut pro = tier("pro");
    pro.monthly_quotas.insert("api_calls".to_string(), 10);
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![pro], "pro")).unwrap();

    entitle(&manager, "u1", "pro", Utc::now()).await;
    manager
        .consume("u1", "api_calls", 7, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap();

    let err = manager
        .consume("u1", "api_calls", 10, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::QuotaExceeded { .. }));

    let usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.used, 7, "the 3 units drawn from monthly before the shortfall must be rolled back");
}

#[tokio::test]
async fn concurrent_consumes_for_same_counter_sum_correctly_and_exactly_one_fails() {
    let mut pro = tier("pro");
    pro.monthly_quotas.insert("api_calls".to_string(), 100);
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Arc::new(Manager::new(storage, config(vec![pro], "pro")).unwrap());
    entitle(&manager, "u1", "pro", Utc::now()).await;

    // Ten concurrent calls of 15 each against a limit of 100: at most 6 can
    // succeed (90 used), leaving exactly 4 to fail with QuotaExceeded.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let m = manager.clone();
        handles.push(tokio::spawn(async move {
            m.consume("u1", "api_calls", 15, PeriodKind::Monthly, ConsumeOptions::default())
                .await
        }));
    }

    let mut ok = 0;
    let mut exceeded = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(ManagerError::QuotaExceeded { .. }) => exceeded += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 6);
    assert_eq!(exceeded, 4);

    let usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.used, 90);
}

#[tokio::test]
async fn concurrent_consumes_sharing_an_idempotency_key_persist_exactly_once() {
    let mut pro = tier("pro");
    pro.monthly_quotas.insert("api_calls".to_string(), 1000);
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Arc::new(Manager::new(storage, config(vec![pro], "pro")).unwrap());
    entitle(&manager, "u1", "pro", Utc::now()).await;

    let opts = ConsumeOptions {
        idempotency_key: Some("shared-key".to_string()),
        dry_run: false,
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let m = manager.clone();
        let o = opts.clone();
        handles.push(tokio::spawn(async move {
            m.consume("u1", "api_calls", 5, PeriodKind::Monthly, o).await.unwrap()
        }));
    }
    let results: Vec<_> = futures_join_all(handles).await;
    for usage in &results {
        assert_eq!(usage.used, 5, "every replay must return the original new_used");
    }

    let final_usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(final_usage.used, 5, "the delta must apply exactly once regardless of replay count");
}

async fn futures_join_all<T>(handles: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

#[tokio::test]
async fn daily_quota_is_independent_of_monthly_quota() {
    let mut pro = tier("pro");
    pro.monthly_quotas.insert("api_calls".to_string(), 1000);
    pro.daily_quotas.insert("api_calls".to_string(), 5);
    pro.consumption_order = vec![PeriodKind::Daily];
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![pro], "pro")).unwrap();
    entitle(&manager, "u1", "pro", Utc::now()).await;

    manager
        .consume("u1", "api_calls", 5, PeriodKind::Daily, ConsumeOptions::default())
        .await
        .unwrap();
    let err = manager
        .consume("u1", "api_calls", 1, PeriodKind::Daily, ConsumeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::QuotaExceeded { used: 5, limit: 5 }));

    let monthly = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(monthly.used, 0, "the daily draw never touched the monthly counter");
}

#[tokio::test]
async fn rate_limit_and_quota_exceeded_are_distinguishable_errors() {
    let mut free = tier("free");
    free.monthly_quotas.insert("api_calls".to_string(), 2);
    free.rate_limits.insert(
        "api_calls".to_string(),
        RateLimitConfig {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            rate: 1,
            window: Duration::from_secs(60),
            burst: None,
        },
    );
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![free], "free")).unwrap();
    entitle(&manager, "u1", "free", Utc::now()).await;

    manager
        .consume("u1", "api_calls", 1, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap();
    let err = manager
        .consume("u1", "api_calls", 1, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::RateLimitExceeded { .. }));

    // quota has 1 of 2 used — confirm the rate limiter, not the quota check,
    // is what rejected the second call.
    let usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.used, 1);
}

#[tokio::test]
async fn set_entitlement_upgrade_prorates_and_grants_forever_credits_once() {
    let mut free = tier("free");
    free.monthly_quotas.insert("api_calls".to_string(), 100);
    let mut pro = tier("pro");
    pro.monthly_quotas.insert("api_calls".to_string(), 1000);
    pro.initial_forever_credits.insert("bonus_tokens".to_string(), 200);

    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![free, pro], "free")).unwrap();

    let start = Utc::now() - ChronoDuration::days(10);
    entitle(&manager, "u1", "free", start).await;
    manager
        .consume("u1", "api_calls", 20, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap();

    entitle(&manager, "u1", "pro", start).await;

    let usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.used, 20, "used carries across a tier change");
    assert!(usage.limit >= 20 && usage.limit <= 1000);

    let bonus = manager.get_quota("u1", "bonus_tokens", PeriodKind::Forever).await.unwrap();
    assert_eq!(bonus.limit, 200);

    // Re-applying the same tier (idempotent replay of the initial grant via
    // its derived key) must not double-grant the forever credits.
    entitle(&manager, "u1", "free", start).await;
    entitle(&manager, "u1", "pro", start).await;
    let bonus_again = manager.get_quota("u1", "bonus_tokens", PeriodKind::Forever).await.unwrap();
    assert_eq!(bonus_again.limit, 200);
}

#[tokio::test]
async fn refund_with_distinct_keys_creates_two_refund_records() {
    let mut free = tier("free");
    free.monthly_quotas.insert("api_calls".to_string(), 100);
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage.clone(), config(vec![free], "free")).unwrap();
    entitle(&manager, "u1", "free", Utc::now()).await;

    manager
        .consume("u1", "api_calls", 50, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap();

    manager
        .refund(
            "u1",
            "api_calls",
            20,
            PeriodKind::Monthly,
            RefundOptions {
                idempotency_key: Some("refund-1".to_string()),
                reason: "test".to_string(),
                metadata: HashMap::new(),
            },
        )
        .await
        .unwrap();
    manager
        .refund(
            "u1",
            "api_calls",
            10,
            PeriodKind::Monthly,
            RefundOptions {
                idempotency_key: Some("refund-2".to_string()),
                reason: "test".to_string(),
                metadata: HashMap::new(),
            },
        )
        .await
        .unwrap();

    let usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.used, 20);

    let deadline = meterly::storage::Deadline::far_future();
    assert!(storage.get_refund_record("refund-1", deadline).await.unwrap().is_some());
    assert!(storage.get_refund_record("refund-2", deadline).await.unwrap().is_some());
}

#[tokio::test]
async fn top_up_is_idempotent_and_survives_across_tier_downgrade() {
    let pro = tier("pro");
    let free = tier("free");
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![pro, free], "free")).unwrap();
    entitle(&manager, "u1", "pro", Utc::now()).await;

    let usage1 = manager.top_up_limit("u1", "gpt4", 500, "topup-1".to_string()).await.unwrap();
    assert_eq!(usage1.limit, 500);

    // Replaying the same key must not double the balance.
    let usage2 = manager.top_up_limit("u1", "gpt4", 500, "topup-1".to_string()).await.unwrap();
    assert_eq!(usage2.limit, 500);

    entitle(&manager, "u1", "free", Utc::now()).await;
    let after_downgrade = manager.get_quota("u1", "gpt4", PeriodKind::Forever).await.unwrap();
    assert_eq!(after_downgrade.limit, 500);
}

#[tokio::test]
async fn dry_run_never_persists_a_consumption() {
    let mut free = tier("free");
    free.monthly_quotas.insert("api_calls".to_string(), 100);
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![free], "free")).unwrap();
    entitle(&manager, "u1", "free", Utc::now()).await;

    for _ in 0..5 {
        manager
            .consume(
                "u1",
                "api_calls",
                40,
                PeriodKind::Monthly,
                ConsumeOptions {
                    idempotency_key: None,
                    dry_run: true,
                },
            )
            .await
            .unwrap();
    }

    let usage = manager.get_quota("u1", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.used, 0);
}

#[tokio::test]
async fn unentitled_user_reads_default_tier_quota_without_erroring() {
    let mut free = tier("free");
    free.monthly_quotas.insert("api_calls".to_string(), 25);
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![free], "free")).unwrap();

    // No set_entitlement call at all for "ghost" — EntitlementNotFound must
    // never surface; it resolves to the default tier instead.
    let usage = manager.get_quota("ghost", "api_calls", PeriodKind::Monthly).await.unwrap();
    assert_eq!(usage.limit, 25);
    assert_eq!(usage.used, 0);

    let consumed = manager
        .consume("ghost", "api_calls", 10, PeriodKind::Monthly, ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(consumed.used, 10);
}

#[tokio::test]
async fn get_current_cycle_reflects_subscription_anniversary() {
    let storage = Arc::new(InMemoryStorage::new());
    let manager = Manager::new(storage, config(vec![tier("free")], "free")).unwrap();
    let start = Utc::now() - ChronoDuration::days(40);
    entitle(&manager, "u1", "free", start).await;

    let cycle = manager.get_current_cycle("u1").await.unwrap();
    assert_eq!(cycle.kind, PeriodKind::Monthly);
    assert!(cycle.start <= Utc::now());
    assert!(cycle.end.unwrap() > Utc::now());
}
