//! Quota classification, overrides and the authorization gate.
//!
//! Run: cargo nextest run --test quota_tests

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use credit_ledger::prelude::*;
use credit_ledger::{AuditAction, PlanLimits, QuotaThresholds, RetryPolicy};
use rust_decimal_macros::dec;

struct Fixture {
    store: Arc<MemoryStore>,
    clock: ManualClock,
    audit: MemoryAuditSink,
    ledger: LedgerEngine,
    quotas: QuotaEvaluator,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 15, 9, 0, 0).unwrap());
    let audit = MemoryAuditSink::new();
    let ledger = LedgerEngine::builder()
        .store(store.clone())
        .clock(Arc::new(clock.clone()))
        .audit(Arc::new(audit.clone()))
        .retry_policy(RetryPolicy::none())
        .build();
    let quotas = QuotaEvaluator::new(ledger.clone(), Arc::new(PlanCatalog::default()));
    Fixture {
        store,
        clock,
        audit,
        ledger,
        quotas,
    }
}

async fn use_times(fx: &Fixture, ws: &WorkspaceId, operation: OperationType, times: u64) {
    for _ in 0..times {
        fx.quotas.record_usage(ws, operation).await.unwrap();
    }
}

// =============================================================================
// Classification
// =============================================================================

mod classification_tests {
    use super::*;

    #[tokio::test]
    async fn test_threshold_boundaries() {
        let fx = fixture();
        // Starter: 100 reports per month.
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
        let op = OperationType::ReportGenerated;

        use_times(&fx, &ws, op, 79).await;
        let status = fx.quotas.check_quota(&ws, op).await.unwrap();
        assert_eq!(status.status, QuotaState::Allowed);
        assert_eq!(status.current, 79);
        assert_eq!(status.limit, Some(100));
        assert_eq!(status.period, "2024-05");

        use_times(&fx, &ws, op, 1).await;
        let status = fx.quotas.check_quota(&ws, op).await.unwrap();
        assert_eq!(status.status, QuotaState::SoftWarning);
        assert!(status.allowed);
        assert!(status.is_soft_warning());

        use_times(&fx, &ws, op, 19).await;
        assert!(fx.quotas.check_quota(&ws, op).await.unwrap().allowed);

        use_times(&fx, &ws, op, 1).await;
        let status = fx.quotas.check_quota(&ws, op).await.unwrap();
        assert_eq!(status.status, QuotaState::HardBlocked);
        assert!(!status.allowed);
        assert!((status.percentage - 100.0).abs() < f64::EPSILON);

        let err = fx.quotas.enforce_quota(&ws, op).await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaHardBlocked {
                current: 100,
                limit: 100,
                ..
            }
        ));
        assert_eq!(err.code(), ErrorCode::QuotaHardBlocked);
    }

    #[tokio::test]
    async fn test_usage_is_counted_per_period() {
        let fx = fixture();
        let ws = fx.ledger.create_workspace("acme", Plan::Free).await.unwrap().id;
        let op = OperationType::FullAnalysis;

        use_times(&fx, &ws, op, 1).await;
        assert!(!fx.quotas.check_quota(&ws, op).await.unwrap().allowed);

        fx.clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let status = fx.quotas.check_quota(&ws, op).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.current, 0);
        assert_eq!(status.period, "2024-06");
    }

    #[tokio::test]
    async fn test_unlimited_operations() {
        let fx = fixture();
        let ws = fx
            .ledger
            .create_workspace("bigco", Plan::Enterprise)
            .await
            .unwrap()
            .id;

        use_times(&fx, &ws, OperationType::ApiCall, 3).await;
        let status = fx.quotas.check_quota(&ws, OperationType::ApiCall).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.limit, None);
        assert_eq!(status.current, 3);
    }

    #[tokio::test]
    async fn test_custom_thresholds_and_zero_limit() {
        let fx = fixture();
        let catalog = PlanCatalog::builder()
            .plan(
                Plan::Starter,
                PlanLimits::new(dec!(0), dec!(0))
                    .quota(OperationType::ReportGenerated, 10)
                    .quota(OperationType::FullAnalysis, 0),
            )
            .build();
        let quotas = QuotaEvaluator::new(fx.ledger.clone(), Arc::new(catalog)).thresholds(
            QuotaThresholds {
                soft_pct: 50,
                hard_pct: 90,
            },
        );
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;

        let zero = quotas.check_quota(&ws, OperationType::FullAnalysis).await.unwrap();
        assert_eq!(zero.status, QuotaState::HardBlocked);

        use_times(&fx, &ws, OperationType::ReportGenerated, 5).await;
        let op = OperationType::ReportGenerated;
        assert_eq!(quotas.check_quota(&ws, op).await.unwrap().status, QuotaState::SoftWarning);
        use_times(&fx, &ws, op, 4).await;
        assert_eq!(quotas.check_quota(&ws, op).await.unwrap().status, QuotaState::HardBlocked);

        // Plans missing from the catalog allow nothing.
        let free = fx.ledger.create_workspace("tiny", Plan::Free).await.unwrap().id;
        assert!(!quotas.check_quota(&free, OperationType::ApiCall).await.unwrap().allowed);
    }
}

// =============================================================================
// Overrides
// =============================================================================

mod override_tests {
    use super::*;

    #[tokio::test]
    async fn test_override_lifts_block_once_per_period() {
        let fx = fixture();
        let ws = fx.ledger.create_workspace("acme", Plan::Free).await.unwrap().id;
        let op = OperationType::FullAnalysis;
        use_times(&fx, &ws, op, 1).await;
        assert!(!fx.quotas.check_quota(&ws, op).await.unwrap().allowed);

        let first = fx
            .quotas
            .admin_override_quota(&ws, op, "admin-7", "customer escalation")
            .await
            .unwrap();
        let second = fx
            .quotas
            .admin_override_quota(&ws, op, "admin-7", "customer escalation")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.period_tag, "2024-05");

        let status = fx.quotas.check_quota(&ws, op).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.status, QuotaState::HardBlocked);
        assert_eq!(status.override_by.as_deref(), Some("admin-7"));

        let events = fx.audit.events_for(AuditAction::QuotaOverride).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor.as_deref(), Some("admin-7"));

        // The override does not carry into the next period.
        fx.clock.set(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
        use_times(&fx, &ws, op, 1).await;
        assert!(!fx.quotas.check_quota(&ws, op).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_override_requires_admin_and_reason() {
        let fx = fixture();
        let ws = fx.ledger.create_workspace("acme", Plan::Free).await.unwrap().id;
        let op = OperationType::ApiCall;

        assert!(fx.quotas.admin_override_quota(&ws, op, " ", "why").await.is_err());
        assert!(fx.quotas.admin_override_quota(&ws, op, "admin", "").await.is_err());
        assert!(fx.audit.is_empty().await);
    }
}

// =============================================================================
// Failure handling
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_outage_fails_closed() {
        let fx = fixture();
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;

        fx.store.set_usage_unavailable(true);
        let status = fx
            .quotas
            .check_quota(&ws, OperationType::ReportGenerated)
            .await
            .unwrap();
        assert!(!status.allowed);
        assert!(status.degraded);
        assert_eq!(status.status, QuotaState::HardBlocked);

        let decision = fx
            .quotas
            .authorize(&ws, OperationType::ReportGenerated, CreditCategory::ReportCredits, dec!(1))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(DenialReason::QuotaHardBlocked));
    }

    #[tokio::test]
    async fn test_balance_outage_fails_open() {
        let fx = fixture();
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;

        fx.store.set_ledger_unavailable(true);
        let decision = fx
            .quotas
            .authorize(&ws, OperationType::FullAnalysis, CreditCategory::FullCredits, dec!(0.5))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.needs_reconciliation);
        assert!(decision.balance.is_none());
        assert_eq!(fx.ledger.metrics().balance_fail_open.get(), 1);
    }
}

// =============================================================================
// Authorization
// =============================================================================

mod authorize_tests {
    use super::*;

    #[tokio::test]
    async fn test_authorize_reports_shortfall() {
        let fx = fixture();
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
        fx.ledger
            .grant_credits(GrantRequest::new(
                ws,
                CreditCategory::FullCredits,
                dec!(0.25),
                AllocationType::Purchased,
            ))
            .await
            .unwrap();

        let cost = calculate_cost(CreditCategory::FullCredits, 8);
        let decision = fx
            .quotas
            .authorize(&ws, OperationType::FullAnalysis, CreditCategory::FullCredits, cost)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(
            decision.denial,
            Some(DenialReason::InsufficientBalance {
                shortfall: dec!(0.25)
            })
        );
        assert!(!decision.needs_reconciliation);

        let cheap = calculate_cost(CreditCategory::FullCredits, 3);
        let decision = fx
            .quotas
            .authorize(&ws, OperationType::FullAnalysis, CreditCategory::FullCredits, cheap)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.balance.map(|b| b.available), Some(dec!(0.25)));
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let fx = fixture();
        let err = fx
            .quotas
            .check_quota(&WorkspaceId::new(), OperationType::ApiCall)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
