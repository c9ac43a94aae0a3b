//! Monthly allocation: idempotent cycles, expiry of lapsed grants and rollover caps.
//!
//! Run: cargo nextest run --test allocator_tests

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use credit_ledger::prelude::*;
use credit_ledger::{AuditAction, LedgerSettings, MetadataValue, PlanLimits, RetryPolicy};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const REPORT: CreditCategory = CreditCategory::ReportCredits;
const FULL: CreditCategory = CreditCategory::FullCredits;

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

struct Fixture {
    clock: ManualClock,
    audit: MemoryAuditSink,
    ledger: LedgerEngine,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(at(2024, 5, 1));
    let audit = MemoryAuditSink::new();
    let ledger = LedgerEngine::builder()
        .clock(Arc::new(clock.clone()))
        .audit(Arc::new(audit.clone()))
        .retry_policy(RetryPolicy::none())
        .build();
    Fixture {
        clock,
        audit,
        ledger,
    }
}

fn allocator(fx: &Fixture, catalog: PlanCatalog) -> MonthlyAllocator {
    MonthlyAllocator::new(fx.ledger.clone(), Arc::new(catalog))
}

async fn available(fx: &Fixture, ws: &WorkspaceId, category: CreditCategory) -> Decimal {
    fx.ledger.get_balance(ws, category).await.unwrap().available
}

// =============================================================================
// Idempotency
// =============================================================================

mod idempotency_tests {
    use super::*;

    #[tokio::test]
    async fn test_cycle_grants_once() {
        let fx = fixture();
        let allocator = allocator(&fx, PlanCatalog::default());
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
        let may = BillingCycle::parse("2024-05").unwrap();

        let first = allocator.run_cycle(&ws, &may).await.unwrap();
        assert_eq!(first.granted(), dec!(60));
        assert!(!first.is_duplicate());

        let second = allocator.run_cycle(&ws, &may).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(second.granted(), Decimal::ZERO);
        assert_eq!(
            second.outcome(REPORT).and_then(|o| o.allocation_id),
            first.outcome(REPORT).and_then(|o| o.allocation_id)
        );

        assert_eq!(available(&fx, &ws, REPORT).await, dec!(50));
        assert_eq!(available(&fx, &ws, FULL).await, dec!(10));

        let included: Vec<_> = fx
            .ledger
            .allocations(&ws)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.allocation_type == AllocationType::Included)
            .collect();
        assert_eq!(included.len(), 2);
        assert!(included.iter().all(|a| a.cycle_tag.as_deref() == Some("2024-05")));
        assert!(included.iter().all(|a| a.expires_at == Some(at(2024, 7, 1))));
    }

    #[tokio::test]
    async fn test_run_all_summarises_workspaces() {
        let fx = fixture();
        let allocator = allocator(&fx, PlanCatalog::default())
            .settings(&LedgerSettings::default())
            .concurrency(2);
        for (name, plan) in [
            ("free", Plan::Free),
            ("starter", Plan::Starter),
            ("enterprise", Plan::Enterprise),
        ] {
            fx.ledger.create_workspace(name, plan).await.unwrap();
        }

        let summary = allocator.run_current().await.unwrap();
        assert_eq!(summary.cycle, "2024-05");
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.granted, 3);
        assert_eq!(summary.failed, 0);

        let again = allocator.run_current().await.unwrap();
        assert_eq!(again.duplicates, 3);
        assert_eq!(again.granted, 0);
        assert_eq!(fx.audit.events_for(AuditAction::Grant).await.len(), 5);
    }

    #[tokio::test]
    async fn test_plan_change_applies_next_cycle() {
        let fx = fixture();
        let allocator = allocator(&fx, PlanCatalog::default()).rollover_cycles(0);
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;

        allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-05").unwrap())
            .await
            .unwrap();
        fx.ledger.change_plan(&ws, Plan::Professional).await.unwrap();
        assert_eq!(available(&fx, &ws, REPORT).await, dec!(50));

        fx.clock.set(at(2024, 6, 1));
        let june = allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-06").unwrap())
            .await
            .unwrap();
        assert_eq!(june.plan, Plan::Professional);
        assert_eq!(available(&fx, &ws, REPORT).await, dec!(200));
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let fx = fixture();
        let err = allocator(&fx, PlanCatalog::default())
            .run_cycle(&WorkspaceId::new(), &BillingCycle::parse("2024-05").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}

// =============================================================================
// Expiry and rollover
// =============================================================================

mod rollover_tests {
    use super::*;

    #[tokio::test]
    async fn test_lapsed_included_credit_expires() {
        let fx = fixture();
        let allocator = allocator(&fx, PlanCatalog::default()).rollover_cycles(0);
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;

        allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-05").unwrap())
            .await
            .unwrap();
        fx.ledger
            .debit(DebitRequest::new(ws, REPORT, dec!(5), "report:may"))
            .await
            .unwrap();

        fx.clock.set(at(2024, 6, 1));
        let june = allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-06").unwrap())
            .await
            .unwrap();
        let report = june.outcome(REPORT).unwrap();
        assert_eq!(report.expired, dec!(45));
        assert_eq!(report.granted, dec!(50));
        assert_eq!(available(&fx, &ws, REPORT).await, dec!(50));

        let expirations: Vec<_> = fx
            .ledger
            .transactions(&ws)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.transaction_type == TransactionType::Expiration && t.category == REPORT)
            .collect();
        assert_eq!(expirations.len(), 1);
        assert_eq!(expirations[0].amount, dec!(-45));
        assert_eq!(
            expirations[0].metadata.get("reason"),
            Some(&MetadataValue::Text("expired".into()))
        );
        assert_eq!(fx.audit.events_for(AuditAction::Expiration).await.len(), 2);
    }

    #[tokio::test]
    async fn test_rollover_above_cap_is_trimmed() {
        let fx = fixture();
        let catalog = PlanCatalog::builder()
            .with_defaults()
            .plan(
                Plan::Starter,
                PlanLimits::new(dec!(50), dec!(10)).rollover(dec!(20), dec!(10)),
            )
            .build();
        let allocator = allocator(&fx, catalog);
        let ws = fx.ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;

        allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-05").unwrap())
            .await
            .unwrap();
        fx.ledger
            .debit(DebitRequest::new(ws, REPORT, dec!(10), "report:batch"))
            .await
            .unwrap();

        fx.clock.set(at(2024, 6, 1));
        let june = allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-06").unwrap())
            .await
            .unwrap();

        let report = june.outcome(REPORT).unwrap();
        assert_eq!(report.trimmed, dec!(20));
        assert_eq!(report.expired, Decimal::ZERO);
        assert_eq!(available(&fx, &ws, REPORT).await, dec!(70));

        let full = june.outcome(FULL).unwrap();
        assert_eq!(full.trimmed, Decimal::ZERO);
        assert_eq!(available(&fx, &ws, FULL).await, dec!(20));

        let trims = fx.audit.events_for(AuditAction::RolloverTrim).await;
        assert_eq!(trims.len(), 1);
        assert_eq!(trims[0].amount, Some(dec!(20)));
    }

    #[tokio::test]
    async fn test_purchased_credit_is_never_trimmed() {
        let fx = fixture();
        let catalog = PlanCatalog::builder()
            .plan(Plan::Free, PlanLimits::new(dec!(3), dec!(0)).rollover(dec!(0), dec!(0)))
            .build();
        let allocator = allocator(&fx, catalog);
        let ws = fx.ledger.create_workspace("acme", Plan::Free).await.unwrap().id;
        fx.ledger
            .grant_credits(GrantRequest::new(ws, REPORT, dec!(7), AllocationType::Purchased))
            .await
            .unwrap();

        allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-05").unwrap())
            .await
            .unwrap();
        fx.clock.set(at(2024, 6, 1));
        let june = allocator
            .run_cycle(&ws, &BillingCycle::parse("2024-06").unwrap())
            .await
            .unwrap();

        assert_eq!(june.outcome(REPORT).unwrap().trimmed, dec!(3));
        assert_eq!(available(&fx, &ws, REPORT).await, dec!(10));
    }
}
