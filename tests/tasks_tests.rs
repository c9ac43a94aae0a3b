//! Background tasks driven through their public handles.
//!
//! Run: cargo nextest run --test tasks_tests

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use credit_ledger::prelude::*;
use credit_ledger::{LedgerSettings, RetryPolicy};
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

const REPORT: CreditCategory = CreditCategory::ReportCredits;

fn engine(clock: &ManualClock) -> LedgerEngine {
    LedgerEngine::builder()
        .clock(Arc::new(clock.clone()))
        .retry_policy(RetryPolicy::none())
        .build()
}

#[tokio::test]
async fn test_sweeper_releases_abandoned_holds() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap());
    let ledger = engine(&clock);
    let ws = ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
    ledger
        .grant_credits(GrantRequest::new(ws, REPORT, dec!(5), AllocationType::Purchased))
        .await
        .unwrap();
    let hold = ledger
        .reserve(ReserveRequest::new(ws, REPORT, dec!(5), "report:abandoned").ttl(Duration::from_secs(60)))
        .await
        .unwrap();
    clock.advance(chrono::Duration::minutes(10));

    let handle = HoldSweeper::new(ledger.clone())
        .interval(Duration::from_millis(10))
        .spawn();

    let mut released = false;
    for _ in 0..200 {
        let holds = ledger.holds(&ws).await.unwrap();
        if holds
            .iter()
            .any(|h| h.id == hold.hold_id() && h.status == HoldStatus::Released)
        {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert!(released, "sweeper never released the expired hold");
    assert_eq!(ledger.metrics().holds_force_released.get(), 1);
}

#[tokio::test]
async fn test_sweeper_batch_size_from_settings() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap());
    let ledger = engine(&clock);
    let ws = ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
    ledger
        .grant_credits(GrantRequest::new(ws, REPORT, dec!(5), AllocationType::Purchased))
        .await
        .unwrap();
    for i in 0..3 {
        ledger
            .reserve(
                ReserveRequest::new(ws, REPORT, dec!(1), format!("report:{i}"))
                    .ttl(Duration::from_secs(30)),
            )
            .await
            .unwrap();
    }
    clock.advance(chrono::Duration::minutes(1));

    let mut settings = LedgerSettings::default();
    settings.tasks.sweep_batch_size = 2;
    let sweeper = HoldSweeper::new(ledger.clone()).settings(&settings);

    assert_eq!(sweeper.run_once().await.unwrap().released, 2);
    assert_eq!(sweeper.run_once().await.unwrap().released, 1);
    assert_eq!(sweeper.run_once().await.unwrap().released, 0);
}

#[tokio::test]
async fn test_purge_removes_retired_allocations() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
    let ledger = engine(&clock);
    let ws = ledger.create_workspace("acme", Plan::Free).await.unwrap().id;

    let spent = ledger
        .grant_credits(
            GrantRequest::new(ws, REPORT, dec!(1), AllocationType::Promotional)
                .expires_at(clock.now() + chrono::Duration::days(1)),
        )
        .await
        .unwrap();
    ledger
        .grant_credits(GrantRequest::new(ws, REPORT, dec!(2), AllocationType::Purchased))
        .await
        .unwrap();
    ledger
        .debit(DebitRequest::new(ws, REPORT, dec!(1), "report:old"))
        .await
        .unwrap();

    let purge = PurgeTask::new(ledger.clone());
    assert_eq!(purge.run_once().await.unwrap(), 0);

    clock.advance(chrono::Duration::days(120));
    assert_eq!(purge.run_once().await.unwrap(), 1);

    let allocations = ledger.allocations(&ws).await.unwrap();
    assert_eq!(allocations.len(), 1);
    assert!(allocations.iter().all(|a| a.id != spent.allocation_id));
    // History survives the purge.
    assert_eq!(ledger.transactions(&ws).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_allocation_task_runs_current_cycle() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 5, 0).unwrap());
    let ledger = engine(&clock);
    let ws = ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
    let allocator = MonthlyAllocator::new(ledger.clone(), Arc::new(PlanCatalog::default()));

    let token = CancellationToken::new();
    let handle = MonthlyAllocationTask::new(allocator)
        .interval(Duration::from_millis(10))
        .spawn_with(token.clone());

    let mut granted = false;
    for _ in 0..200 {
        if ledger.get_balance(&ws, REPORT).await.unwrap().available == dec!(50) {
            granted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    handle.shutdown().await;

    assert!(granted, "allocation task never granted the cycle");
    // Repeated ticks in the same cycle never grant twice.
    assert_eq!(ledger.get_balance(&ws, REPORT).await.unwrap().available, dec!(50));
}
