//! Monthly allocation of plan bundles.
//!
//! Once per billing cycle every workspace receives an INCLUDED allocation
//! per credit category sized by its plan. Lapsed INCLUDED credit is expired
//! and carried-over credit above the plan's rollover cap is forfeited in the
//! same unit of work. Re-running a cycle never grants twice.

mod cycle;

pub use cycle::BillingCycle;

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::Result;
use crate::config::LedgerSettings;
use crate::ledger::{CycleGrant, CycleOutcome, LedgerEngine};
use crate::quota::PlanCatalog;
use crate::types::{CreditCategory, Plan, WorkspaceId};

const DEFAULT_CONCURRENCY: usize = 8;

/// One workspace's result for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRun {
    pub workspace_id: WorkspaceId,
    pub cycle: String,
    pub plan: Plan,
    pub outcomes: Vec<CycleOutcome>,
}

impl AllocationRun {
    /// Credits newly granted by this run.
    pub fn granted(&self) -> Decimal {
        self.outcomes.iter().map(|o| o.granted).sum()
    }

    /// Every category had already been granted for the cycle.
    pub fn is_duplicate(&self) -> bool {
        self.outcomes.iter().any(|o| o.duplicate)
            && self
                .outcomes
                .iter()
                .all(|o| o.duplicate || o.allocation_id.is_none())
    }

    pub fn outcome(&self, category: CreditCategory) -> Option<&CycleOutcome> {
        self.outcomes.iter().find(|o| o.category == category)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorSummary {
    pub cycle: String,
    pub processed: usize,
    /// Workspaces that received a new grant.
    pub granted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct MonthlyAllocator {
    ledger: LedgerEngine,
    catalog: Arc<PlanCatalog>,
    rollover_cycles: u32,
    concurrency: usize,
}

impl MonthlyAllocator {
    pub fn new(ledger: LedgerEngine, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            ledger,
            catalog,
            rollover_cycles: 1,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Extra cycles an INCLUDED grant survives past its own.
    pub fn rollover_cycles(mut self, cycles: u32) -> Self {
        self.rollover_cycles = cycles;
        self
    }

    /// Workspaces processed in parallel by [`run_all`](Self::run_all).
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn settings(self, settings: &LedgerSettings) -> Self {
        self.rollover_cycles(settings.allocator.rollover_cycles)
            .concurrency(settings.tasks.allocation_concurrency)
    }

    pub fn ledger(&self) -> &LedgerEngine {
        &self.ledger
    }

    #[instrument(skip(self, cycle), fields(cycle = %cycle))]
    pub async fn run_cycle(
        &self,
        workspace_id: &WorkspaceId,
        cycle: &BillingCycle,
    ) -> Result<AllocationRun> {
        let workspace = self.ledger.workspace(workspace_id).await?;
        let limits = self.catalog.limits(workspace.plan);
        let expires_at = cycle.expiry_after(self.rollover_cycles);

        let mut outcomes = Vec::with_capacity(CreditCategory::ALL.len());
        for category in CreditCategory::ALL {
            let grant = CycleGrant {
                category: *category,
                amount: limits.monthly_grant(*category),
                cycle_tag: cycle.tag.clone(),
                expires_at,
                max_rollover: limits.max_rollover(*category),
            };
            outcomes.push(self.ledger.apply_cycle(workspace_id, &grant).await?);
        }

        let run = AllocationRun {
            workspace_id: *workspace_id,
            cycle: cycle.tag.clone(),
            plan: workspace.plan,
            outcomes,
        };
        if !run.is_duplicate() {
            info!(
                workspace_id = %workspace_id,
                plan = %workspace.plan,
                granted = %run.granted(),
                "Monthly allocation applied"
            );
        }
        Ok(run)
    }

    /// Runs `cycle` for every workspace. Per-workspace failures are counted,
    /// not propagated.
    pub async fn run_all(&self, cycle: &BillingCycle) -> Result<AllocatorSummary> {
        let workspaces = self.ledger.list_workspaces().await?;

        let results: Vec<(WorkspaceId, Result<AllocationRun>)> = stream::iter(workspaces)
            .map(|workspace| async move {
                let result = self.run_cycle(&workspace.id, cycle).await;
                (workspace.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = AllocatorSummary {
            cycle: cycle.tag.clone(),
            ..Default::default()
        };
        for (workspace_id, result) in results {
            match result {
                Ok(run) => {
                    summary.processed += 1;
                    if run.is_duplicate() {
                        summary.duplicates += 1;
                    } else if run.granted() > Decimal::ZERO {
                        summary.granted += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        workspace_id = %workspace_id,
                        cycle = %cycle,
                        error = %e,
                        "Monthly allocation failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            cycle = %cycle,
            processed = summary.processed,
            granted = summary.granted,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "Monthly allocation run finished"
        );
        Ok(summary)
    }

    /// Runs the cycle containing the engine's current time.
    pub async fn run_current(&self) -> Result<AllocatorSummary> {
        let cycle = BillingCycle::containing(self.ledger.now());
        self.run_all(&cycle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::RetryPolicy;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_run_cycle_grants_each_category_once() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 5, 0).unwrap());
        let ledger = LedgerEngine::builder()
            .clock(Arc::new(clock))
            .retry_policy(RetryPolicy::none())
            .build();
        let ws = ledger.create_workspace("acme", Plan::Starter).await.unwrap().id;
        let allocator = MonthlyAllocator::new(ledger.clone(), Arc::new(PlanCatalog::default()));
        let cycle = BillingCycle::parse("2024-05").unwrap();

        let first = allocator.run_cycle(&ws, &cycle).await.unwrap();
        assert!(!first.is_duplicate());
        assert_eq!(first.granted(), dec!(60));

        let again = allocator.run_cycle(&ws, &cycle).await.unwrap();
        assert!(again.is_duplicate());
        assert_eq!(again.granted(), Decimal::ZERO);

        let balance = ledger
            .get_balance(&ws, CreditCategory::ReportCredits)
            .await
            .unwrap();
        assert_eq!(balance.available, dec!(50));
    }
}
