//! Plan catalog: monthly credit bundles, rollover caps and operation quotas.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{CreditCategory, OperationType, Plan};

/// What one plan grants and allows per billing cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub report_credits: Decimal,
    pub full_credits: Decimal,
    /// Most INCLUDED report credit carried into a new cycle.
    pub max_report_rollover: Decimal,
    pub max_full_rollover: Decimal,
    /// Monthly operation quotas. Missing entries are unlimited.
    #[serde(default)]
    pub quotas: HashMap<OperationType, u64>,
}

impl PlanLimits {
    /// Rollover cap defaults to one cycle's bundle.
    pub fn new(report_credits: Decimal, full_credits: Decimal) -> Self {
        Self {
            report_credits,
            full_credits,
            max_report_rollover: report_credits,
            max_full_rollover: full_credits,
            quotas: HashMap::new(),
        }
    }

    pub fn rollover(mut self, report: Decimal, full: Decimal) -> Self {
        self.max_report_rollover = report;
        self.max_full_rollover = full;
        self
    }

    pub fn quota(mut self, operation: OperationType, limit: u64) -> Self {
        self.quotas.insert(operation, limit);
        self
    }

    pub fn monthly_grant(&self, category: CreditCategory) -> Decimal {
        match category {
            CreditCategory::ReportCredits => self.report_credits,
            CreditCategory::FullCredits => self.full_credits,
        }
    }

    pub fn max_rollover(&self, category: CreditCategory) -> Decimal {
        match category {
            CreditCategory::ReportCredits => self.max_report_rollover,
            CreditCategory::FullCredits => self.max_full_rollover,
        }
    }

    /// `None` means unlimited.
    pub fn quota_for(&self, operation: OperationType) -> Option<u64> {
        self.quotas.get(&operation).copied()
    }

    fn with_zero_quotas(mut self) -> Self {
        for operation in OperationType::ALL {
            self.quotas.insert(*operation, 0);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<Plan, PlanLimits>,
}

impl PlanCatalog {
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::new()
    }

    /// Plans missing from the catalog grant nothing and allow nothing.
    pub fn limits(&self, plan: Plan) -> PlanLimits {
        self.plans
            .get(&plan)
            .cloned()
            .unwrap_or_else(|| PlanLimits::new(Decimal::ZERO, Decimal::ZERO).with_zero_quotas())
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        PlanCatalogBuilder::new().with_defaults().build()
    }
}

#[derive(Debug, Default)]
pub struct PlanCatalogBuilder {
    plans: HashMap<Plan, PlanLimits>,
}

impl PlanCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        use OperationType::*;

        self.plans.insert(
            Plan::Free,
            PlanLimits::new(dec!(3), dec!(0))
                .quota(ReportGenerated, 5)
                .quota(FullAnalysis, 1)
                .quota(ApiCall, 1_000),
        );
        self.plans.insert(
            Plan::Starter,
            PlanLimits::new(dec!(50), dec!(10))
                .quota(ReportGenerated, 100)
                .quota(FullAnalysis, 50)
                .quota(ApiCall, 10_000),
        );
        self.plans.insert(
            Plan::Professional,
            PlanLimits::new(dec!(200), dec!(50))
                .quota(ReportGenerated, 500)
                .quota(FullAnalysis, 200)
                .quota(ApiCall, 50_000),
        );
        self.plans
            .insert(Plan::Enterprise, PlanLimits::new(dec!(1000), dec!(250)));
        self
    }

    pub fn plan(mut self, plan: Plan, limits: PlanLimits) -> Self {
        self.plans.insert(plan, limits);
        self
    }

    pub fn build(self) -> PlanCatalog {
        PlanCatalog { plans: self.plans }
    }
}

/// Usage percentages at which a quota warns and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaThresholds {
    pub soft_pct: u8,
    pub hard_pct: u8,
}

impl Default for QuotaThresholds {
    fn default() -> Self {
        Self {
            soft_pct: 80,
            hard_pct: 100,
        }
    }
}

impl QuotaThresholds {
    /// `current / limit >= pct / 100`, in integers.
    pub(crate) fn reached(current: u64, limit: u64, pct: u8) -> bool {
        u128::from(current) * 100 >= u128::from(limit) * u128::from(pct)
    }
}
