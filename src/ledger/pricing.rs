//! Tiered credit pricing.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::CreditCategory;

/// Processes per credit once a batch is past the fixed tiers.
const PROCESSES_PER_CREDIT: u64 = 25;

/// Price band of a deep-analysis batch, by number of linked processes.
/// Upper bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostTier {
    /// 1 to 5 processes.
    Tier1,
    /// 6 to 12 processes.
    Tier2,
    /// 13 to 25 processes.
    Tier3,
    /// More than 25 processes, one credit per started block of 25.
    Tier4,
}

impl CostTier {
    /// `None` for an empty batch.
    pub fn for_process_count(count: u64) -> Option<Self> {
        match count {
            0 => None,
            1..=5 => Some(Self::Tier1),
            6..=12 => Some(Self::Tier2),
            13..=25 => Some(Self::Tier3),
            _ => Some(Self::Tier4),
        }
    }

    pub fn cost(&self, count: u64) -> Decimal {
        match self {
            Self::Tier1 => dec!(0.25),
            Self::Tier2 => dec!(0.5),
            Self::Tier3 => dec!(1.0),
            Self::Tier4 => Decimal::from(count.div_ceil(PROCESSES_PER_CREDIT)),
        }
    }
}

/// Credits charged for `unit_count` units of work in `category`.
///
/// Reports are priced per document at a flat single credit. Deep analyses
/// are priced by [`CostTier`]. Zero units cost nothing.
pub fn calculate_cost(category: CreditCategory, unit_count: u64) -> Decimal {
    if unit_count == 0 {
        return Decimal::ZERO;
    }
    match category {
        CreditCategory::ReportCredits => Decimal::ONE,
        CreditCategory::FullCredits => CostTier::for_process_count(unit_count)
            .map(|tier| tier.cost(unit_count))
            .unwrap_or(Decimal::ZERO),
    }
}
