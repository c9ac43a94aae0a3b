use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::BalanceSnapshot;
use crate::types::CreditCategory;

/// Derived balance of one credit pool. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub category: CreditCategory,
    /// Remaining credits on non-expired allocations.
    pub granted: Decimal,
    /// Held by active, unexpired holds.
    pub reserved: Decimal,
    /// `granted - reserved`.
    pub available: Decimal,
}

impl Balance {
    pub fn new(category: CreditCategory, granted: Decimal, reserved: Decimal) -> Self {
        Self {
            category,
            granted,
            reserved,
            available: granted - reserved,
        }
    }

    pub fn from_snapshot(category: CreditCategory, snapshot: BalanceSnapshot) -> Self {
        Self::new(category, snapshot.remaining, snapshot.reserved)
    }

    pub fn covers(&self, amount: Decimal) -> bool {
        self.available >= amount
    }
}
