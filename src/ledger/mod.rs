//! Ledger engine: balances, debits, refunds, grants and holds.
//!
//! Every mutation runs inside one workspace-scoped [`LedgerTx`]: the
//! balance check that gates a write is read inside the same unit of work as
//! the write, and a failed operation leaves nothing behind.
//!
//! [`LedgerTx`]: crate::store::LedgerTx

mod balance;
mod engine;
mod holds;
mod pricing;
mod requests;

pub use balance::Balance;
pub use engine::{CycleGrant, CycleOutcome, LedgerEngine, LedgerEngineBuilder};
pub use holds::SweepReport;
pub use pricing::{CostTier, calculate_cost};
pub use requests::{
    DebitRequest, GrantReceipt, GrantRequest, HoldPolicy, HoldReceipt, LedgerReceipt,
    RefundRequest, ReserveRequest,
};

use rust_decimal::Decimal;

use crate::{Error, Result};

/// Maximum decimal places of a credit amount.
pub const CREDIT_SCALE: u32 = 4;

/// Rejects non-positive amounts and amounts finer than [`CREDIT_SCALE`].
/// Amounts are never rounded.
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(Error::invalid(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    let normalized = amount.normalize();
    if normalized.scale() > CREDIT_SCALE {
        return Err(Error::invalid(format!(
            "amount {} has more than {} decimal places",
            amount, CREDIT_SCALE
        )));
    }
    Ok(normalized)
}

pub(crate) fn validate_source_id(source_id: &str) -> Result<()> {
    if source_id.trim().is_empty() {
        return Err(Error::invalid("source_id must not be empty"));
    }
    if source_id.len() > 255 {
        return Err(Error::invalid("source_id exceeds 255 characters"));
    }
    Ok(())
}
