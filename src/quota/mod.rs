//! Plan quotas.
//!
//! Monthly usage is the sum of per-day counters over the current UTC
//! calendar month, so a new month starts from zero without a reset job.

mod evaluator;
mod limits;

pub use evaluator::{AccessDecision, DenialReason, QuotaEvaluator, QuotaState, QuotaStatus};
pub use limits::{PlanCatalog, PlanCatalogBuilder, PlanLimits, QuotaThresholds};
