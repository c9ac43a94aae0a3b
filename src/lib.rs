//! # credit-ledger
//!
//! Prepaid credit ledger with holds and quota enforcement for multi-tenant
//! SaaS workspaces.
//!
//! Credits live in expiring allocations that are consumed FIFO, every
//! balance mutation appends immutable transactions, in-flight work reserves
//! credits through holds, and operation rates are gated by monthly quotas.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use credit_ledger::prelude::*;
//! use rust_decimal_macros::dec;
//!
//! # async fn example() -> credit_ledger::Result<()> {
//! let ledger = LedgerEngine::builder().build();
//! let workspace = ledger.create_workspace("acme", Plan::Starter).await?;
//!
//! ledger
//!     .grant_credits(GrantRequest::new(
//!         workspace.id,
//!         CreditCategory::ReportCredits,
//!         dec!(10),
//!         AllocationType::Purchased,
//!     ))
//!     .await?;
//!
//! let hold = ledger
//!     .reserve(ReserveRequest::new(
//!         workspace.id,
//!         CreditCategory::ReportCredits,
//!         dec!(1),
//!         "report:42",
//!     ))
//!     .await?;
//!
//! // ... generate the report ...
//! let receipt = ledger.consume_hold(&hold.hold_id()).await?;
//! println!("debited in {} transaction(s)", receipt.transaction_ids.len());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod allocator;
pub mod audit;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod observability;
pub mod prelude;
pub mod quota;
pub mod store;
pub mod tasks;
pub mod types;

use rust_decimal::Decimal;

pub use allocator::{AllocationRun, AllocatorSummary, BillingCycle, MonthlyAllocator};
pub use audit::{AuditAction, AuditError, AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigBuilder, ConfigError, LedgerSettings};
pub use ledger::{
    Balance, CREDIT_SCALE, CostTier, DebitRequest, GrantReceipt, GrantRequest, HoldPolicy,
    HoldReceipt, LedgerEngine, LedgerEngineBuilder, LedgerReceipt, RefundRequest, ReserveRequest,
    SweepReport, calculate_cost,
};
pub use observability::{LedgerMetrics, MetricsSummary};
pub use quota::{
    AccessDecision, DenialReason, PlanCatalog, PlanCatalogBuilder, PlanLimits, QuotaEvaluator,
    QuotaState, QuotaStatus, QuotaThresholds,
};
pub use store::{LedgerStore, LedgerTx, MemoryStore, RetryPolicy, StoreError, StoreResult};
pub use tasks::{HoldSweeper, MonthlyAllocationTask, PurgeTask, TaskHandle};
pub use types::{
    AllocationId, AllocationType, CreditAllocation, CreditCategory, CreditHold, CreditTransaction,
    HoldId, HoldStatus, Metadata, MetadataError, MetadataValue, OperationType, OverrideId, Plan,
    QuotaOverride, TransactionId, TransactionType, Workspace, WorkspaceId,
};

#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresStore};

/// Error type for ledger operations.
///
/// Duplicate `source_id` submissions are not errors: they return the prior
/// receipt with `duplicate` set.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Available balance does not cover the request. Nothing was written.
    #[error(
        "Insufficient {category} balance: {required} required, {available} available (short by {shortfall})"
    )]
    InsufficientBalance {
        category: CreditCategory,
        required: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },

    /// Hold was already consumed, released or has expired.
    #[error("Hold {hold_id} is not active (status {status}{})", if *expired { ", expired" } else { "" })]
    HoldNotActive {
        hold_id: HoldId,
        status: HoldStatus,
        expired: bool,
    },

    /// Monthly quota for the operation is exhausted and no override exists.
    #[error("Quota exceeded for {operation}: {current}/{limit} this period")]
    QuotaHardBlocked {
        operation: OperationType,
        current: u64,
        limit: u64,
    },

    /// An allocation violates `0 <= remaining <= granted`. The mutating
    /// transaction was aborted.
    #[error("Allocation {allocation_id} is inconsistent: {message}")]
    AllocationInconsistent {
        allocation_id: AllocationId,
        message: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Request parameters are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Storage failed; check [`Error::is_retryable`].
    #[error(transparent)]
    Storage(StoreError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection loss or lock conflicts; the whole operation may be retried.
    Transient,
    /// Balance or quota exhausted; recoverable by purchase, upgrade or override.
    ResourceLimit,
    /// Bad input or a call that does not fit the current state.
    CallerError,
    /// Ledger data violates an invariant and needs operator attention.
    Invariant,
    Configuration,
    Internal,
}

/// Stable machine-readable codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InsufficientBalance,
    HoldNotActive,
    QuotaHardBlocked,
    AllocationInconsistent,
    NotFound,
    InvalidRequest,
    StorageUnavailable,
    Configuration,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::HoldNotActive => "HOLD_NOT_ACTIVE",
            Self::QuotaHardBlocked => "QUOTA_HARD_BLOCKED",
            Self::AllocationInconsistent => "ALLOCATION_INCONSISTENT",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::Configuration => "CONFIGURATION",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    pub(crate) fn insufficient(
        category: CreditCategory,
        required: Decimal,
        available: Decimal,
    ) -> Self {
        let available = available.max(Decimal::ZERO);
        Error::InsufficientBalance {
            category,
            required,
            available,
            shortfall: required - available,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Storage(e) if e.is_retryable() => ErrorCategory::Transient,
            Error::Storage(StoreError::NotFound { .. }) => ErrorCategory::CallerError,
            Error::Storage(_) => ErrorCategory::Internal,

            Error::InsufficientBalance { .. } | Error::QuotaHardBlocked { .. } => {
                ErrorCategory::ResourceLimit
            }

            Error::HoldNotActive { .. } | Error::NotFound { .. } | Error::InvalidRequest(_) => {
                ErrorCategory::CallerError
            }

            Error::AllocationInconsistent { .. } => ErrorCategory::Invariant,

            Error::Config(_) => ErrorCategory::Configuration,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            Error::HoldNotActive { .. } => ErrorCode::HoldNotActive,
            Error::QuotaHardBlocked { .. } => ErrorCode::QuotaHardBlocked,
            Error::AllocationInconsistent { .. } => ErrorCode::AllocationInconsistent,
            Error::NotFound { .. } | Error::Storage(StoreError::NotFound { .. }) => {
                ErrorCode::NotFound
            }
            Error::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Error::Storage(_) => ErrorCode::StorageUnavailable,
            Error::Config(_) => ErrorCode::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_resource_limit(&self) -> bool {
        self.category() == ErrorCategory::ResourceLimit
    }

    /// True for failures of the storage layer itself, as opposed to
    /// business-rule rejections.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Error::Storage(e) if !matches!(e, StoreError::NotFound { .. }))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Error::NotFound { entity, id },
            other => Error::Storage(other),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::InvalidRequest(format!("metadata: {}", err))
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, Error>;
