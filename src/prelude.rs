//! Prelude module for convenient imports.
//!
//! ```rust
//! use credit_ledger::prelude::*;
//! ```

// Core types
pub use crate::Error;
pub use crate::ErrorCategory;
pub use crate::ErrorCode;
pub use crate::Result;

// Ledger
pub use crate::ledger::{
    Balance, CostTier, DebitRequest, GrantReceipt, GrantRequest, HoldReceipt, LedgerEngine,
    LedgerEngineBuilder, LedgerReceipt, RefundRequest, ReserveRequest, SweepReport,
    calculate_cost,
};

// Quota
pub use crate::quota::{AccessDecision, DenialReason, PlanCatalog, QuotaEvaluator, QuotaState, QuotaStatus};

// Allocation and background work
pub use crate::allocator::{BillingCycle, MonthlyAllocator};
pub use crate::tasks::{HoldSweeper, MonthlyAllocationTask, PurgeTask, TaskHandle};

// Storage, time and audit
pub use crate::audit::{AuditSink, MemoryAuditSink, TracingAuditSink};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::store::{LedgerStore, MemoryStore};

// Types
pub use crate::types::{
    AllocationType, CreditAllocation, CreditCategory, CreditHold, CreditTransaction, HoldId,
    HoldStatus, OperationType, Plan, TransactionType, Workspace, WorkspaceId,
};

// Config
pub use crate::config::{ConfigBuilder, LedgerSettings};
