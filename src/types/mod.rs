//! Ledger data model.

mod enums;
mod ids;
pub mod metadata;
mod models;

pub use enums::{
    AllocationType, CreditCategory, HoldStatus, OperationType, ParseEnumError, Plan,
    TransactionType,
};
pub use ids::{AllocationId, HoldId, OverrideId, TransactionId, WorkspaceId};
pub use metadata::{Metadata, MetadataError, MetadataValue};
pub use models::{
    CreditAllocation, CreditHold, CreditTransaction, QuotaOverride, Workspace, source_type_of,
};
