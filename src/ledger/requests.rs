//! Operation inputs and receipts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{
    AllocationId, AllocationType, CreditCategory, CreditHold, HoldId, Metadata, TransactionId,
    WorkspaceId,
};

#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub workspace_id: WorkspaceId,
    pub category: CreditCategory,
    pub amount: Decimal,
    pub source_id: String,
    pub metadata: Metadata,
}

impl DebitRequest {
    pub fn new(
        workspace_id: WorkspaceId,
        category: CreditCategory,
        amount: Decimal,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id,
            category,
            amount,
            source_id: source_id.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub workspace_id: WorkspaceId,
    pub category: CreditCategory,
    pub amount: Decimal,
    pub source_id: String,
    pub reason: Option<String>,
    pub metadata: Metadata,
}

impl RefundRequest {
    pub fn new(
        workspace_id: WorkspaceId,
        category: CreditCategory,
        amount: Decimal,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id,
            category,
            amount,
            source_id: source_id.into(),
            reason: None,
            metadata: Metadata::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Credits entering the ledger from a purchase, promotion or plan bundle.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub workspace_id: WorkspaceId,
    pub category: CreditCategory,
    pub amount: Decimal,
    pub allocation_type: AllocationType,
    pub expires_at: Option<DateTime<Utc>>,
    /// Upstream event id; repeats with the same id are no-ops.
    pub source_id: Option<String>,
}

impl GrantRequest {
    pub fn new(
        workspace_id: WorkspaceId,
        category: CreditCategory,
        amount: Decimal,
        allocation_type: AllocationType,
    ) -> Self {
        Self {
            workspace_id,
            category,
            amount,
            allocation_type,
            expires_at: None,
            source_id: None,
        }
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub workspace_id: WorkspaceId,
    pub category: CreditCategory,
    pub amount: Decimal,
    pub source_id: String,
    /// Falls back to [`HoldPolicy::default_ttl`].
    pub ttl: Option<Duration>,
}

impl ReserveRequest {
    pub fn new(
        workspace_id: WorkspaceId,
        category: CreditCategory,
        amount: Decimal,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id,
            category,
            amount,
            source_id: source_id.into(),
            ttl: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Safety TTLs for holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldPolicy {
    pub default_ttl: Duration,
    /// Longest lifetime of a hold, measured from its creation, extensions included.
    pub max_ttl: Duration,
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(900),
            max_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Result of a debit, refund or hold consumption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_ids: Vec<TransactionId>,
    /// The source id was already applied; `transaction_ids` are the prior ones.
    pub duplicate: bool,
}

impl LedgerReceipt {
    pub(crate) fn applied(transaction_ids: Vec<TransactionId>) -> Self {
        Self {
            transaction_ids,
            duplicate: false,
        }
    }

    pub(crate) fn replayed(transaction_ids: Vec<TransactionId>) -> Self {
        Self {
            transaction_ids,
            duplicate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldReceipt {
    pub hold: CreditHold,
    pub duplicate: bool,
}

impl HoldReceipt {
    pub fn hold_id(&self) -> HoldId {
        self.hold.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReceipt {
    pub allocation_id: AllocationId,
    pub transaction_id: Option<TransactionId>,
    pub duplicate: bool,
}
