//! Persisted ledger records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{AllocationType, CreditCategory, HoldStatus, OperationType, Plan, TransactionType};
use super::ids::{AllocationId, HoldId, OverrideId, TransactionId, WorkspaceId};
use super::metadata::Metadata;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, plan: Plan, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkspaceId::new(),
            name: name.into(),
            plan,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn change_plan(&mut self, plan: Plan, now: DateTime<Utc>) {
        self.plan = plan;
        self.updated_at = now;
    }
}

/// One grant of credits with its own expiration and remaining balance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditAllocation {
    pub id: AllocationId,
    pub workspace_id: WorkspaceId,
    pub category: CreditCategory,
    pub allocation_type: AllocationType,
    pub amount_granted: Decimal,
    pub amount_remaining: Decimal,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Billing cycle for INCLUDED grants, e.g. `2024-05`.
    #[serde(default)]
    pub cycle_tag: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    /// Set when this allocation was created to replace an expunged one on refund.
    #[serde(default)]
    pub replaces: Option<AllocationId>,
}

impl CreditAllocation {
    pub fn new(
        workspace_id: WorkspaceId,
        category: CreditCategory,
        allocation_type: AllocationType,
        amount: Decimal,
        granted_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: AllocationId::new(),
            workspace_id,
            category,
            allocation_type,
            amount_granted: amount,
            amount_remaining: amount,
            granted_at,
            expires_at,
            cycle_tag: None,
            source_id: None,
            replaces: None,
        }
    }

    pub fn with_cycle(mut self, cycle_tag: impl Into<String>) -> Self {
        self.cycle_tag = Some(cycle_tag.into());
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }

    /// Eligible for debit: not expired and has something left.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.amount_remaining > Decimal::ZERO
    }

    /// Fully used up and past expiry; safe to purge.
    pub fn is_retired(&self, now: DateTime<Utc>) -> bool {
        self.amount_remaining.is_zero() && self.is_expired(now)
    }

    /// Room left before `amount_remaining` would exceed `amount_granted`.
    pub fn headroom(&self) -> Decimal {
        self.amount_granted - self.amount_remaining
    }

    /// `0 <= amount_remaining <= amount_granted`.
    pub fn check_invariant(&self) -> Result<(), String> {
        if self.amount_remaining < Decimal::ZERO {
            return Err(format!("negative remaining balance {}", self.amount_remaining));
        }
        if self.amount_remaining > self.amount_granted {
            return Err(format!(
                "remaining {} exceeds granted {}",
                self.amount_remaining, self.amount_granted
            ));
        }
        Ok(())
    }

    /// FIFO order: soonest expiry first, non-expiring last, then oldest grant.
    pub fn fifo_cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| self.granted_at.cmp(&other.granted_at))
    }
}

/// Immutable audit record of one balance mutation on one allocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub workspace_id: WorkspaceId,
    pub transaction_type: TransactionType,
    pub category: CreditCategory,
    /// Signed: debits and expirations are negative.
    pub amount: Decimal,
    pub allocation_id: Option<AllocationId>,
    pub source_id: Option<String>,
    pub source_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CreditTransaction {
    pub fn new(
        workspace_id: WorkspaceId,
        transaction_type: TransactionType,
        category: CreditCategory,
        amount: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            workspace_id,
            transaction_type,
            category,
            amount,
            allocation_id: None,
            source_id: None,
            source_type: None,
            created_at,
            metadata: Metadata::new(),
        }
    }

    pub fn on_allocation(mut self, allocation_id: AllocationId) -> Self {
        self.allocation_id = Some(allocation_id);
        self
    }

    pub fn with_source(mut self, source_id: Option<&str>) -> Self {
        self.source_type = source_id.and_then(source_type_of);
        self.source_id = source_id.map(str::to_string);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Extracts the `report` in `report:123`.
pub fn source_type_of(source_id: &str) -> Option<String> {
    source_id
        .split_once(':')
        .map(|(kind, _)| kind)
        .filter(|kind| !kind.is_empty())
        .map(str::to_string)
}

/// Reservation of credits for an in-flight operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditHold {
    pub id: HoldId,
    pub workspace_id: WorkspaceId,
    pub category: CreditCategory,
    pub amount_reserved: Decimal,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: HoldStatus,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl CreditHold {
    pub fn new(
        workspace_id: WorkspaceId,
        category: CreditCategory,
        amount: Decimal,
        source_id: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: HoldId::new(),
            workspace_id,
            category,
            amount_reserved: amount,
            source_id: source_id.into(),
            created_at,
            expires_at,
            status: HoldStatus::Active,
            settled_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Counts against available balance.
    pub fn is_reserving(&self, now: DateTime<Utc>) -> bool {
        self.status == HoldStatus::Active && !self.is_expired(now)
    }

    pub fn settle(&mut self, status: HoldStatus, now: DateTime<Utc>) {
        self.status = status;
        self.settled_at = Some(now);
    }
}

/// Audited bypass of a hard quota block for one billing period.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaOverride {
    pub id: OverrideId,
    pub workspace_id: WorkspaceId,
    pub operation: OperationType,
    pub admin_id: String,
    pub reason: String,
    pub period_tag: String,
    pub created_at: DateTime<Utc>,
}
