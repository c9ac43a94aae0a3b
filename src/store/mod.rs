//! Ledger storage backends.
//!
//! A [`LedgerStore`] persists workspaces, allocations, transactions, holds,
//! daily usage counters and quota overrides. Every balance mutation goes
//! through a [`LedgerTx`], a workspace-scoped unit of work that holds the
//! workspace's ledger lock until it is committed or dropped. Dropping a
//! transaction without committing discards all of its writes.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresStore};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{
    AllocationId, AllocationType, CreditAllocation, CreditCategory, CreditHold, CreditTransaction,
    HoldId, OperationType, QuotaOverride, Workspace, WorkspaceId,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    /// Serialization failure or lock timeout; the whole unit of work may be retried.
    #[error("Transaction conflict: {message}")]
    Conflict { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Remaining credits on live allocations and the amount held against them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub remaining: Decimal,
    pub reserved: Decimal,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    async fn save_workspace(&self, workspace: &Workspace) -> StoreResult<()>;

    async fn load_workspace(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>>;

    async fn list_workspaces(&self) -> StoreResult<Vec<Workspace>>;

    /// Opens a unit of work holding the workspace's ledger lock, waiting for it if needed.
    async fn begin(&self, workspace_id: &WorkspaceId) -> StoreResult<Box<dyn LedgerTx>>;

    /// Like [`begin`](Self::begin) but returns `None` instead of waiting when
    /// the ledger is locked by another unit of work.
    async fn try_begin(&self, workspace_id: &WorkspaceId)
    -> StoreResult<Option<Box<dyn LedgerTx>>>;

    /// Consistent read of remaining and reserved credits.
    async fn balance_snapshot(
        &self,
        workspace_id: &WorkspaceId,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<BalanceSnapshot>;

    async fn load_hold(&self, id: &HoldId) -> StoreResult<Option<CreditHold>>;

    async fn list_allocations(&self, workspace_id: &WorkspaceId)
    -> StoreResult<Vec<CreditAllocation>>;

    /// Transactions in the order they were written.
    async fn list_transactions(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<CreditTransaction>>;

    async fn list_holds(&self, workspace_id: &WorkspaceId) -> StoreResult<Vec<CreditHold>>;

    async fn workspaces_with_expired_holds(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkspaceId>>;

    /// Deletes exhausted allocations whose expiry is before `expired_before`.
    async fn purge_retired_allocations(&self, expired_before: DateTime<Utc>) -> StoreResult<usize>;

    /// Adds one to the day's counter and returns the new value.
    async fn increment_usage(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        day: NaiveDate,
    ) -> StoreResult<u64>;

    /// Sum of daily counters for `from..=to`.
    async fn usage_between(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<u64>;

    async fn save_override(&self, record: &QuotaOverride) -> StoreResult<()>;

    async fn find_override(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        period_tag: &str,
    ) -> StoreResult<Option<QuotaOverride>>;
}

/// Workspace-scoped unit of work. Reads return locked rows.
#[async_trait]
pub trait LedgerTx: Send {
    fn workspace_id(&self) -> WorkspaceId;

    /// Non-expired allocations with remaining credits, FIFO ordered.
    async fn live_allocations(
        &mut self,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreditAllocation>>;

    /// Allocations of a type that still hold credits, expired or not, FIFO ordered.
    async fn allocations_with_remaining(
        &mut self,
        category: CreditCategory,
        allocation_type: AllocationType,
    ) -> StoreResult<Vec<CreditAllocation>>;

    async fn allocation(&mut self, id: &AllocationId) -> StoreResult<Option<CreditAllocation>>;

    async fn cycle_allocation(
        &mut self,
        category: CreditCategory,
        cycle_tag: &str,
    ) -> StoreResult<Option<CreditAllocation>>;

    async fn insert_allocation(&mut self, allocation: &CreditAllocation) -> StoreResult<()>;

    async fn update_allocation(&mut self, allocation: &CreditAllocation) -> StoreResult<()>;

    /// Sum reserved by active, unexpired holds.
    async fn reserved_total(
        &mut self,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<Decimal>;

    /// Transactions carrying `source_id`, in write order.
    async fn source_transactions(
        &mut self,
        category: CreditCategory,
        source_id: &str,
    ) -> StoreResult<Vec<CreditTransaction>>;

    async fn insert_transactions(&mut self, transactions: &[CreditTransaction]) -> StoreResult<()>;

    async fn hold(&mut self, id: &HoldId) -> StoreResult<Option<CreditHold>>;

    async fn active_hold_for_source(
        &mut self,
        category: CreditCategory,
        source_id: &str,
    ) -> StoreResult<Option<CreditHold>>;

    async fn expired_active_holds(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<CreditHold>>;

    async fn insert_hold(&mut self, hold: &CreditHold) -> StoreResult<()>;

    async fn update_hold(&mut self, hold: &CreditHold) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

pub(crate) async fn with_retry<F, Fut, T, E>(
    policy: RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    operation: F,
) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying ledger transaction after transient failure"
                );
                // ±10% jitter
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
