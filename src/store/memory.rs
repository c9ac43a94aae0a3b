//! In-memory ledger store (for testing and single-instance deployments).
//!
//! Each workspace's ledger sits behind its own async mutex, giving the
//! same isolation as row-locking the workspace in SQL. A unit of work edits
//! a private copy of the ledger and publishes it on commit, so an abandoned
//! transaction leaves no trace.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{BalanceSnapshot, LedgerStore, LedgerTx, StoreError, StoreResult};
use crate::types::{
    AllocationId, AllocationType, CreditAllocation, CreditCategory, CreditHold, CreditTransaction,
    HoldId, HoldStatus, OperationType, QuotaOverride, Workspace, WorkspaceId,
};

#[derive(Debug, Default, Clone)]
struct Book {
    allocations: Vec<CreditAllocation>,
    transactions: Vec<CreditTransaction>,
    holds: Vec<CreditHold>,
}

impl Book {
    fn snapshot(&self, category: CreditCategory, now: DateTime<Utc>) -> BalanceSnapshot {
        BalanceSnapshot {
            remaining: self
                .allocations
                .iter()
                .filter(|a| a.category == category && a.is_live(now))
                .map(|a| a.amount_remaining)
                .sum(),
            reserved: self
                .holds
                .iter()
                .filter(|h| h.category == category && h.is_reserving(now))
                .map(|h| h.amount_reserved)
                .sum(),
        }
    }
}

type UsageKey = (WorkspaceId, OperationType, NaiveDate);
type OverrideKey = (WorkspaceId, OperationType, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    workspaces: DashMap<WorkspaceId, Workspace>,
    books: DashMap<WorkspaceId, Arc<Mutex<Book>>>,
    hold_index: Arc<DashMap<HoldId, WorkspaceId>>,
    usage: DashMap<UsageKey, u64>,
    overrides: DashMap<OverrideKey, QuotaOverride>,
    ledger_unavailable: AtomicBool,
    usage_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage of the balance tables. Workspace records stay readable.
    pub fn set_ledger_unavailable(&self, unavailable: bool) {
        self.ledger_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Simulates an outage of the usage counters and override records.
    pub fn set_usage_unavailable(&self, unavailable: bool) {
        self.usage_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }

    fn ledger_up(&self) -> StoreResult<()> {
        if self.ledger_unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("ledger tables unreachable"))
        } else {
            Ok(())
        }
    }

    fn usage_up(&self) -> StoreResult<()> {
        if self.usage_unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("usage counters unreachable"))
        } else {
            Ok(())
        }
    }

    fn book(&self, workspace_id: &WorkspaceId) -> StoreResult<Arc<Mutex<Book>>> {
        self.books
            .get(workspace_id)
            .map(|b| Arc::clone(&b))
            .ok_or_else(|| StoreError::NotFound {
                entity: "workspace",
                id: workspace_id.to_string(),
            })
    }

    fn open(&self, workspace_id: &WorkspaceId, guard: OwnedMutexGuard<Book>) -> Box<dyn LedgerTx> {
        let working = guard.clone();
        Box::new(MemoryTx {
            workspace_id: *workspace_id,
            guard,
            working,
            hold_index: Arc::clone(&self.hold_index),
        })
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save_workspace(&self, workspace: &Workspace) -> StoreResult<()> {
        self.books.entry(workspace.id).or_default();
        self.workspaces.insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn load_workspace(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>> {
        Ok(self.workspaces.get(id).map(|w| w.clone()))
    }

    async fn list_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let mut all: Vec<Workspace> = self.workspaces.iter().map(|w| w.clone()).collect();
        all.sort_by_key(|w| w.created_at);
        Ok(all)
    }

    async fn begin(&self, workspace_id: &WorkspaceId) -> StoreResult<Box<dyn LedgerTx>> {
        self.ledger_up()?;
        let guard = self.book(workspace_id)?.lock_owned().await;
        Ok(self.open(workspace_id, guard))
    }

    async fn try_begin(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Option<Box<dyn LedgerTx>>> {
        self.ledger_up()?;
        match self.book(workspace_id)?.try_lock_owned() {
            Ok(guard) => Ok(Some(self.open(workspace_id, guard))),
            Err(_) => Ok(None),
        }
    }

    async fn balance_snapshot(
        &self,
        workspace_id: &WorkspaceId,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<BalanceSnapshot> {
        self.ledger_up()?;
        let book = self.book(workspace_id)?;
        let book = book.lock().await;
        Ok(book.snapshot(category, now))
    }

    async fn load_hold(&self, id: &HoldId) -> StoreResult<Option<CreditHold>> {
        self.ledger_up()?;
        let Some(workspace_id) = self.hold_index.get(id).map(|w| *w) else {
            return Ok(None);
        };
        let book = self.book(&workspace_id)?;
        let book = book.lock().await;
        Ok(book.holds.iter().find(|h| h.id == *id).cloned())
    }

    async fn list_allocations(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<CreditAllocation>> {
        self.ledger_up()?;
        let book = self.book(workspace_id)?;
        let book = book.lock().await;
        Ok(book.allocations.clone())
    }

    async fn list_transactions(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<CreditTransaction>> {
        self.ledger_up()?;
        let book = self.book(workspace_id)?;
        let book = book.lock().await;
        Ok(book.transactions.clone())
    }

    async fn list_holds(&self, workspace_id: &WorkspaceId) -> StoreResult<Vec<CreditHold>> {
        self.ledger_up()?;
        let book = self.book(workspace_id)?;
        let book = book.lock().await;
        Ok(book.holds.clone())
    }

    async fn workspaces_with_expired_holds(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkspaceId>> {
        self.ledger_up()?;
        let books: Vec<(WorkspaceId, Arc<Mutex<Book>>)> = self
            .books
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut ids = Vec::new();
        for (id, book) in books {
            // A locked ledger is busy with live traffic; the next sweep picks it up.
            let Ok(book) = book.try_lock() else {
                continue;
            };
            if book
                .holds
                .iter()
                .any(|h| h.status == HoldStatus::Active && h.is_expired(now))
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn purge_retired_allocations(&self, expired_before: DateTime<Utc>) -> StoreResult<usize> {
        self.ledger_up()?;
        let books: Vec<Arc<Mutex<Book>>> = self.books.iter().map(|e| Arc::clone(e.value())).collect();

        let mut purged = 0;
        for book in books {
            let mut book = book.lock().await;
            let before = book.allocations.len();
            book.allocations.retain(|a| {
                !(a.amount_remaining.is_zero()
                    && a.expires_at.is_some_and(|expires| expires < expired_before))
            });
            purged += before - book.allocations.len();
        }
        Ok(purged)
    }

    async fn increment_usage(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        day: NaiveDate,
    ) -> StoreResult<u64> {
        self.usage_up()?;
        let mut count = self.usage.entry((*workspace_id, operation, day)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn usage_between(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<u64> {
        self.usage_up()?;
        Ok(self
            .usage
            .iter()
            .filter(|e| {
                let (ws, op, day) = e.key();
                ws == workspace_id && *op == operation && *day >= from && *day <= to
            })
            .map(|e| *e.value())
            .sum())
    }

    async fn save_override(&self, record: &QuotaOverride) -> StoreResult<()> {
        self.usage_up()?;
        self.overrides.insert(
            (
                record.workspace_id,
                record.operation,
                record.period_tag.clone(),
            ),
            record.clone(),
        );
        Ok(())
    }

    async fn find_override(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        period_tag: &str,
    ) -> StoreResult<Option<QuotaOverride>> {
        self.usage_up()?;
        Ok(self
            .overrides
            .get(&(*workspace_id, operation, period_tag.to_string()))
            .map(|o| o.clone()))
    }
}

struct MemoryTx {
    workspace_id: WorkspaceId,
    guard: OwnedMutexGuard<Book>,
    working: Book,
    hold_index: Arc<DashMap<HoldId, WorkspaceId>>,
}

impl MemoryTx {
    fn fifo(mut allocations: Vec<CreditAllocation>) -> Vec<CreditAllocation> {
        allocations.sort_by(|a, b| a.fifo_cmp(b));
        allocations
    }

    fn replace<T: Clone>(
        items: &mut [T],
        matches: impl Fn(&T) -> bool,
        value: &T,
        entity: &'static str,
        id: String,
    ) -> StoreResult<()> {
        let slot = items
            .iter_mut()
            .find(|item| matches(item))
            .ok_or(StoreError::NotFound { entity, id })?;
        *slot = value.clone();
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    async fn live_allocations(
        &mut self,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreditAllocation>> {
        Ok(Self::fifo(
            self.working
                .allocations
                .iter()
                .filter(|a| a.category == category && a.is_live(now))
                .cloned()
                .collect(),
        ))
    }

    async fn allocations_with_remaining(
        &mut self,
        category: CreditCategory,
        allocation_type: AllocationType,
    ) -> StoreResult<Vec<CreditAllocation>> {
        Ok(Self::fifo(
            self.working
                .allocations
                .iter()
                .filter(|a| {
                    a.category == category
                        && a.allocation_type == allocation_type
                        && a.amount_remaining > Decimal::ZERO
                })
                .cloned()
                .collect(),
        ))
    }

    async fn allocation(&mut self, id: &AllocationId) -> StoreResult<Option<CreditAllocation>> {
        Ok(self.working.allocations.iter().find(|a| a.id == *id).cloned())
    }

    async fn cycle_allocation(
        &mut self,
        category: CreditCategory,
        cycle_tag: &str,
    ) -> StoreResult<Option<CreditAllocation>> {
        Ok(self
            .working
            .allocations
            .iter()
            .find(|a| {
                a.category == category
                    && a.allocation_type == AllocationType::Included
                    && a.cycle_tag.as_deref() == Some(cycle_tag)
            })
            .cloned())
    }

    async fn insert_allocation(&mut self, allocation: &CreditAllocation) -> StoreResult<()> {
        self.working.allocations.push(allocation.clone());
        Ok(())
    }

    async fn update_allocation(&mut self, allocation: &CreditAllocation) -> StoreResult<()> {
        Self::replace(
            &mut self.working.allocations,
            |a| a.id == allocation.id,
            allocation,
            "allocation",
            allocation.id.to_string(),
        )
    }

    async fn reserved_total(
        &mut self,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        Ok(self.working.snapshot(category, now).reserved)
    }

    async fn source_transactions(
        &mut self,
        category: CreditCategory,
        source_id: &str,
    ) -> StoreResult<Vec<CreditTransaction>> {
        Ok(self
            .working
            .transactions
            .iter()
            .filter(|t| t.category == category && t.source_id.as_deref() == Some(source_id))
            .cloned()
            .collect())
    }

    async fn insert_transactions(&mut self, transactions: &[CreditTransaction]) -> StoreResult<()> {
        self.working.transactions.extend_from_slice(transactions);
        Ok(())
    }

    async fn hold(&mut self, id: &HoldId) -> StoreResult<Option<CreditHold>> {
        Ok(self.working.holds.iter().find(|h| h.id == *id).cloned())
    }

    async fn active_hold_for_source(
        &mut self,
        category: CreditCategory,
        source_id: &str,
    ) -> StoreResult<Option<CreditHold>> {
        Ok(self
            .working
            .holds
            .iter()
            .find(|h| {
                h.category == category
                    && h.status == HoldStatus::Active
                    && h.source_id == source_id
            })
            .cloned())
    }

    async fn expired_active_holds(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<CreditHold>> {
        let mut expired: Vec<CreditHold> = self
            .working
            .holds
            .iter()
            .filter(|h| h.status == HoldStatus::Active && h.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|h| h.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn insert_hold(&mut self, hold: &CreditHold) -> StoreResult<()> {
        self.working.holds.push(hold.clone());
        Ok(())
    }

    async fn update_hold(&mut self, hold: &CreditHold) -> StoreResult<()> {
        Self::replace(
            &mut self.working.holds,
            |h| h.id == hold.id,
            hold,
            "hold",
            hold.id.to_string(),
        )
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx {
            workspace_id,
            mut guard,
            working,
            hold_index,
        } = *self;

        let known: HashSet<HoldId> = guard.holds.iter().map(|h| h.id).collect();
        for hold in working.holds.iter().filter(|h| !known.contains(&h.id)) {
            hold_index.insert(hold.id, workspace_id);
        }
        *guard = working;
        Ok(())
    }
}
