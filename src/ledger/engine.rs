//! Ledger engine: the single code path for every balance mutation.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{Instrument, debug, error, info, warn};

use super::balance::Balance;
use super::requests::{
    DebitRequest, GrantReceipt, GrantRequest, HoldPolicy, LedgerReceipt, RefundRequest,
};
use super::{validate_amount, validate_source_id};
use crate::audit::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerSettings;
use crate::observability::{LedgerMetrics, LedgerSpan};
use crate::store::{LedgerStore, LedgerTx, MemoryStore, RetryPolicy, with_retry};
use crate::types::{
    AllocationId, AllocationType, CreditAllocation, CreditCategory, CreditHold, CreditTransaction,
    Metadata, Plan, TransactionId, TransactionType, Workspace, WorkspaceId,
};
use crate::{Error, Result};

/// Balance of one pool as seen inside a unit of work, with the live
/// allocations it was computed from in FIFO order.
pub(super) struct Position {
    pub(super) balance: Balance,
    pub(super) live: Vec<CreditAllocation>,
}

/// One category's share of a billing-cycle run.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleGrant {
    pub category: CreditCategory,
    pub amount: Decimal,
    pub cycle_tag: String,
    pub expires_at: DateTime<Utc>,
    /// Most INCLUDED credit that may carry over into the new cycle.
    pub max_rollover: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub category: CreditCategory,
    pub allocation_id: Option<AllocationId>,
    /// Credits granted by this run. Zero for duplicates.
    pub granted: Decimal,
    /// Credits forfeited by lapsed INCLUDED allocations.
    pub expired: Decimal,
    /// Credits forfeited to the rollover cap.
    pub trimmed: Decimal,
    /// The cycle had already been granted.
    pub duplicate: bool,
}

#[derive(Clone)]
pub struct LedgerEngine {
    pub(super) store: Arc<dyn LedgerStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) metrics: Arc<LedgerMetrics>,
    pub(super) retry: RetryPolicy,
    pub(super) holds: HoldPolicy,
}

impl std::fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("store", &self.store.name())
            .field("audit", &self.audit.name())
            .field("retry", &self.retry)
            .field("holds", &self.holds)
            .finish()
    }
}

#[derive(Default)]
pub struct LedgerEngineBuilder {
    store: Option<Arc<dyn LedgerStore>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Arc<LedgerMetrics>>,
    retry: Option<RetryPolicy>,
    holds: Option<HoldPolicy>,
}

impl LedgerEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn hold_policy(mut self, holds: HoldPolicy) -> Self {
        self.holds = Some(holds);
        self
    }

    /// Takes retry and hold TTL settings from loaded configuration.
    pub fn settings(mut self, settings: &LedgerSettings) -> Self {
        self.retry = Some(settings.retry_policy());
        self.holds = Some(settings.hold_policy());
        self
    }

    /// Missing parts default to an in-memory store, the system clock and
    /// the tracing audit sink.
    pub fn build(self) -> LedgerEngine {
        LedgerEngine {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            metrics: self.metrics.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            holds: self.holds.unwrap_or_default(),
        }
    }
}

/// Trailing run of `kind` transactions, looking only at debits and refunds.
/// Empty when the latest of the two kinds is `opposite`.
pub(super) fn trailing_run(
    history: &[CreditTransaction],
    kind: TransactionType,
    opposite: TransactionType,
) -> Vec<&CreditTransaction> {
    let mut run: Vec<&CreditTransaction> = history
        .iter()
        .rev()
        .filter(|t| t.transaction_type == kind || t.transaction_type == opposite)
        .take_while(|t| t.transaction_type == kind)
        .collect();
    run.reverse();
    run
}

fn ids_of(transactions: &[&CreditTransaction]) -> Vec<TransactionId> {
    transactions.iter().map(|t| t.id).collect()
}

impl LedgerEngine {
    pub fn builder() -> LedgerEngineBuilder {
        LedgerEngineBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    pub fn hold_policy(&self) -> HoldPolicy {
        self.holds
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // Workspaces

    pub async fn create_workspace(&self, name: impl Into<String>, plan: Plan) -> Result<Workspace> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid("workspace name must not be empty"));
        }
        let workspace = Workspace::new(name, plan, self.now());
        self.store.save_workspace(&workspace).await?;
        info!(workspace_id = %workspace.id, plan = %plan, "Workspace created");
        Ok(workspace)
    }

    pub async fn workspace(&self, workspace_id: &WorkspaceId) -> Result<Workspace> {
        self.store
            .load_workspace(workspace_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "workspace",
                id: workspace_id.to_string(),
            })
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        Ok(self.store.list_workspaces().await?)
    }

    /// Takes effect at the next billing cycle; existing allocations are untouched.
    pub async fn change_plan(&self, workspace_id: &WorkspaceId, plan: Plan) -> Result<Workspace> {
        let mut workspace = self.workspace(workspace_id).await?;
        let previous = workspace.plan;
        workspace.change_plan(plan, self.now());
        self.store.save_workspace(&workspace).await?;
        info!(workspace_id = %workspace_id, from = %previous, to = %plan, "Workspace plan changed");
        Ok(workspace)
    }

    // Reads

    /// Consistent snapshot of remaining, reserved and available credits.
    pub async fn get_balance(
        &self,
        workspace_id: &WorkspaceId,
        category: CreditCategory,
    ) -> Result<Balance> {
        self.workspace(workspace_id).await?;
        let snapshot = self
            .retrying(|| async {
                Ok(self
                    .store
                    .balance_snapshot(workspace_id, category, self.now())
                    .await?)
            })
            .await?;
        Ok(Balance::from_snapshot(category, snapshot))
    }

    /// Transactions in write order.
    pub async fn transactions(&self, workspace_id: &WorkspaceId) -> Result<Vec<CreditTransaction>> {
        self.workspace(workspace_id).await?;
        Ok(self.store.list_transactions(workspace_id).await?)
    }

    pub async fn allocations(&self, workspace_id: &WorkspaceId) -> Result<Vec<CreditAllocation>> {
        self.workspace(workspace_id).await?;
        Ok(self.store.list_allocations(workspace_id).await?)
    }

    pub async fn holds(&self, workspace_id: &WorkspaceId) -> Result<Vec<CreditHold>> {
        self.workspace(workspace_id).await?;
        Ok(self.store.list_holds(workspace_id).await?)
    }

    // Mutations

    /// Debits `amount` across live allocations, soonest-expiring first.
    ///
    /// Either the whole amount is debited or nothing is. A repeat for a
    /// `source_id` whose latest debit has not been refunded returns the
    /// original transaction ids with `duplicate` set.
    pub async fn debit(&self, request: DebitRequest) -> Result<LedgerReceipt> {
        let span = LedgerSpan::new("ledger.debit", &request.workspace_id)
            .category(request.category)
            .amount(request.amount)
            .source(&request.source_id);

        let work = async {
            let amount = validate_amount(request.amount)?;
            validate_source_id(&request.source_id)?;
            self.retrying(|| self.debit_once(&request, amount)).await
        };
        self.observe(span, work).await
    }

    async fn debit_once(&self, request: &DebitRequest, amount: Decimal) -> Result<LedgerReceipt> {
        let now = self.now();
        let category = request.category;
        let mut tx = self.store.begin(&request.workspace_id).await?;

        let history = tx.source_transactions(category, &request.source_id).await?;
        let prior = trailing_run(&history, TransactionType::Debit, TransactionType::Refund);
        if !prior.is_empty() {
            self.metrics.duplicate_source_ids.inc();
            debug!(source_id = %request.source_id, "Debit already applied, returning prior result");
            return Ok(LedgerReceipt::replayed(ids_of(&prior)));
        }

        let position = self.position(tx.as_mut(), category, now).await?;
        let before = position.balance.available;
        if !position.balance.covers(amount) {
            return Err(Error::insufficient(category, amount, before));
        }

        let rows = self
            .apply_debit(
                tx.as_mut(),
                category,
                amount,
                &request.source_id,
                &request.metadata,
                position.live,
                now,
            )
            .await?;
        let ids: Vec<TransactionId> = rows.iter().map(|t| t.id).collect();
        tx.insert_transactions(&rows).await?;
        tx.commit().await?;

        self.metrics.record_debit(amount);
        self.record_audit(
            AuditEvent::new(AuditAction::Debit, request.workspace_id, now)
                .category(category)
                .amount(amount)
                .source(&request.source_id)
                .transactions(ids.clone())
                .balances(before, before - amount)
                .metadata(request.metadata.clone()),
        )
        .await;
        Ok(LedgerReceipt::applied(ids))
    }

    /// Re-credits a prior debit. Idempotent by `source_id`.
    ///
    /// Credits go back to the allocations the debit drew from while they
    /// are still live. Whatever cannot be restored lands in a new
    /// non-expiring PROMOTIONAL allocation marked as a refund replacement.
    pub async fn refund(&self, request: RefundRequest) -> Result<LedgerReceipt> {
        let span = LedgerSpan::new("ledger.refund", &request.workspace_id)
            .category(request.category)
            .amount(request.amount)
            .source(&request.source_id);

        let work = async {
            let amount = validate_amount(request.amount)?;
            validate_source_id(&request.source_id)?;
            let mut metadata = request.metadata.clone();
            if let Some(reason) = &request.reason {
                metadata.insert("reason", reason.as_str())?;
            }
            self.retrying(|| self.refund_once(&request, amount, &metadata))
                .await
        };
        self.observe(span, work).await
    }

    async fn refund_once(
        &self,
        request: &RefundRequest,
        amount: Decimal,
        metadata: &Metadata,
    ) -> Result<LedgerReceipt> {
        let now = self.now();
        let category = request.category;
        let workspace_id = request.workspace_id;
        let source_id = request.source_id.as_str();
        let mut tx = self.store.begin(&workspace_id).await?;

        let history = tx.source_transactions(category, source_id).await?;
        let prior = trailing_run(&history, TransactionType::Refund, TransactionType::Debit);
        if !prior.is_empty() {
            self.metrics.duplicate_source_ids.inc();
            debug!(source_id = %source_id, "Refund already applied, returning prior result");
            return Ok(LedgerReceipt::replayed(ids_of(&prior)));
        }

        let debits = trailing_run(&history, TransactionType::Debit, TransactionType::Refund);
        if debits.is_empty() {
            return Err(Error::invalid(format!(
                "no unrefunded debit recorded for {}",
                source_id
            )));
        }
        let debited: Decimal = debits.iter().map(|t| -t.amount).sum();
        if amount > debited {
            return Err(Error::invalid(format!(
                "refund of {} exceeds the {} debited for {}",
                amount, debited, source_id
            )));
        }

        let before = self.position(tx.as_mut(), category, now).await?.balance.available;
        let mut left = amount;
        let mut rows = Vec::new();
        let mut expunged: Option<AllocationId> = None;

        for debit in &debits {
            if left.is_zero() {
                break;
            }
            let Some(allocation_id) = debit.allocation_id else {
                continue;
            };
            match tx.allocation(&allocation_id).await? {
                Some(mut allocation) if !allocation.is_expired(now) => {
                    self.check_allocation(&allocation)?;
                    let give = (-debit.amount).min(left).min(allocation.headroom());
                    if give <= Decimal::ZERO {
                        continue;
                    }
                    allocation.amount_remaining += give;
                    self.check_allocation(&allocation)?;
                    tx.update_allocation(&allocation).await?;
                    rows.push(
                        CreditTransaction::new(
                            workspace_id,
                            TransactionType::Refund,
                            category,
                            give,
                            now,
                        )
                        .on_allocation(allocation.id)
                        .with_source(Some(source_id))
                        .with_metadata(metadata.clone()),
                    );
                    left -= give;
                }
                _ => {
                    expunged.get_or_insert(allocation_id);
                }
            }
        }

        if left > Decimal::ZERO {
            let mut replacement = CreditAllocation::new(
                workspace_id,
                category,
                AllocationType::Promotional,
                left,
                now,
                None,
            )
            .with_source(source_id);
            replacement.replaces = expunged;
            tx.insert_allocation(&replacement).await?;

            let mut tagged = metadata.clone();
            tagged.insert("refund_replacement", true)?;
            rows.push(
                CreditTransaction::new(workspace_id, TransactionType::Refund, category, left, now)
                    .on_allocation(replacement.id)
                    .with_source(Some(source_id))
                    .with_metadata(tagged),
            );
            info!(
                workspace_id = %workspace_id,
                source_id = %source_id,
                amount = %left,
                replaces = ?expunged,
                "Refund credited to replacement allocation"
            );
        }

        let ids: Vec<TransactionId> = rows.iter().map(|t| t.id).collect();
        tx.insert_transactions(&rows).await?;
        tx.commit().await?;

        self.metrics.record_refund(amount);
        self.record_audit(
            AuditEvent::new(AuditAction::Refund, workspace_id, now)
                .category(category)
                .amount(amount)
                .source(source_id)
                .transactions(ids.clone())
                .balances(before, before + amount)
                .metadata(metadata.clone()),
        )
        .await;
        Ok(LedgerReceipt::applied(ids))
    }

    /// Adds a new allocation. Idempotent by `source_id` when one is given.
    pub async fn grant_credits(&self, request: GrantRequest) -> Result<GrantReceipt> {
        let mut span = LedgerSpan::new("ledger.grant", &request.workspace_id)
            .category(request.category)
            .amount(request.amount);
        if let Some(source_id) = &request.source_id {
            span = span.source(source_id);
        }

        let work = async {
            let amount = validate_amount(request.amount)?;
            if let Some(source_id) = &request.source_id {
                validate_source_id(source_id)?;
            }
            if request
                .expires_at
                .is_some_and(|expires_at| expires_at <= self.now())
            {
                return Err(Error::invalid("expires_at must be in the future"));
            }
            self.retrying(|| self.grant_once(&request, amount)).await
        };
        self.observe(span, work).await
    }

    async fn grant_once(&self, request: &GrantRequest, amount: Decimal) -> Result<GrantReceipt> {
        let now = self.now();
        let category = request.category;
        let mut tx = self.store.begin(&request.workspace_id).await?;

        if let Some(source_id) = &request.source_id {
            let history = tx.source_transactions(category, source_id).await?;
            let prior = history
                .iter()
                .filter(|t| t.transaction_type == TransactionType::Allocation)
                .find_map(|t| t.allocation_id.map(|a| (a, t.id)));
            if let Some((allocation_id, transaction_id)) = prior {
                self.metrics.duplicate_source_ids.inc();
                debug!(source_id = %source_id, "Grant already applied, returning prior allocation");
                return Ok(GrantReceipt {
                    allocation_id,
                    transaction_id: Some(transaction_id),
                    duplicate: true,
                });
            }
        }

        let before = self.position(tx.as_mut(), category, now).await?.balance.available;
        let mut allocation = CreditAllocation::new(
            request.workspace_id,
            category,
            request.allocation_type,
            amount,
            now,
            request.expires_at,
        );
        allocation.source_id = request.source_id.clone();
        tx.insert_allocation(&allocation).await?;

        let mut metadata = Metadata::new();
        metadata.insert("allocation_type", request.allocation_type.as_str())?;
        let row = CreditTransaction::new(
            request.workspace_id,
            TransactionType::Allocation,
            category,
            amount,
            now,
        )
        .on_allocation(allocation.id)
        .with_source(request.source_id.as_deref())
        .with_metadata(metadata);
        tx.insert_transactions(std::slice::from_ref(&row)).await?;
        tx.commit().await?;

        self.metrics.record_grant(amount);
        let mut event = AuditEvent::new(AuditAction::Grant, request.workspace_id, now)
            .category(category)
            .amount(amount)
            .transactions(vec![row.id])
            .balances(before, before + amount);
        if let Some(source_id) = &request.source_id {
            event = event.source(source_id);
        }
        self.record_audit(event).await;

        Ok(GrantReceipt {
            allocation_id: allocation.id,
            transaction_id: Some(row.id),
            duplicate: false,
        })
    }

    /// Applies one billing cycle to one category in a single unit of work:
    /// forfeits lapsed INCLUDED credit, trims carried-over INCLUDED credit
    /// down to `max_rollover`, and grants the cycle's bundle. Re-running a
    /// cycle that already has its allocation grants nothing.
    pub async fn apply_cycle(
        &self,
        workspace_id: &WorkspaceId,
        grant: &CycleGrant,
    ) -> Result<CycleOutcome> {
        let span = LedgerSpan::new("ledger.cycle", workspace_id)
            .category(grant.category)
            .amount(grant.amount)
            .source(&grant.cycle_tag);

        let work = async {
            if grant.amount < Decimal::ZERO || grant.max_rollover < Decimal::ZERO {
                return Err(Error::invalid("cycle amounts must not be negative"));
            }
            self.retrying(|| self.apply_cycle_once(workspace_id, grant))
                .await
        };
        self.observe(span, work).await
    }

    async fn apply_cycle_once(
        &self,
        workspace_id: &WorkspaceId,
        grant: &CycleGrant,
    ) -> Result<CycleOutcome> {
        let now = self.now();
        let category = grant.category;
        let mut tx = self.store.begin(workspace_id).await?;
        let before = self.position(tx.as_mut(), category, now).await?.balance.available;

        let mut rows = Vec::new();
        let mut outcome = CycleOutcome {
            category,
            allocation_id: None,
            granted: Decimal::ZERO,
            expired: Decimal::ZERO,
            trimmed: Decimal::ZERO,
            duplicate: false,
        };

        let included = tx
            .allocations_with_remaining(category, AllocationType::Included)
            .await?;
        let (lapsed, carried): (Vec<_>, Vec<_>) =
            included.into_iter().partition(|a| a.is_expired(now));

        for mut allocation in lapsed {
            self.check_allocation(&allocation)?;
            let forfeited = allocation.amount_remaining;
            allocation.amount_remaining = Decimal::ZERO;
            tx.update_allocation(&allocation).await?;
            rows.push(self.expiration_row(workspace_id, &allocation, forfeited, "expired", now)?);
            outcome.expired += forfeited;
        }

        let existing = tx.cycle_allocation(category, &grant.cycle_tag).await?;
        if let Some(existing) = existing {
            outcome.duplicate = true;
            outcome.allocation_id = Some(existing.id);
        } else if grant.amount > Decimal::ZERO {
            let carried_total: Decimal = carried.iter().map(|a| a.amount_remaining).sum();
            let mut excess = carried_total - grant.max_rollover;
            for mut allocation in carried {
                if excess <= Decimal::ZERO {
                    break;
                }
                self.check_allocation(&allocation)?;
                let cut = allocation.amount_remaining.min(excess);
                allocation.amount_remaining -= cut;
                self.check_allocation(&allocation)?;
                tx.update_allocation(&allocation).await?;
                rows.push(self.expiration_row(workspace_id, &allocation, cut, "rollover_cap", now)?);
                outcome.trimmed += cut;
                excess -= cut;
            }

            let allocation = CreditAllocation::new(
                *workspace_id,
                category,
                AllocationType::Included,
                grant.amount,
                now,
                Some(grant.expires_at),
            )
            .with_cycle(&grant.cycle_tag);
            tx.insert_allocation(&allocation).await?;

            let mut metadata = Metadata::new();
            metadata.insert("cycle", grant.cycle_tag.as_str())?;
            rows.push(
                CreditTransaction::new(
                    *workspace_id,
                    TransactionType::Allocation,
                    category,
                    grant.amount,
                    now,
                )
                .on_allocation(allocation.id)
                .with_metadata(metadata),
            );
            outcome.allocation_id = Some(allocation.id);
            outcome.granted = grant.amount;
        }

        if rows.is_empty() {
            return Ok(outcome);
        }
        tx.insert_transactions(&rows).await?;
        tx.commit().await?;

        let granted = outcome.granted;
        let after = before - outcome.trimmed + granted;

        if !outcome.expired.is_zero() {
            self.metrics.allocations_expired.inc();
            info!(
                workspace_id = %workspace_id,
                category = %category,
                amount = %outcome.expired,
                "Lapsed included credits expired"
            );
            self.record_audit(
                AuditEvent::new(AuditAction::Expiration, *workspace_id, now)
                    .category(category)
                    .amount(outcome.expired)
                    .actor("monthly-allocator"),
            )
            .await;
        }
        if !outcome.trimmed.is_zero() {
            info!(
                workspace_id = %workspace_id,
                category = %category,
                amount = %outcome.trimmed,
                cap = %grant.max_rollover,
                "Rollover above cap forfeited"
            );
            self.record_audit(
                AuditEvent::new(AuditAction::RolloverTrim, *workspace_id, now)
                    .category(category)
                    .amount(outcome.trimmed)
                    .actor("monthly-allocator"),
            )
            .await;
        }
        if !granted.is_zero() {
            self.metrics.record_grant(granted);
            self.record_audit(
                AuditEvent::new(AuditAction::Grant, *workspace_id, now)
                    .category(category)
                    .amount(granted)
                    .source(&grant.cycle_tag)
                    .transactions(rows.iter().map(|t| t.id).collect())
                    .balances(before, after)
                    .actor("monthly-allocator"),
            )
            .await;
        }
        Ok(outcome)
    }

    /// Deletes exhausted allocations that expired more than `retention` ago.
    /// Their transactions are kept.
    pub async fn purge_retired_allocations(&self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = self.now() - retention;
        let purged = self
            .retrying(|| async { Ok(self.store.purge_retired_allocations(cutoff).await?) })
            .await?;
        self.metrics.allocations_purged.add(purged as u64);
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged retired allocations");
        }
        Ok(purged)
    }

    // Shared internals

    pub(super) async fn position(
        &self,
        tx: &mut dyn LedgerTx,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> Result<Position> {
        let live = tx.live_allocations(category, now).await?;
        for allocation in &live {
            self.check_allocation(allocation)?;
        }
        let remaining: Decimal = live.iter().map(|a| a.amount_remaining).sum();
        let reserved = tx.reserved_total(category, now).await?;
        Ok(Position {
            balance: Balance::new(category, remaining, reserved),
            live,
        })
    }

    /// Walks `live` in order, writing one DEBIT row per allocation touched.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn apply_debit(
        &self,
        tx: &mut dyn LedgerTx,
        category: CreditCategory,
        amount: Decimal,
        source_id: &str,
        metadata: &Metadata,
        live: Vec<CreditAllocation>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        let workspace_id = tx.workspace_id();
        let mut left = amount;
        let mut rows = Vec::new();

        for mut allocation in live {
            if left.is_zero() {
                break;
            }
            let take = allocation.amount_remaining.min(left);
            if take <= Decimal::ZERO {
                continue;
            }
            allocation.amount_remaining -= take;
            self.check_allocation(&allocation)?;
            tx.update_allocation(&allocation).await?;
            rows.push(
                CreditTransaction::new(workspace_id, TransactionType::Debit, category, -take, now)
                    .on_allocation(allocation.id)
                    .with_source(Some(source_id))
                    .with_metadata(metadata.clone()),
            );
            left -= take;
        }

        if !left.is_zero() {
            return Err(Error::insufficient(category, amount, amount - left));
        }
        Ok(rows)
    }

    fn expiration_row(
        &self,
        workspace_id: &WorkspaceId,
        allocation: &CreditAllocation,
        forfeited: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditTransaction> {
        let mut metadata = Metadata::new();
        metadata.insert("reason", reason)?;
        if let Some(cycle) = &allocation.cycle_tag {
            metadata.insert("cycle", cycle.as_str())?;
        }
        Ok(CreditTransaction::new(
            *workspace_id,
            TransactionType::Expiration,
            allocation.category,
            -forfeited,
            now,
        )
        .on_allocation(allocation.id)
        .with_metadata(metadata))
    }

    /// Halts the unit of work on an invariant violation. Never clamps.
    pub(super) fn check_allocation(&self, allocation: &CreditAllocation) -> Result<()> {
        allocation.check_invariant().map_err(|message| {
            self.metrics.invariant_violations.inc();
            error!(
                workspace_id = %allocation.workspace_id,
                allocation_id = %allocation.id,
                granted = %allocation.amount_granted,
                remaining = %allocation.amount_remaining,
                %message,
                "Allocation invariant violated, aborting transaction"
            );
            Error::AllocationInconsistent {
                allocation_id: allocation.id,
                message,
            }
        })
    }

    pub(crate) async fn record_audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event).await {
            self.metrics.audit_failures.inc();
            warn!(
                sink = self.audit.name(),
                action = ?event.action,
                workspace_id = %event.workspace_id,
                error = %e,
                "Audit sink rejected ledger event"
            );
        }
    }

    pub(super) async fn retrying<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let metrics = &self.metrics;
        with_retry(
            self.retry,
            |e: &Error| {
                let retry = e.is_retryable();
                if retry {
                    metrics.retries.inc();
                }
                retry
            },
            operation,
        )
        .await
    }

    pub(super) async fn observe<T>(
        &self,
        span: LedgerSpan,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.metrics.record_operation_start();
        let result = work.instrument(span.span().clone()).await;
        let latency_ms = span.finish(&result);
        self.metrics.record_operation_end(latency_ms);
        if let Err(Error::InsufficientBalance { .. }) = &result {
            self.metrics.insufficient_balance.inc();
        }
        result
    }
}
