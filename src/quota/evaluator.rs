//! Usage quota checks and the pre-operation authorization gate.
//!
//! Failure handling is asymmetric. When usage counters cannot
//! be read the quota check blocks; when the balance cannot be read the
//! authorization gate allows and flags the decision for reconciliation.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::limits::{PlanCatalog, QuotaThresholds};
use crate::allocator::BillingCycle;
use crate::audit::{AuditAction, AuditEvent};
use crate::ledger::{Balance, LedgerEngine};
use crate::types::{CreditCategory, Metadata, OperationType, OverrideId, QuotaOverride, WorkspaceId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaState {
    Allowed,
    SoftWarning,
    HardBlocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub status: QuotaState,
    pub current: u64,
    /// `None` when the plan places no limit on the operation.
    pub limit: Option<u64>,
    pub percentage: f64,
    /// Billing period the usage was counted over, `YYYY-MM`.
    pub period: String,
    /// Admin whose override lifted a hard block.
    pub override_by: Option<String>,
    /// Usage could not be read; the status is the fail-closed default.
    pub degraded: bool,
}

impl QuotaStatus {
    pub fn is_soft_warning(&self) -> bool {
        self.status == QuotaState::SoftWarning
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    QuotaHardBlocked,
    InsufficientBalance { shortfall: Decimal },
}

/// Combined quota and balance verdict for one prospective operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub quota: QuotaStatus,
    /// `None` when the balance was not read or could not be read.
    pub balance: Option<Balance>,
    pub denial: Option<DenialReason>,
    /// Allowed without a balance check; settle against the ledger later.
    pub needs_reconciliation: bool,
}

#[derive(Debug, Clone)]
pub struct QuotaEvaluator {
    ledger: LedgerEngine,
    catalog: Arc<PlanCatalog>,
    thresholds: QuotaThresholds,
}

fn percentage(current: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    current as f64 / limit as f64 * 100.0
}

impl QuotaEvaluator {
    pub fn new(ledger: LedgerEngine, catalog: Arc<PlanCatalog>) -> Self {
        Self {
            ledger,
            catalog,
            thresholds: QuotaThresholds::default(),
        }
    }

    pub fn thresholds(mut self, thresholds: QuotaThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Classifies this period's usage of `operation` against the plan limit.
    pub async fn check_quota(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
    ) -> Result<QuotaStatus> {
        let metrics = self.ledger.metrics();
        let period = BillingCycle::containing(self.ledger.now());

        let workspace = match self.ledger.workspace(workspace_id).await {
            Ok(workspace) => workspace,
            Err(e) if e.is_storage_failure() => {
                return Ok(self.fail_closed(workspace_id, operation, &period, None, &e));
            }
            Err(e) => return Err(e),
        };
        let limit = self.catalog.limits(workspace.plan).quota_for(operation);

        let usage = self
            .ledger
            .store()
            .usage_between(workspace_id, operation, period.first_day(), period.last_day())
            .await;

        let Some(limit) = limit else {
            let (current, degraded) = match usage {
                Ok(current) => (current, false),
                Err(e) => {
                    debug!(error = %e, "Usage unreadable for unlimited operation");
                    (0, true)
                }
            };
            return Ok(QuotaStatus {
                allowed: true,
                status: QuotaState::Allowed,
                current,
                limit: None,
                percentage: 0.0,
                period: period.tag,
                override_by: None,
                degraded,
            });
        };

        let current = match usage {
            Ok(current) => current,
            Err(e) => {
                let e = Error::from(e);
                return Ok(self.fail_closed(workspace_id, operation, &period, Some(limit), &e));
            }
        };

        let status = if limit == 0 || QuotaThresholds::reached(current, limit, self.thresholds.hard_pct)
        {
            QuotaState::HardBlocked
        } else if QuotaThresholds::reached(current, limit, self.thresholds.soft_pct) {
            QuotaState::SoftWarning
        } else {
            QuotaState::Allowed
        };

        let mut quota = QuotaStatus {
            allowed: status != QuotaState::HardBlocked,
            status,
            current,
            limit: Some(limit),
            percentage: percentage(current, limit),
            period: period.tag.clone(),
            override_by: None,
            degraded: false,
        };

        match status {
            QuotaState::SoftWarning => {
                metrics.quota_soft_warnings.inc();
                debug!(
                    workspace_id = %workspace_id,
                    operation = %operation,
                    current,
                    limit,
                    "Quota soft warning"
                );
            }
            QuotaState::HardBlocked => self.apply_override(workspace_id, operation, &mut quota).await,
            QuotaState::Allowed => {}
        }
        Ok(quota)
    }

    /// Like [`check_quota`](Self::check_quota), but a hard block is an error.
    pub async fn enforce_quota(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
    ) -> Result<QuotaStatus> {
        let quota = self.check_quota(workspace_id, operation).await?;
        if !quota.allowed {
            return Err(Error::QuotaHardBlocked {
                operation,
                current: quota.current,
                limit: quota.limit.unwrap_or(0),
            });
        }
        Ok(quota)
    }

    /// Counts one initiated operation against today's usage. Operations that
    /// later fail still count.
    pub async fn record_usage(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
    ) -> Result<u64> {
        self.ledger.workspace(workspace_id).await?;
        let today = self.ledger.now().date_naive();
        let count = self
            .ledger
            .store()
            .increment_usage(workspace_id, operation, today)
            .await?;
        debug!(workspace_id = %workspace_id, operation = %operation, count, "Usage recorded");
        Ok(count)
    }

    /// Lifts the hard block on `operation` for the current period. Repeating
    /// the override for the same period returns the existing record.
    pub async fn admin_override_quota(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        admin_id: &str,
        reason: &str,
    ) -> Result<QuotaOverride> {
        if admin_id.trim().is_empty() {
            return Err(Error::invalid("admin_id must not be empty"));
        }
        if reason.trim().is_empty() {
            return Err(Error::invalid("override reason must not be empty"));
        }
        self.ledger.workspace(workspace_id).await?;

        let now = self.ledger.now();
        let period = BillingCycle::containing(now);
        let store = self.ledger.store();
        if let Some(existing) = store
            .find_override(workspace_id, operation, &period.tag)
            .await?
        {
            debug!(override_id = %existing.id, "Quota override already recorded for period");
            return Ok(existing);
        }

        let record = QuotaOverride {
            id: OverrideId::new(),
            workspace_id: *workspace_id,
            operation,
            admin_id: admin_id.to_string(),
            reason: reason.to_string(),
            period_tag: period.tag.clone(),
            created_at: now,
        };
        store.save_override(&record).await?;

        self.ledger.metrics().quota_overrides.inc();
        info!(
            workspace_id = %workspace_id,
            operation = %operation,
            admin_id = %admin_id,
            period = %period,
            reason = %reason,
            "Quota override granted"
        );

        let mut metadata = Metadata::new();
        metadata.insert("operation", operation.as_str())?;
        metadata.insert("period", period.tag.as_str())?;
        metadata.insert("reason", reason)?;
        self.ledger
            .record_audit(
                AuditEvent::new(AuditAction::QuotaOverride, *workspace_id, now)
                    .actor(admin_id)
                    .metadata(metadata),
            )
            .await;
        Ok(record)
    }

    /// Quota check plus balance check for an operation costing `cost`.
    ///
    /// The quota side fails closed. The balance side fails open: if storage
    /// cannot produce a balance the operation is allowed with
    /// `needs_reconciliation` set.
    pub async fn authorize(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        category: CreditCategory,
        cost: Decimal,
    ) -> Result<AccessDecision> {
        let quota = self.check_quota(workspace_id, operation).await?;
        if !quota.allowed {
            return Ok(AccessDecision {
                allowed: false,
                quota,
                balance: None,
                denial: Some(DenialReason::QuotaHardBlocked),
                needs_reconciliation: false,
            });
        }

        match self.ledger.get_balance(workspace_id, category).await {
            Ok(balance) if balance.covers(cost) => Ok(AccessDecision {
                allowed: true,
                quota,
                balance: Some(balance),
                denial: None,
                needs_reconciliation: false,
            }),
            Ok(balance) => Ok(AccessDecision {
                allowed: false,
                quota,
                balance: Some(balance),
                denial: Some(DenialReason::InsufficientBalance {
                    shortfall: cost - balance.available.max(Decimal::ZERO),
                }),
                needs_reconciliation: false,
            }),
            Err(e) if e.is_storage_failure() => {
                self.ledger.metrics().balance_fail_open.inc();
                warn!(
                    workspace_id = %workspace_id,
                    category = %category,
                    cost = %cost,
                    error = %e,
                    "Balance lookup failed, allowing operation pending reconciliation"
                );
                Ok(AccessDecision {
                    allowed: true,
                    quota,
                    balance: None,
                    denial: None,
                    needs_reconciliation: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_override(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        quota: &mut QuotaStatus,
    ) {
        let found = self
            .ledger
            .store()
            .find_override(workspace_id, operation, &quota.period)
            .await;
        match found {
            Ok(Some(record)) => {
                debug!(override_id = %record.id, admin_id = %record.admin_id, "Hard block lifted by override");
                quota.allowed = true;
                quota.override_by = Some(record.admin_id);
            }
            Ok(None) => {
                self.ledger.metrics().quota_hard_blocks.inc();
                info!(
                    workspace_id = %workspace_id,
                    operation = %operation,
                    current = quota.current,
                    limit = ?quota.limit,
                    "Quota hard block"
                );
            }
            Err(e) => {
                self.ledger.metrics().quota_hard_blocks.inc();
                warn!(
                    workspace_id = %workspace_id,
                    operation = %operation,
                    error = %e,
                    "Override lookup failed, keeping hard block"
                );
            }
        }
    }

    fn fail_closed(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        period: &BillingCycle,
        limit: Option<u64>,
        error: &Error,
    ) -> QuotaStatus {
        let metrics = self.ledger.metrics();
        metrics.quota_fail_closed.inc();
        metrics.quota_hard_blocks.inc();
        warn!(
            workspace_id = %workspace_id,
            operation = %operation,
            error = %error,
            "Usage unreadable, blocking operation"
        );
        QuotaStatus {
            allowed: false,
            status: QuotaState::HardBlocked,
            current: 0,
            limit,
            percentage: 100.0,
            period: period.tag.clone(),
            override_by: None,
            degraded: true,
        }
    }
}
