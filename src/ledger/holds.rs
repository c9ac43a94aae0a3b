//! Hold lifecycle: reserve, consume, release, extend and the expiry sweep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::engine::{LedgerEngine, trailing_run};
use super::requests::{HoldReceipt, LedgerReceipt, ReserveRequest};
use super::{validate_amount, validate_source_id};
use crate::audit::{AuditAction, AuditEvent};
use crate::observability::LedgerSpan;
use crate::types::{CreditHold, HoldId, HoldStatus, Metadata, TransactionType, WorkspaceId};
use crate::{Error, Result};

/// Outcome of one pass of the expired-hold sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    /// Workspaces skipped because live traffic held their ledger lock.
    pub skipped_locked: usize,
    pub failed: usize,
    pub hold_ids: Vec<HoldId>,
}

fn chrono_ttl(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|_| Error::invalid("ttl out of range"))
}

fn not_active(hold: &CreditHold, now: DateTime<Utc>) -> Error {
    warn!(
        hold_id = %hold.id,
        workspace_id = %hold.workspace_id,
        status = %hold.status,
        expired = hold.is_expired(now),
        "Hold is no longer active"
    );
    Error::HoldNotActive {
        hold_id: hold.id,
        status: hold.status,
        expired: hold.is_expired(now),
    }
}

impl LedgerEngine {
    /// Reserves credits for an in-flight operation without touching allocations.
    ///
    /// A second reserve for the same source while its hold is still active
    /// returns that hold with `duplicate` set.
    pub async fn reserve(&self, request: ReserveRequest) -> Result<HoldReceipt> {
        let span = LedgerSpan::new("ledger.reserve", &request.workspace_id)
            .category(request.category)
            .amount(request.amount)
            .source(&request.source_id);

        let work = async {
            let amount = validate_amount(request.amount)?;
            validate_source_id(&request.source_id)?;
            let ttl = request.ttl.unwrap_or(self.holds.default_ttl);
            if ttl.is_zero() {
                return Err(Error::invalid("hold ttl must be positive"));
            }
            if ttl > self.holds.max_ttl {
                return Err(Error::invalid(format!(
                    "hold ttl {}s exceeds the maximum of {}s",
                    ttl.as_secs(),
                    self.holds.max_ttl.as_secs()
                )));
            }
            let ttl = chrono_ttl(ttl)?;
            self.retrying(|| self.reserve_once(&request, amount, ttl))
                .await
        };
        self.observe(span, work).await
    }

    async fn reserve_once(
        &self,
        request: &ReserveRequest,
        amount: Decimal,
        ttl: chrono::Duration,
    ) -> Result<HoldReceipt> {
        let now = self.now();
        let category = request.category;
        let mut tx = self.store.begin(&request.workspace_id).await?;

        if let Some(mut existing) = tx
            .active_hold_for_source(category, &request.source_id)
            .await?
        {
            if existing.is_reserving(now) {
                self.metrics.duplicate_source_ids.inc();
                debug!(hold_id = %existing.id, "Hold already active for source");
                return Ok(HoldReceipt {
                    hold: existing,
                    duplicate: true,
                });
            }
            existing.settle(HoldStatus::Released, now);
            tx.update_hold(&existing).await?;
            self.metrics.holds_force_released.inc();
            info!(hold_id = %existing.id, "Released lapsed hold before re-reserving source");
        }

        let position = self.position(tx.as_mut(), category, now).await?;
        let before = position.balance.available;
        if !position.balance.covers(amount) {
            return Err(Error::insufficient(category, amount, before));
        }

        let hold = CreditHold::new(
            request.workspace_id,
            category,
            amount,
            &request.source_id,
            now,
            now + ttl,
        );
        tx.insert_hold(&hold).await?;
        tx.commit().await?;

        self.metrics.holds_created.inc();
        self.record_audit(
            AuditEvent::new(AuditAction::Reserve, request.workspace_id, now)
                .category(category)
                .amount(amount)
                .source(&request.source_id)
                .hold(hold.id)
                .balances(before, before - amount),
        )
        .await;
        Ok(HoldReceipt {
            hold,
            duplicate: false,
        })
    }

    /// Marks an active hold CONSUMED and debits its amount in the same unit of work.
    pub async fn consume_hold(&self, hold_id: &HoldId) -> Result<LedgerReceipt> {
        let workspace_id = self.hold_workspace(hold_id).await?;
        let span = LedgerSpan::new("ledger.consume_hold", &workspace_id);
        let work = async {
            self.retrying(|| self.consume_once(&workspace_id, hold_id))
                .await
        };
        self.observe(span, work).await
    }

    async fn consume_once(&self, workspace_id: &WorkspaceId, hold_id: &HoldId) -> Result<LedgerReceipt> {
        let now = self.now();
        let mut tx = self.store.begin(workspace_id).await?;
        let mut hold = self.locked_hold(tx.as_mut(), hold_id).await?;
        if !hold.is_reserving(now) {
            return Err(not_active(&hold, now));
        }
        let category = hold.category;
        let amount = hold.amount_reserved;

        hold.settle(HoldStatus::Consumed, now);
        tx.update_hold(&hold).await?;

        let history = tx.source_transactions(category, &hold.source_id).await?;
        let prior = trailing_run(&history, TransactionType::Debit, TransactionType::Refund);
        if !prior.is_empty() {
            let ids = prior.iter().map(|t| t.id).collect();
            tx.commit().await?;
            self.metrics.duplicate_source_ids.inc();
            self.metrics.holds_consumed.inc();
            debug!(hold_id = %hold_id, "Source already debited, hold settled without a new debit");
            return Ok(LedgerReceipt::replayed(ids));
        }

        // The hold no longer reserves, so its amount is back in `available`.
        let position = self.position(tx.as_mut(), category, now).await?;
        if !position.balance.covers(amount) {
            return Err(Error::insufficient(category, amount, position.balance.available));
        }
        let held_balance = position.balance.available - amount;

        let mut metadata = Metadata::new();
        metadata.insert("hold_id", hold.id.to_string())?;
        let rows = self
            .apply_debit(
                tx.as_mut(),
                category,
                amount,
                &hold.source_id,
                &metadata,
                position.live,
                now,
            )
            .await?;
        let ids: Vec<_> = rows.iter().map(|t| t.id).collect();
        tx.insert_transactions(&rows).await?;
        tx.commit().await?;

        self.metrics.holds_consumed.inc();
        self.metrics.record_debit(amount);
        self.record_audit(
            AuditEvent::new(AuditAction::ConsumeHold, *workspace_id, now)
                .category(category)
                .amount(amount)
                .source(&hold.source_id)
                .hold(hold.id)
                .transactions(ids.clone())
                .balances(held_balance, held_balance),
        )
        .await;
        Ok(LedgerReceipt::applied(ids))
    }

    /// Returns held credits to the available balance. Releasing a released hold is a no-op.
    pub async fn release_hold(&self, hold_id: &HoldId) -> Result<()> {
        let workspace_id = self.hold_workspace(hold_id).await?;
        let span = LedgerSpan::new("ledger.release_hold", &workspace_id);
        let work = async {
            self.retrying(|| self.release_once(&workspace_id, hold_id))
                .await
        };
        self.observe(span, work).await
    }

    async fn release_once(&self, workspace_id: &WorkspaceId, hold_id: &HoldId) -> Result<()> {
        let now = self.now();
        let mut tx = self.store.begin(workspace_id).await?;
        let mut hold = self.locked_hold(tx.as_mut(), hold_id).await?;

        match hold.status {
            HoldStatus::Released => {
                debug!(hold_id = %hold_id, "Hold already released");
                return Ok(());
            }
            HoldStatus::Consumed => return Err(not_active(&hold, now)),
            HoldStatus::Active => {}
        }

        let was_reserving = hold.is_reserving(now);
        hold.settle(HoldStatus::Released, now);
        tx.update_hold(&hold).await?;
        tx.commit().await?;

        self.metrics.holds_released.inc();
        let mut event = AuditEvent::new(AuditAction::ReleaseHold, *workspace_id, now)
            .category(hold.category)
            .amount(hold.amount_reserved)
            .source(&hold.source_id)
            .hold(hold.id);
        if !was_reserving {
            event = event.actor("expired");
        }
        self.record_audit(event).await;
        Ok(())
    }

    /// Pushes an active hold's expiry forward, never past its creation plus the maximum TTL.
    pub async fn extend_hold(&self, hold_id: &HoldId, additional: Duration) -> Result<CreditHold> {
        if additional.is_zero() {
            return Err(Error::invalid("extension must be positive"));
        }
        let additional = chrono_ttl(additional)?;
        let max_ttl = chrono_ttl(self.holds.max_ttl)?;
        let workspace_id = self.hold_workspace(hold_id).await?;
        let span = LedgerSpan::new("ledger.extend_hold", &workspace_id);
        let work = async {
            self.retrying(|| self.extend_once(&workspace_id, hold_id, additional, max_ttl))
                .await
        };
        self.observe(span, work).await
    }

    async fn extend_once(
        &self,
        workspace_id: &WorkspaceId,
        hold_id: &HoldId,
        additional: chrono::Duration,
        max_ttl: chrono::Duration,
    ) -> Result<CreditHold> {
        let now = self.now();
        let mut tx = self.store.begin(workspace_id).await?;
        let mut hold = self.locked_hold(tx.as_mut(), hold_id).await?;
        if !hold.is_reserving(now) {
            return Err(not_active(&hold, now));
        }

        let ceiling = hold.created_at + max_ttl;
        let extended = (hold.expires_at + additional).min(ceiling);
        if extended <= hold.expires_at {
            return Err(Error::invalid(format!(
                "hold {} is already at its maximum lifetime",
                hold_id
            )));
        }
        let previous = hold.expires_at;
        hold.expires_at = extended;
        tx.update_hold(&hold).await?;
        tx.commit().await?;

        let mut metadata = Metadata::new();
        metadata.insert("previous_expires_at", previous.to_rfc3339())?;
        metadata.insert("expires_at", extended.to_rfc3339())?;
        self.record_audit(
            AuditEvent::new(AuditAction::ExtendHold, *workspace_id, now)
                .category(hold.category)
                .amount(hold.amount_reserved)
                .source(&hold.source_id)
                .hold(hold.id)
                .metadata(metadata),
        )
        .await;
        Ok(hold)
    }

    /// Force-releases ACTIVE holds past their expiry, up to `batch_size` per
    /// workspace. Workspaces locked by live traffic are skipped, not waited on.
    pub async fn release_expired_holds(&self, batch_size: usize) -> Result<SweepReport> {
        let now = self.now();
        let mut report = SweepReport::default();
        let workspaces = self.store.workspaces_with_expired_holds(now).await?;

        for workspace_id in workspaces {
            match self.sweep_workspace(&workspace_id, now, batch_size).await {
                Ok(Some(released)) => {
                    report.released += released.len();
                    report.hold_ids.extend(released);
                }
                Ok(None) => {
                    debug!(workspace_id = %workspace_id, "Ledger busy, skipping hold sweep");
                    report.skipped_locked += 1;
                }
                Err(e) => {
                    warn!(workspace_id = %workspace_id, error = %e, "Hold sweep failed for workspace");
                    report.failed += 1;
                }
            }
        }

        if report.released > 0 || report.failed > 0 {
            info!(
                released = report.released,
                skipped_locked = report.skipped_locked,
                failed = report.failed,
                "Expired hold sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_workspace(
        &self,
        workspace_id: &WorkspaceId,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Option<Vec<HoldId>>> {
        let Some(mut tx) = self.store.try_begin(workspace_id).await? else {
            return Ok(None);
        };
        let mut expired = tx.expired_active_holds(now, batch_size).await?;
        if expired.is_empty() {
            return Ok(Some(Vec::new()));
        }
        for hold in &mut expired {
            hold.settle(HoldStatus::Released, now);
            tx.update_hold(hold).await?;
        }
        tx.commit().await?;

        for hold in &expired {
            self.metrics.holds_force_released.inc();
            warn!(
                hold_id = %hold.id,
                workspace_id = %workspace_id,
                source_id = %hold.source_id,
                amount = %hold.amount_reserved,
                expired_at = %hold.expires_at,
                "Force-released abandoned hold"
            );
            self.record_audit(
                AuditEvent::new(AuditAction::ForceReleaseHold, *workspace_id, now)
                    .category(hold.category)
                    .amount(hold.amount_reserved)
                    .source(&hold.source_id)
                    .hold(hold.id)
                    .actor("hold-sweeper"),
            )
            .await;
        }
        Ok(Some(expired.into_iter().map(|h| h.id).collect()))
    }

    async fn hold_workspace(&self, hold_id: &HoldId) -> Result<WorkspaceId> {
        self.store
            .load_hold(hold_id)
            .await?
            .map(|hold| hold.workspace_id)
            .ok_or_else(|| Error::NotFound {
                entity: "hold",
                id: hold_id.to_string(),
            })
    }

    async fn locked_hold(
        &self,
        tx: &mut dyn crate::store::LedgerTx,
        hold_id: &HoldId,
    ) -> Result<CreditHold> {
        tx.hold(hold_id).await?.ok_or_else(|| Error::NotFound {
            entity: "hold",
            id: hold_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::GrantRequest;
    use crate::store::RetryPolicy;
    use crate::types::{AllocationType, CreditCategory, Plan};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn funded() -> (LedgerEngine, ManualClock, WorkspaceId) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let engine = LedgerEngine::builder()
            .clock(Arc::new(clock.clone()))
            .retry_policy(RetryPolicy::none())
            .build();
        let ws = engine.create_workspace("acme", Plan::Free).await.unwrap().id;
        engine
            .grant_credits(GrantRequest::new(
                ws,
                CreditCategory::ReportCredits,
                dec!(10),
                AllocationType::Purchased,
            ))
            .await
            .unwrap();
        (engine, clock, ws)
    }

    #[tokio::test]
    async fn test_reserve_rejects_ttl_above_max() {
        let (engine, _, ws) = funded().await;
        let err = engine
            .reserve(
                ReserveRequest::new(ws, CreditCategory::ReportCredits, dec!(1), "r1")
                    .ttl(Duration::from_secs(86_401)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_source() {
        let (engine, _, ws) = funded().await;
        let first = engine
            .reserve(ReserveRequest::new(ws, CreditCategory::ReportCredits, dec!(2), "r1"))
            .await
            .unwrap();
        let second = engine
            .reserve(ReserveRequest::new(ws, CreditCategory::ReportCredits, dec!(2), "r1"))
            .await
            .unwrap();
        assert!(second.duplicate);
        assert_eq!(first.hold_id(), second.hold_id());

        let balance = engine
            .get_balance(&ws, CreditCategory::ReportCredits)
            .await
            .unwrap();
        assert_eq!(balance.reserved, dec!(2));
    }

    #[tokio::test]
    async fn test_release_twice_is_noop_and_consume_after_release_fails() {
        let (engine, _, ws) = funded().await;
        let hold = engine
            .reserve(ReserveRequest::new(ws, CreditCategory::ReportCredits, dec!(1), "r1"))
            .await
            .unwrap();
        engine.release_hold(&hold.hold_id()).await.unwrap();
        engine.release_hold(&hold.hold_id()).await.unwrap();

        let err = engine.consume_hold(&hold.hold_id()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::HoldNotActive {
                status: HoldStatus::Released,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_extend_is_capped_by_max_ttl() {
        let (engine, clock, ws) = funded().await;
        let hold = engine
            .reserve(
                ReserveRequest::new(ws, CreditCategory::ReportCredits, dec!(1), "r1")
                    .ttl(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        let created = hold.hold.created_at;

        let extended = engine
            .extend_hold(&hold.hold_id(), Duration::from_secs(200_000))
            .await
            .unwrap();
        assert_eq!(extended.expires_at, created + chrono::Duration::seconds(86_400));

        let err = engine
            .extend_hold(&hold.hold_id(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        clock.advance(chrono::Duration::days(2));
        let err = engine
            .extend_hold(&hold.hold_id(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HoldNotActive { expired: true, .. }));
    }

    #[tokio::test]
    async fn test_unknown_hold_is_not_found() {
        let (engine, _, _) = funded().await;
        let err = engine.release_hold(&HoldId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "hold", .. }));
    }
}
