//! Audit trail of financial state transitions.
//!
//! The engine hands every committed mutation to an [`AuditSink`] together
//! with the available balance before and after it. Sinks are best effort:
//! a failing sink is logged and counted, and the mutation stands.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::{CreditCategory, HoldId, Metadata, TransactionId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Grant,
    Debit,
    Refund,
    Reserve,
    ConsumeHold,
    ReleaseHold,
    ExtendHold,
    /// Released by the sweep after the caller let it expire.
    ForceReleaseHold,
    Expiration,
    RolloverTrim,
    QuotaOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub workspace_id: WorkspaceId,
    pub category: Option<CreditCategory>,
    pub amount: Option<Decimal>,
    pub source_id: Option<String>,
    pub hold_id: Option<HoldId>,
    pub transaction_ids: Vec<TransactionId>,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    /// Admin or system identity behind the action.
    pub actor: Option<String>,
    pub metadata: Metadata,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, workspace_id: WorkspaceId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            action,
            workspace_id,
            category: None,
            amount: None,
            source_id: None,
            hold_id: None,
            transaction_ids: Vec::new(),
            balance_before: None,
            balance_after: None,
            actor: None,
            metadata: Metadata::new(),
            occurred_at,
        }
    }

    pub fn category(mut self, category: CreditCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn hold(mut self, hold_id: HoldId) -> Self {
        self.hold_id = Some(hold_id);
        self
    }

    pub fn transactions(mut self, ids: Vec<TransactionId>) -> Self {
        self.transaction_ids = ids;
        self
    }

    pub fn balances(mut self, before: Decimal, after: Decimal) -> Self {
        self.balance_before = Some(before);
        self.balance_after = Some(after);
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes events as structured `tracing` records on the `credit_ledger::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let metadata = serde_json::to_string(&event.metadata)?;
        tracing::info!(
            target: "credit_ledger::audit",
            action = ?event.action,
            workspace_id = %event.workspace_id,
            category = event.category.map(|c| c.as_str()),
            amount = event.amount.map(|a| a.to_string()),
            source_id = event.source_id.as_deref(),
            hold_id = event.hold_id.map(|h| h.to_string()),
            transactions = event.transaction_ids.len(),
            balance_before = event.balance_before.map(|b| b.to_string()),
            balance_after = event.balance_after.map(|b| b.to_string()),
            actor = event.actor.as_deref(),
            metadata = %metadata,
            "ledger state transition"
        );
        Ok(())
    }
}

/// Keeps events in memory, for tests and admin tooling.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        let ws = WorkspaceId::new();
        let now = Utc::now();

        sink.record(
            &AuditEvent::new(AuditAction::Grant, ws, now)
                .category(CreditCategory::ReportCredits)
                .amount(dec!(10))
                .balances(dec!(0), dec!(10)),
        )
        .await
        .unwrap();
        sink.record(&AuditEvent::new(AuditAction::Debit, ws, now))
            .await
            .unwrap();

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].balance_after, Some(dec!(10)));
        assert_eq!(sink.events_for(AuditAction::Debit).await.len(), 1);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_events() {
        let event = AuditEvent::new(AuditAction::QuotaOverride, WorkspaceId::new(), Utc::now())
            .actor("admin-7");
        assert!(TracingAuditSink.record(&event).await.is_ok());
    }

    #[test]
    fn test_action_serialization() {
        let json = serde_json::to_string(&AuditAction::ForceReleaseHold).unwrap();
        assert_eq!(json, "\"FORCE_RELEASE_HOLD\"");
    }
}
