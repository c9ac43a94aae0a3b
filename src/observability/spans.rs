//! Structured span definitions for ledger operations.

use std::time::Instant;

use rust_decimal::Decimal;
use tracing::{Level, Span, field, span};

use crate::types::{CreditCategory, WorkspaceId};

/// Span around one ledger operation, recording latency and outcome on finish.
pub struct LedgerSpan {
    span: Span,
    start: Instant,
}

impl LedgerSpan {
    pub fn new(operation: &'static str, workspace_id: &WorkspaceId) -> Self {
        let span = span!(
            Level::INFO,
            "ledger.operation",
            otel.name = operation,
            operation = operation,
            workspace_id = %workspace_id,
            category = field::Empty,
            amount = field::Empty,
            source_id = field::Empty,
            outcome = field::Empty,
            duplicate = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn category(self, category: CreditCategory) -> Self {
        self.span.record("category", category.as_str());
        self
    }

    pub fn amount(self, amount: Decimal) -> Self {
        self.span.record("amount", field::display(amount));
        self
    }

    pub fn source(self, source_id: &str) -> Self {
        self.span.record("source_id", source_id);
        self
    }

    pub fn record_duplicate(&self, duplicate: bool) {
        self.span.record("duplicate", duplicate);
    }

    /// Records `ok` or the error code, and the elapsed time in milliseconds.
    pub fn finish<T>(self, result: &crate::Result<T>) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.code().as_str(),
        };
        self.span.record("outcome", outcome);
        self.span.record("latency_ms", latency_ms);
        latency_ms
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
