//! Metrics and structured tracing for the ledger.
//!
//! Every engine operation runs inside a [`LedgerSpan`] and bumps counters on
//! a shared [`LedgerMetrics`] registry. With the `subscriber` feature,
//! [`init_tracing`] installs an env-filtered `tracing-subscriber` for hosts
//! that do not bring their own.

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, LedgerMetrics, MetricsSummary};
pub use spans::LedgerSpan;

/// Installs a global fmt subscriber. `RUST_LOG` wins over `default_directive`.
///
/// Returns an error if a global subscriber is already set.
#[cfg(feature = "subscriber")]
pub fn init_tracing(default_directive: &str) -> crate::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| crate::Error::Config(format!("invalid tracing directive: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| crate::Error::Config(format!("tracing already initialised: {}", e)))
}
