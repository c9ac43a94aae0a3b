//! Scheduled background tasks.
//!
//! Each task drives the ledger only through its public operations and runs
//! on a `tokio::time::interval` until its [`CancellationToken`] fires.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::allocator::{AllocatorSummary, MonthlyAllocator};
use crate::config::LedgerSettings;
use crate::ledger::{LedgerEngine, SweepReport};

/// Running background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the task and waits for its current tick to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(task = self.name, error = %e, "Background task ended abnormally");
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancelled = token.clone();
    let join = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(task = name, interval_secs = period.as_secs(), "Background task started");

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    info!(task = name, "Background task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    tick().await;
                }
            }
        }
    });
    TaskHandle { name, token, join }
}

/// Periodically force-releases expired holds.
#[derive(Debug, Clone)]
pub struct HoldSweeper {
    ledger: LedgerEngine,
    interval: Duration,
    batch_size: usize,
}

impl HoldSweeper {
    pub fn new(ledger: LedgerEngine) -> Self {
        Self {
            ledger,
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Most holds released per workspace per pass.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn settings(self, settings: &LedgerSettings) -> Self {
        self.interval(settings.tasks.sweep_interval())
            .batch_size(settings.tasks.sweep_batch_size)
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        self.ledger.release_expired_holds(self.batch_size).await
    }

    pub fn spawn(self) -> TaskHandle {
        self.spawn_with(CancellationToken::new())
    }

    pub fn spawn_with(self, token: CancellationToken) -> TaskHandle {
        let period = self.interval;
        spawn_periodic("hold-sweeper", period, token, move || {
            let sweeper = self.clone();
            async move {
                match sweeper.run_once().await {
                    Ok(report) => debug!(released = report.released, "Hold sweep tick"),
                    Err(e) => warn!(error = %e, "Hold sweep failed"),
                }
            }
        })
    }
}

/// Runs the current billing cycle for every workspace. Re-running a cycle
/// is a no-op, so the interval can be much shorter than a month.
#[derive(Debug, Clone)]
pub struct MonthlyAllocationTask {
    allocator: MonthlyAllocator,
    interval: Duration,
}

impl MonthlyAllocationTask {
    pub fn new(allocator: MonthlyAllocator) -> Self {
        Self {
            allocator,
            interval: Duration::from_secs(3600),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn settings(self, settings: &LedgerSettings) -> Self {
        self.interval(settings.tasks.allocation_interval())
    }

    pub async fn run_once(&self) -> Result<AllocatorSummary> {
        self.allocator.run_current().await
    }

    pub fn spawn(self) -> TaskHandle {
        self.spawn_with(CancellationToken::new())
    }

    pub fn spawn_with(self, token: CancellationToken) -> TaskHandle {
        let period = self.interval;
        spawn_periodic("monthly-allocator", period, token, move || {
            let task = self.clone();
            async move {
                match task.run_once().await {
                    Ok(summary) => debug!(
                        cycle = %summary.cycle,
                        granted = summary.granted,
                        "Monthly allocation tick"
                    ),
                    Err(e) => warn!(error = %e, "Monthly allocation failed"),
                }
            }
        })
    }
}

/// Deletes exhausted allocations once they are past the retention window.
#[derive(Debug, Clone)]
pub struct PurgeTask {
    ledger: LedgerEngine,
    interval: Duration,
    retention: chrono::Duration,
}

impl PurgeTask {
    pub fn new(ledger: LedgerEngine) -> Self {
        Self {
            ledger,
            interval: Duration::from_secs(86_400),
            retention: chrono::Duration::days(90),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn settings(self, settings: &LedgerSettings) -> Self {
        self.interval(settings.tasks.purge_interval())
            .retention(settings.tasks.purge_retention())
    }

    pub async fn run_once(&self) -> Result<usize> {
        self.ledger.purge_retired_allocations(self.retention).await
    }

    pub fn spawn(self) -> TaskHandle {
        self.spawn_with(CancellationToken::new())
    }

    pub fn spawn_with(self, token: CancellationToken) -> TaskHandle {
        let period = self.interval;
        spawn_periodic("allocation-purge", period, token, move || {
            let task = self.clone();
            async move {
                if let Err(e) = task.run_once().await {
                    warn!(error = %e, "Allocation purge failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let sweeper = HoldSweeper::new(LedgerEngine::builder().build())
            .interval(Duration::from_millis(10));
        let handle = sweeper.spawn();
        assert_eq!(handle.name(), "hold-sweeper");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_token_stops_every_task() {
        let ledger = LedgerEngine::builder().build();
        let token = CancellationToken::new();
        let sweep = HoldSweeper::new(ledger.clone())
            .interval(Duration::from_millis(5))
            .spawn_with(token.child_token());
        let purge = PurgeTask::new(ledger)
            .interval(Duration::from_millis(5))
            .spawn_with(token.child_token());

        token.cancel();
        sweep.shutdown().await;
        purge.shutdown().await;
    }
}
