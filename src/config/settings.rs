//! Typed ledger settings resolved from a [`ConfigProvider`].
//!
//! | Key | Default |
//! |-----|---------|
//! | `ledger.hold.default_ttl_secs` | 900 |
//! | `ledger.hold.max_ttl_secs` | 86400 |
//! | `ledger.retry.max_attempts` | 3 |
//! | `ledger.retry.initial_backoff_ms` | 50 |
//! | `ledger.retry.max_backoff_ms` | 2000 |
//! | `quota.soft_threshold_pct` | 80 |
//! | `quota.hard_threshold_pct` | 100 |
//! | `allocator.rollover_cycles` | 1 |
//! | `tasks.sweep_interval_secs` | 60 |
//! | `tasks.sweep_batch_size` | 500 |
//! | `tasks.purge_interval_secs` | 86400 |
//! | `tasks.purge_retention_days` | 90 |
//! | `tasks.allocation_interval_secs` | 3600 |
//! | `tasks.allocation_concurrency` | 8 |
//! | `database.url` | unset |

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::ledger::HoldPolicy;
use crate::quota::QuotaThresholds;
use crate::store::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldSettings {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub soft_threshold_pct: u8,
    pub hard_threshold_pct: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorSettings {
    pub rollover_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSettings {
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    pub purge_interval_secs: u64,
    pub purge_retention_days: u32,
    pub allocation_interval_secs: u64,
    pub allocation_concurrency: usize,
}

impl TaskSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn purge_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.purge_retention_days))
    }

    pub fn allocation_interval(&self) -> Duration {
        Duration::from_secs(self.allocation_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSettings {
    pub hold: HoldSettings,
    pub retry: RetrySettings,
    pub quota: QuotaSettings,
    pub allocator: AllocatorSettings,
    pub tasks: TaskSettings,
    /// Connection string for the postgres backend.
    pub database_url: Option<String>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            hold: HoldSettings {
                default_ttl_secs: 900,
                max_ttl_secs: 86_400,
            },
            retry: RetrySettings {
                max_attempts: 3,
                initial_backoff_ms: 50,
                max_backoff_ms: 2_000,
            },
            quota: QuotaSettings {
                soft_threshold_pct: 80,
                hard_threshold_pct: 100,
            },
            allocator: AllocatorSettings { rollover_cycles: 1 },
            tasks: TaskSettings {
                sweep_interval_secs: 60,
                sweep_batch_size: 500,
                purge_interval_secs: 86_400,
                purge_retention_days: 90,
                allocation_interval_secs: 3_600,
                allocation_concurrency: 8,
            },
            database_url: None,
        }
    }
}

/// Reads keys and collects every failure instead of stopping at the first.
struct Reader<'a, P: ?Sized> {
    provider: &'a P,
    errors: Vec<ConfigError>,
}

impl<'a, P: ConfigProvider + ?Sized> Reader<'a, P> {
    async fn read<T>(&mut self, key: &str, default: T, range: RangeInclusive<T>) -> T
    where
        T: DeserializeOwned + PartialOrd + std::fmt::Display + Copy + Send,
    {
        match self.provider.get::<T>(key).await {
            Ok(Some(value)) if range.contains(&value) => value,
            Ok(Some(value)) => {
                self.errors.push(ConfigError::invalid(
                    key,
                    format!(
                        "value {} not in range {}..={}",
                        value,
                        range.start(),
                        range.end()
                    ),
                ));
                default
            }
            Ok(None) => default,
            Err(e) => {
                self.errors.push(e);
                default
            }
        }
    }

    async fn read_string(&mut self, key: &str) -> Option<String> {
        match self.provider.get::<String>(key).await {
            Ok(value) => value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    fn check(&mut self, ok: bool, key: &str, message: &str) {
        if !ok {
            self.errors.push(ConfigError::invalid(key, message));
        }
    }
}

impl LedgerSettings {
    /// Resolves every key, falling back to defaults. All invalid values are
    /// reported together as [`ConfigError::ValidationErrors`].
    pub async fn load<P: ConfigProvider + ?Sized>(provider: &P) -> ConfigResult<Self> {
        let d = Self::default();
        let mut r = Reader {
            provider,
            errors: Vec::new(),
        };

        let hold = HoldSettings {
            default_ttl_secs: r
                .read("ledger.hold.default_ttl_secs", d.hold.default_ttl_secs, 1..=604_800)
                .await,
            max_ttl_secs: r
                .read("ledger.hold.max_ttl_secs", d.hold.max_ttl_secs, 1..=604_800)
                .await,
        };
        let retry = RetrySettings {
            max_attempts: r
                .read("ledger.retry.max_attempts", d.retry.max_attempts, 0..=10)
                .await,
            initial_backoff_ms: r
                .read("ledger.retry.initial_backoff_ms", d.retry.initial_backoff_ms, 1..=60_000)
                .await,
            max_backoff_ms: r
                .read("ledger.retry.max_backoff_ms", d.retry.max_backoff_ms, 1..=300_000)
                .await,
        };
        let quota = QuotaSettings {
            soft_threshold_pct: r
                .read("quota.soft_threshold_pct", d.quota.soft_threshold_pct, 1..=100)
                .await,
            hard_threshold_pct: r
                .read("quota.hard_threshold_pct", d.quota.hard_threshold_pct, 1..=200)
                .await,
        };
        let allocator = AllocatorSettings {
            rollover_cycles: r
                .read("allocator.rollover_cycles", d.allocator.rollover_cycles, 0..=12)
                .await,
        };
        let tasks = TaskSettings {
            sweep_interval_secs: r
                .read("tasks.sweep_interval_secs", d.tasks.sweep_interval_secs, 1..=86_400)
                .await,
            sweep_batch_size: r
                .read("tasks.sweep_batch_size", d.tasks.sweep_batch_size, 1..=100_000)
                .await,
            purge_interval_secs: r
                .read("tasks.purge_interval_secs", d.tasks.purge_interval_secs, 60..=2_592_000)
                .await,
            purge_retention_days: r
                .read("tasks.purge_retention_days", d.tasks.purge_retention_days, 0..=3_650)
                .await,
            allocation_interval_secs: r
                .read(
                    "tasks.allocation_interval_secs",
                    d.tasks.allocation_interval_secs,
                    60..=86_400,
                )
                .await,
            allocation_concurrency: r
                .read("tasks.allocation_concurrency", d.tasks.allocation_concurrency, 1..=256)
                .await,
        };
        let database_url = r.read_string("database.url").await;

        r.check(
            hold.default_ttl_secs <= hold.max_ttl_secs,
            "ledger.hold.default_ttl_secs",
            "must not exceed ledger.hold.max_ttl_secs",
        );
        r.check(
            retry.initial_backoff_ms <= retry.max_backoff_ms,
            "ledger.retry.initial_backoff_ms",
            "must not exceed ledger.retry.max_backoff_ms",
        );
        r.check(
            quota.soft_threshold_pct < quota.hard_threshold_pct,
            "quota.soft_threshold_pct",
            "must be below quota.hard_threshold_pct",
        );

        if !r.errors.is_empty() {
            return Err(ConfigError::ValidationErrors(ValidationErrors(r.errors)));
        }

        Ok(Self {
            hold,
            retry,
            quota,
            allocator,
            tasks,
            database_url,
        })
    }

    pub fn hold_policy(&self) -> HoldPolicy {
        HoldPolicy {
            default_ttl: Duration::from_secs(self.hold.default_ttl_secs),
            max_ttl: Duration::from_secs(self.hold.max_ttl_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn quota_thresholds(&self) -> QuotaThresholds {
        QuotaThresholds {
            soft_pct: self.quota.soft_threshold_pct,
            hard_pct: self.quota.hard_threshold_pct,
        }
    }
}
