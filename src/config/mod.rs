//! Layered configuration.
//!
//! ```rust,no_run
//! use credit_ledger::config::{ConfigBuilder, LedgerSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigBuilder::new()
//!     .env_with_prefix("CREDIT_")
//!     .build()
//!     .await?;
//! let settings = LedgerSettings::load(&config).await?;
//! # Ok(())
//! # }
//! ```

pub mod composite;
pub mod env;
pub mod memory;
pub mod provider;
pub mod settings;

pub use composite::CompositeConfigProvider;
pub use env::EnvConfigProvider;
pub use memory::MemoryConfigProvider;
pub use provider::{ConfigProvider, ConfigProviderExt};
pub use settings::{
    AllocatorSettings, HoldSettings, LedgerSettings, QuotaSettings, RetrySettings, TaskSettings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Every problem found while loading settings, reported together.
#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Assembles providers into a [`CompositeConfigProvider`]; the first added wins.
pub struct ConfigBuilder {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn env(mut self) -> Self {
        self.providers.push(Box::new(EnvConfigProvider::new()));
        self
    }

    pub fn env_with_prefix(mut self, prefix: &str) -> Self {
        self.providers
            .push(Box::new(EnvConfigProvider::prefixed(prefix)));
        self
    }

    pub fn memory(mut self, provider: MemoryConfigProvider) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub async fn build(self) -> ConfigResult<CompositeConfigProvider> {
        let mut composite = CompositeConfigProvider::new();
        for provider in self.providers {
            composite.add_provider(provider);
        }
        Ok(composite)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display() {
        let err = ConfigError::ValidationErrors(ValidationErrors(vec![
            ConfigError::invalid("quota.soft_threshold_pct", "must be below hard threshold"),
            ConfigError::invalid("tasks.sweep_batch_size", "value 0 not in range 1..=100000"),
        ]));
        let text = err.to_string();
        assert!(text.starts_with("Validation failed: "));
        assert!(text.contains("quota.soft_threshold_pct"));
        assert!(text.contains("; Invalid value for tasks.sweep_batch_size"));
    }

    #[tokio::test]
    async fn test_config_builder_order() {
        let config = ConfigBuilder::new()
            .memory(MemoryConfigProvider::named("overrides"))
            .env_with_prefix("CREDIT_LEDGER_TEST_")
            .build()
            .await
            .unwrap();
        assert_eq!(config.provider_names(), vec!["overrides", "env"]);
    }
}
