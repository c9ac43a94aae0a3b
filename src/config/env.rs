//! Environment variable configuration provider.
//!
//! `ledger.hold.max_ttl_secs` with prefix `CREDIT_` reads
//! `CREDIT_LEDGER_HOLD_MAX_TTL_SECS`.

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider {
    prefix: Option<String>,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self { prefix: None }
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn env_key(&self, key: &str) -> String {
        let name = key.to_uppercase().replace('.', "_");
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, name),
            None => name,
        }
    }

    /// Lossy: underscores inside a key segment come back as dots.
    fn key_from_env(&self, env_name: &str) -> Option<String> {
        let rest = match &self.prefix {
            Some(prefix) => env_name.strip_prefix(prefix.as_str())?,
            None => env_name,
        };
        Some(rest.to_lowercase().replace('_', "."))
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let env_prefix = self.env_key(prefix);
        Ok(std::env::vars()
            .filter(|(k, _)| k.starts_with(&env_prefix))
            .filter_map(|(k, _)| self.key_from_env(&k))
            .collect())
    }
}
