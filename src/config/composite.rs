//! Layers providers in priority order; the earliest layer holding a key wins.

use std::collections::BTreeSet;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Default)]
pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, provider: Box<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Name of the layer a key resolves from, if any holds it.
    pub async fn source_of(&self, key: &str) -> ConfigResult<Option<&str>> {
        for provider in &self.providers {
            if provider.get_raw(key).await?.is_some() {
                return Ok(Some(provider.name()));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl ConfigProvider for CompositeConfigProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        for provider in &self.providers {
            if let Some(value) = provider.get_raw(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut keys = BTreeSet::new();
        for provider in &self.providers {
            keys.extend(provider.list_keys(prefix).await?);
        }
        Ok(keys.into_iter().collect())
    }
}

impl std::fmt::Debug for CompositeConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeConfigProvider")
            .field("provider_names", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerSettings;
    use crate::config::env::EnvConfigProvider;
    use crate::config::memory::MemoryConfigProvider;

    fn layered() -> CompositeConfigProvider {
        let overrides = MemoryConfigProvider::named("overrides").value("ledger.retry.max_attempts", 5);
        let defaults = MemoryConfigProvider::named("defaults")
            .value("ledger.retry.max_attempts", 3)
            .value("tasks.sweep_batch_size", 200);
        CompositeConfigProvider::new()
            .provider(Box::new(EnvConfigProvider::prefixed("CREDIT_LEDGER_COMPOSITE_TEST_")))
            .provider(Box::new(overrides))
            .provider(Box::new(defaults))
    }

    #[tokio::test]
    async fn test_first_layer_wins() {
        let composite = layered();
        assert_eq!(
            composite.get_raw("ledger.retry.max_attempts").await.unwrap(),
            Some("5".to_string())
        );
        assert_eq!(
            composite.source_of("tasks.sweep_batch_size").await.unwrap(),
            Some("defaults")
        );
        assert_eq!(composite.source_of("database.url").await.unwrap(), None);

        let settings = LedgerSettings::load(&composite).await.unwrap();
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.tasks.sweep_batch_size, 200);
    }

    #[tokio::test]
    async fn test_list_keys_deduplicates() {
        let a = MemoryConfigProvider::new()
            .value("tasks.sweep_interval_secs", 30)
            .value("tasks.purge_interval_secs", 60);
        let b = MemoryConfigProvider::new().value("tasks.sweep_interval_secs", 90);

        let composite = CompositeConfigProvider::new()
            .provider(Box::new(a))
            .provider(Box::new(b));
        let keys = composite.list_keys("tasks.").await.unwrap();
        assert_eq!(keys, vec!["tasks.purge_interval_secs", "tasks.sweep_interval_secs"]);
    }
}
