//! In-memory configuration provider, for tests and code-defined settings.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Debug, Clone)]
pub struct MemoryConfigProvider {
    data: Arc<RwLock<HashMap<String, String>>>,
    name: String,
}

impl Default for MemoryConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::from_data(name, HashMap::new())
    }

    pub fn from_data(name: impl Into<String>, data: HashMap<String, String>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            name: name.into(),
        }
    }

    /// Builder-style insert. Clones of the provider share the same data, so
    /// the value is visible through all of them.
    pub fn value(self, key: impl Into<String>, value: impl ToString) -> Self {
        let (key, value) = (key.into(), value.to_string());
        match Arc::try_unwrap(self.data) {
            Ok(lock) => {
                let mut data = lock.into_inner();
                data.insert(key, value);
                Self::from_data(self.name, data)
            }
            Err(shared) => {
                if let Ok(mut data) = shared.try_write() {
                    data.insert(key, value);
                }
                Self {
                    data: shared,
                    name: self.name,
                }
            }
        }
    }

    pub async fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.data.write().await.insert(key.into(), value.into());
    }

    pub async fn remove(&self, key: &str) -> Option<String> {
        self.data.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.data.write().await.clear();
    }
}

#[async_trait::async_trait]
impl ConfigProvider for MemoryConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let data = self.data.read().await;
        Ok(data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::provider::ConfigProviderExt;

    #[tokio::test]
    async fn test_builder_values() {
        let provider = MemoryConfigProvider::new()
            .value("ledger.hold.default_ttl_secs", 600)
            .value("database.url", "postgres://localhost/ledger");

        assert_eq!(provider.len().await, 2);
        let ttl: Option<u64> = provider.get("ledger.hold.default_ttl_secs").await.unwrap();
        assert_eq!(ttl, Some(600));
    }

    #[tokio::test]
    async fn test_value_on_shared_provider() {
        let provider = MemoryConfigProvider::new();
        let shared = provider.clone();
        let provider = provider.value("quota.hard_threshold_pct", 95);
        assert_eq!(
            shared.get_raw("quota.hard_threshold_pct").await.unwrap(),
            Some("95".to_string())
        );
        assert_eq!(provider.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_remove_and_list() {
        let provider = MemoryConfigProvider::new();
        provider.insert("tasks.sweep_interval_secs", "30").await;
        provider.insert("tasks.sweep_batch_size", "100").await;
        provider.insert("quota.soft_threshold_pct", "75").await;

        let mut keys = provider.list_keys("tasks.").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["tasks.sweep_batch_size", "tasks.sweep_interval_secs"]);

        assert_eq!(provider.remove("tasks.sweep_batch_size").await.as_deref(), Some("100"));
        assert_eq!(provider.remove("tasks.sweep_batch_size").await, None);
        let cycles: Option<u32> = provider.get("allocator.rollover_cycles").await.unwrap();
        assert_eq!(cycles, None);
    }
}
