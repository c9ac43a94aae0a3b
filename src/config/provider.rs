//! Read-only configuration sources.
//!
//! Settings are resolved once when the ledger starts, so a provider only
//! answers lookups. Keys are dotted, e.g. `ledger.hold.max_ttl_secs`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ConfigError, ConfigResult};

#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Layer name, reported by [`CompositeConfigProvider::source_of`](super::CompositeConfigProvider::source_of).
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>>;
}

/// Typed lookups on top of [`ConfigProvider::get_raw`].
pub trait ConfigProviderExt: ConfigProvider {
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            match self.get_raw(key).await? {
                Some(raw) => decode(key, &raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}

/// JSON first, then the bare text as a string, so `900`, `"acme"` and an
/// unquoted `postgres://…` from the environment all decode.
fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> ConfigResult<T> {
    let raw = raw.trim();
    serde_json::from_str(raw)
        .or_else(|e| serde_json::from_value(Value::String(raw.to_string())).map_err(|_| e))
        .map_err(|e| ConfigError::invalid(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_numbers_and_text() {
        assert_eq!(decode::<u64>("a", " 900 ").unwrap(), 900);
        assert_eq!(decode::<String>("a", "\"quoted\"").unwrap(), "quoted");
        assert_eq!(
            decode::<String>("database.url", "postgres://db:5432/ledger").unwrap(),
            "postgres://db:5432/ledger"
        );
        assert!(decode::<bool>("a", "true").unwrap());
    }

    #[test]
    fn test_decode_reports_key() {
        let err = decode::<u32>("tasks.sweep_batch_size", "lots").unwrap_err();
        assert!(matches!(
            &err,
            ConfigError::InvalidValue { key, .. } if key == "tasks.sweep_batch_size"
        ));
    }
}
