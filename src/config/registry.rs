//! Process-wide index of dynamic cache configs.
//!
//! The dynamic config distribution delivers one JSON document per subscribed
//! name. Which documents belong to this subsystem is decided once during
//! startup by [`CacheConfigSet::set_config_name`] and
//! [`CacheConfigSet::set_lru_config_name`]; an empty name leaves the
//! corresponding section disabled.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::lock;

use super::{CacheConfig, ConfigError, LruCacheConfig};

const REGISTRY_NAME: &str = "cache-config-registry";

static CONFIG_NAME: RwLock<String> = RwLock::new(String::new());
static LRU_CONFIG_NAME: RwLock<String> = RwLock::new(String::new());

/// Maps cache name to its latest dynamic config.
///
/// Rebuilt from scratch whenever the authoritative dynamic config document
/// set changes; lookups are O(1) average.
#[derive(Debug, Default)]
pub struct CacheConfigSet {
    configs: HashMap<String, CacheConfig>,
    lru_configs: HashMap<String, LruCacheConfig>,
}

impl CacheConfigSet {
    /// Rebuilds the index from the dynamic config document map.
    ///
    /// `docs` maps document name to document body; only the documents named
    /// via [`Self::set_config_name`] / [`Self::set_lru_config_name`] are
    /// consulted. A parse failure of any entry fails the whole rebuild.
    pub fn new(docs: &serde_json::Value) -> Result<Self, ConfigError> {
        let mut set = Self::default();

        let config_name = config_name();
        if !config_name.is_empty() {
            for (cache_name, value) in doc_entries(docs, &config_name)? {
                let config = CacheConfig::from_dynamic(value).map_err(|err| {
                    ConfigError::new(
                        format!("{config_name}.{cache_name}.{}", err.path),
                        err.message,
                    )
                })?;
                set.configs.insert(cache_name.clone(), config);
            }
        }

        let lru_config_name = lru_config_name();
        if !lru_config_name.is_empty() {
            for (cache_name, value) in doc_entries(docs, &lru_config_name)? {
                let config = LruCacheConfig::from_dynamic(value).map_err(|err| {
                    ConfigError::new(
                        format!("{lru_config_name}.{cache_name}.{}", err.path),
                        err.message,
                    )
                })?;
                set.lru_configs.insert(cache_name.clone(), config);
            }
        }

        Ok(set)
    }

    /// Latest dynamic config for the named cache, if any was distributed.
    pub fn get_config(&self, cache_name: &str) -> Option<CacheConfig> {
        self.configs.get(cache_name).cloned()
    }

    /// Latest dynamic LRU config for the named cache, if any was distributed.
    pub fn get_lru_config(&self, cache_name: &str) -> Option<LruCacheConfig> {
        self.lru_configs.get(cache_name).cloned()
    }

    /// True when a cache config document name has been registered.
    pub fn is_config_enabled() -> bool {
        !config_name().is_empty()
    }

    /// True when an LRU config document name has been registered.
    pub fn is_lru_config_enabled() -> bool {
        !lru_config_name().is_empty()
    }

    /// Registers the cache config document name. Call once during startup.
    pub fn set_config_name(name: impl Into<String>) {
        *lock::rw_write(&CONFIG_NAME, REGISTRY_NAME, "set_config_name") = name.into();
    }

    /// Registers the LRU config document name. Call once during startup.
    pub fn set_lru_config_name(name: impl Into<String>) {
        *lock::rw_write(&LRU_CONFIG_NAME, REGISTRY_NAME, "set_lru_config_name") = name.into();
    }
}

fn config_name() -> String {
    lock::rw_read(&CONFIG_NAME, REGISTRY_NAME, "config_name").clone()
}

fn lru_config_name() -> String {
    lock::rw_read(&LRU_CONFIG_NAME, REGISTRY_NAME, "lru_config_name").clone()
}

fn doc_entries<'a>(
    docs: &'a serde_json::Value,
    doc_name: &str,
) -> Result<impl Iterator<Item = (&'a String, &'a serde_json::Value)>, ConfigError> {
    docs.get(doc_name)
        .and_then(serde_json::Value::as_object)
        .map(|doc| doc.iter())
        .ok_or_else(|| {
            ConfigError::new(
                doc_name,
                "dynamic config document is missing or not an object",
            )
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    // The document name slots are process-wide; tests touching them hold
    // this mutex so parallel test threads do not interleave.
    static NAME_SLOTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn empty_names_disable_both_sections() {
        let _slots = NAME_SLOTS.lock().unwrap();
        CacheConfigSet::set_config_name("");
        CacheConfigSet::set_lru_config_name("");

        assert!(!CacheConfigSet::is_config_enabled());
        assert!(!CacheConfigSet::is_lru_config_enabled());

        let set = CacheConfigSet::new(&json!({})).unwrap();
        assert!(set.get_config("routes").is_none());
        assert!(set.get_lru_config("routes").is_none());
    }

    #[test]
    fn parses_registered_documents() {
        let _slots = NAME_SLOTS.lock().unwrap();
        CacheConfigSet::set_config_name("CACHE_SETTINGS");
        CacheConfigSet::set_lru_config_name("LRU_CACHE_SETTINGS");

        let docs = json!({
            "CACHE_SETTINGS": {
                "routes": {
                    "update-interval-ms": 1000,
                    "full-update-interval-ms": 5000,
                },
            },
            "LRU_CACHE_SETTINGS": {
                "users": {
                    "size": 1000,
                    "lifetime-ms": 60000,
                    "background-update": true,
                },
            },
        });

        let set = CacheConfigSet::new(&docs).unwrap();

        let routes = set.get_config("routes").unwrap();
        assert_eq!(routes.update_interval, Duration::from_secs(1));
        assert_eq!(routes.full_update_interval, Duration::from_secs(5));
        assert!(set.get_config("missing").is_none());

        let users = set.get_lru_config("users").unwrap();
        assert_eq!(users.size, 1000);
        assert_eq!(users.lifetime, Duration::from_secs(60));

        CacheConfigSet::set_config_name("");
        CacheConfigSet::set_lru_config_name("");
    }

    #[test]
    fn bad_entry_fails_the_whole_rebuild() {
        let _slots = NAME_SLOTS.lock().unwrap();
        CacheConfigSet::set_config_name("BROKEN_SETTINGS");
        CacheConfigSet::set_lru_config_name("");

        let docs = json!({
            "BROKEN_SETTINGS": {
                "routes": { "update-interval-ms": "soon" },
            },
        });

        let err = CacheConfigSet::new(&docs).unwrap_err();
        assert!(err.path.contains("BROKEN_SETTINGS.routes"));

        CacheConfigSet::set_config_name("");
    }
}
