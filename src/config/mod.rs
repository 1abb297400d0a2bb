//! Cache configuration: declarative (static) and runtime (dynamic) shapes.
//!
//! A cache is configured twice. At startup it reads a human-authored YAML
//! document with human-readable durations (`update-interval: 1s`). At runtime
//! it may receive overrides from a dynamic config distribution, a JSON shape
//! whose time fields are explicit millisecond integers (`update-interval-ms`).
//! Both shapes funnel into the same validated types.

use std::fmt;
use std::time::Duration;

use config::{Config, File, FileFormat};
use serde::Deserialize;
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing::warn;

use crate::update::{AllowedUpdateTypes, FirstUpdateMode};

mod duration;
mod registry;


pub use registry::CacheConfigSet;

pub(crate) use duration::parse_human_duration;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// `update_jitter` defaults to a tenth of the update interval.
fn default_jitter(interval: Duration) -> Duration {
    interval / 10
}

/// A configuration error, fatal at startup.
#[derive(Debug, Error)]
#[error("invalid cache config at `{path}`: {message}")]
pub struct ConfigError {
    /// Dotted key path of the offending field, e.g. `dump.first-update-mode`.
    pub path: String,
    pub message: String,
}

impl ConfigError {
    pub(crate) fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Raw declarative cache settings, as deserialized from a YAML document.
///
/// Duration fields stay unparsed strings here; unit handling and cross-field
/// validation happen in [`CacheConfig::from_static`] and
/// [`CacheConfigStatic::new`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawCacheSettings {
    pub update_interval: Option<String>,
    pub update_jitter: Option<String>,
    pub full_update_interval: Option<String>,
    pub additional_cleanup_interval: Option<String>,
    pub first_update_fail_ok: Option<bool>,
    pub update_types: Option<String>,
    pub testsuite_force_periodic_update: Option<bool>,
    pub config_settings: Option<bool>,
    pub dump: Option<RawDumpSettings>,
}

impl RawCacheSettings {
    /// Loads raw settings from a YAML document string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| ConfigError::new("", err.to_string()))
    }
}

/// Raw `dump:` subsection of the declarative settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawDumpSettings {
    pub enable: Option<bool>,
    pub world_readable: Option<bool>,
    pub format_version: Option<u64>,
    pub first_update_mode: Option<String>,
    pub force_full_second_update: Option<bool>,
    pub max_count: Option<u64>,
    pub max_age: RawMaxAge,
}

/// The `max-age` field distinguishes three shapes: absent, explicit `null`
/// ("outdated data is not harmful"), and a concrete duration limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RawMaxAge {
    /// The key is absent from the document.
    #[default]
    Unset,
    /// The key is present with a `null` value: no age limit, explicitly.
    Unlimited,
    /// The key carries a duration limit, still unparsed.
    Limited(String),
}

impl<'de> Deserialize<'de> for RawMaxAge {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MaxAgeVisitor;

        impl<'de> Visitor<'de> for MaxAgeVisitor {
            type Value = RawMaxAge;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string or null")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(RawMaxAge::Unlimited)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(RawMaxAge::Unlimited)
            }

            fn visit_some<D2: Deserializer<'de>>(
                self,
                deserializer: D2,
            ) -> Result<Self::Value, D2::Error> {
                deserializer.deserialize_any(MaxAgeVisitor)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Ok(RawMaxAge::Limited(value.to_string()))
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<Self::Value, E> {
                Ok(RawMaxAge::Limited(value))
            }
        }

        deserializer.deserialize_any(MaxAgeVisitor)
    }
}

/// Base scheduling intervals of a cache, shared by the static and dynamic
/// shapes. Zero means "unset".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub update_interval: Duration,
    pub update_jitter: Duration,
    pub full_update_interval: Duration,
    pub cleanup_interval: Duration,
}

impl CacheConfig {
    /// Builds the base intervals from a declarative document.
    ///
    /// Defaults: intervals are unset (zero), jitter is a tenth of
    /// `update-interval`, cleanup runs every 10 s. A jitter larger than the
    /// update interval falls back to the default jitter.
    pub fn from_static(settings: &RawCacheSettings) -> Result<Self, ConfigError> {
        let update_interval = duration::parse_optional(
            settings.update_interval.as_deref(),
            "update-interval",
            Duration::ZERO,
        )?;
        let mut update_jitter = duration::parse_optional(
            settings.update_jitter.as_deref(),
            "update-jitter",
            default_jitter(update_interval),
        )?;
        let full_update_interval = duration::parse_optional(
            settings.full_update_interval.as_deref(),
            "full-update-interval",
            Duration::ZERO,
        )?;
        let cleanup_interval = duration::parse_optional(
            settings.additional_cleanup_interval.as_deref(),
            "additional-cleanup-interval",
            DEFAULT_CLEANUP_INTERVAL,
        )?;

        if update_jitter > update_interval {
            update_jitter = default_jitter(update_interval);
        }

        Ok(Self {
            update_interval,
            update_jitter,
            full_update_interval,
            cleanup_interval,
        })
    }

    /// Builds the base intervals from a dynamic-config JSON entry.
    ///
    /// Time fields are integer milliseconds under `*-ms` keys. At least one
    /// of the two update intervals must be set; a missing one is copied from
    /// the other.
    pub fn from_dynamic(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let mut update_interval = parse_ms(value, "update-interval-ms", Duration::ZERO)?;
        let mut full_update_interval = parse_ms(value, "full-update-interval-ms", Duration::ZERO)?;
        let cleanup_interval = parse_ms(
            value,
            "additional-cleanup-interval-ms",
            DEFAULT_CLEANUP_INTERVAL,
        )?;

        if update_interval.is_zero() && full_update_interval.is_zero() {
            return Err(ConfigError::new(
                "update-interval-ms",
                "update interval is not set for cache",
            ));
        } else if full_update_interval.is_zero() {
            full_update_interval = update_interval;
        } else if update_interval.is_zero() {
            update_interval = full_update_interval;
        }

        let mut update_jitter =
            parse_ms(value, "update-jitter-ms", default_jitter(update_interval))?;
        if update_jitter > update_interval {
            update_jitter = default_jitter(update_interval);
        }

        Ok(Self {
            update_interval,
            update_jitter,
            full_update_interval,
            cleanup_interval,
        })
    }
}

fn parse_ms(
    value: &serde_json::Value,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(field) => field.as_u64().map(Duration::from_millis).ok_or_else(|| {
            ConfigError::new(key, format!("expected integer milliseconds, got {field}"))
        }),
    }
}

/// Full startup configuration of a cache: base intervals plus the update
/// policy fields that only the declarative document can set.
#[derive(Debug, Clone)]
pub struct CacheConfigStatic {
    pub config: CacheConfig,
    pub allowed_update_types: AllowedUpdateTypes,
    pub allow_first_update_failure: bool,
    pub force_periodic_update: Option<bool>,
    pub config_updates_enabled: bool,
    pub first_update_mode: FirstUpdateMode,
    pub force_full_second_update: bool,
}

impl CacheConfigStatic {
    /// Validates the declarative settings for cache `name` and composes the
    /// full startup configuration.
    ///
    /// `dump` must be the dump configuration built from the same settings,
    /// or `None` when dumps are disabled; the dump-related invariants are
    /// only enforced when dumps are enabled.
    pub fn new(
        name: &str,
        settings: &RawCacheSettings,
        dump: Option<&crate::dump::DumpConfig>,
    ) -> Result<Self, ConfigError> {
        let mut config = CacheConfig::from_static(settings)?;
        let allowed_update_types = parse_update_types(settings)?;

        let raw_dump = settings.dump.as_ref();
        let first_update_mode = match raw_dump.and_then(|d| d.first_update_mode.as_deref()) {
            Some(text) => text
                .parse::<FirstUpdateMode>()
                .map_err(|message| ConfigError::new("dump.first-update-mode", message))?,
            None => FirstUpdateMode::Skip,
        };

        match allowed_update_types {
            AllowedUpdateTypes::FullAndIncremental => {
                if config.update_interval.is_zero() || config.full_update_interval.is_zero() {
                    return Err(ConfigError::new(
                        "update-interval",
                        format!(
                            "both `update-interval` and `full-update-interval` must be set \
                             for cache `{name}`"
                        ),
                    ));
                }
                if config.update_interval >= config.full_update_interval {
                    warn!(
                        cache_name = name,
                        "Incremental updates requested but have lower frequency than full \
                         updates and will never happen; remove `full-update-interval` if \
                         this is intended"
                    );
                }
            }
            AllowedUpdateTypes::OnlyFull | AllowedUpdateTypes::OnlyIncremental => {
                if !config.full_update_interval.is_zero() {
                    return Err(ConfigError::new(
                        "full-update-interval",
                        format!(
                            "`full-update-interval` must only be used with a \
                             full-and-incremental updated cache `{name}`; rename it to \
                             `update-interval`"
                        ),
                    ));
                }
                if config.update_interval.is_zero() {
                    return Err(ConfigError::new(
                        "update-interval",
                        format!("`update-interval` is not set for cache `{name}`"),
                    ));
                }
                config.full_update_interval = config.update_interval;
            }
        }

        if let Some(dump_config) = dump {
            if raw_dump.and_then(|d| d.first_update_mode.as_ref()).is_none() {
                return Err(ConfigError::new(
                    "dump.first-update-mode",
                    format!(
                        "if dumps are enabled, then `dump.first-update-mode` must be set \
                         for cache `{name}`"
                    ),
                ));
            }

            if first_update_mode != FirstUpdateMode::Required && !dump_config.max_dump_age_set {
                return Err(ConfigError::new(
                    "dump.max-age",
                    format!(
                        "if `dump.first-update-mode` is not `required`, then \
                         `dump.max-age` must be set for cache `{name}`; if severely \
                         outdated data is not harmful, set `max-age: null`"
                    ),
                ));
            }

            if allowed_update_types == AllowedUpdateTypes::OnlyIncremental
                && raw_dump.and_then(|d| d.force_full_second_update).is_none()
            {
                return Err(ConfigError::new(
                    "dump.force-full-second-update",
                    format!(
                        "with only-incremental updates and dumps enabled, \
                         `dump.force-full-second-update` must be set for cache `{name}`"
                    ),
                ));
            }
        }

        Ok(Self {
            config,
            allowed_update_types,
            allow_first_update_failure: settings.first_update_fail_ok.unwrap_or(false),
            force_periodic_update: settings.testsuite_force_periodic_update,
            config_updates_enabled: settings.config_settings.unwrap_or(true),
            first_update_mode,
            force_full_second_update: raw_dump
                .and_then(|d| d.force_full_second_update)
                .unwrap_or(false),
        })
    }

    /// Produces a copy whose base intervals are replaced by `dynamic`.
    /// Policy fields are untouched.
    pub fn merge_with(&self, dynamic: CacheConfig) -> CacheConfigStatic {
        CacheConfigStatic {
            config: dynamic,
            ..self.clone()
        }
    }
}

fn parse_update_types(settings: &RawCacheSettings) -> Result<AllowedUpdateTypes, ConfigError> {
    match settings.update_types.as_deref() {
        Some(text) => text
            .parse::<AllowedUpdateTypes>()
            .map_err(|message| ConfigError::new("update-types", message)),
        // A cache that configures both intervals without naming its update
        // types wants both kinds; otherwise assume full updates only.
        None => {
            if settings.update_interval.is_some() && settings.full_update_interval.is_some() {
                Ok(AllowedUpdateTypes::FullAndIncremental)
            } else {
                Ok(AllowedUpdateTypes::OnlyFull)
            }
        }
    }
}

/// Raw declarative settings of an LRU cache section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawLruSettings {
    pub size: Option<u64>,
    pub ways: Option<u64>,
    pub lifetime: Option<String>,
    pub background_update: Option<bool>,
}

impl RawLruSettings {
    /// Loads raw LRU settings from a YAML document string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|err| ConfigError::new("", err.to_string()))
    }
}

/// Whether LRU entries refresh in the background before expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundUpdateMode {
    Enabled,
    Disabled,
}

/// Runtime-adjustable part of an LRU cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruCacheConfig {
    pub size: usize,
    /// Zero means entries never expire.
    pub lifetime: Duration,
    pub background_update: BackgroundUpdateMode,
}

impl LruCacheConfig {
    pub fn from_static(settings: &RawLruSettings) -> Result<Self, ConfigError> {
        let size = settings
            .size
            .ok_or_else(|| ConfigError::new("size", "`size` is not set"))?;
        if size == 0 {
            return Err(ConfigError::new("size", "cache size must be positive"));
        }
        let lifetime =
            duration::parse_optional(settings.lifetime.as_deref(), "lifetime", Duration::ZERO)?;

        Ok(Self {
            size: size as usize,
            lifetime,
            background_update: background_update_mode(settings.background_update),
        })
    }

    pub fn from_dynamic(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let size = value
            .get("size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ConfigError::new("size", "`size` is not set"))?;
        if size == 0 {
            return Err(ConfigError::new("size", "cache size must be positive"));
        }
        let lifetime = parse_ms(value, "lifetime-ms", Duration::ZERO)?;
        let background_update = value
            .get("background-update")
            .and_then(serde_json::Value::as_bool);

        Ok(Self {
            size: size as usize,
            lifetime,
            background_update: background_update_mode(background_update),
        })
    }
}

fn background_update_mode(flag: Option<bool>) -> BackgroundUpdateMode {
    if flag.unwrap_or(false) {
        BackgroundUpdateMode::Enabled
    } else {
        BackgroundUpdateMode::Disabled
    }
}

/// Full startup configuration of an LRU cache.
#[derive(Debug, Clone)]
pub struct LruCacheConfigStatic {
    pub config: LruCacheConfig,
    pub ways: usize,
}

impl LruCacheConfigStatic {
    pub fn new(settings: &RawLruSettings) -> Result<Self, ConfigError> {
        let config = LruCacheConfig::from_static(settings)?;
        let ways = settings
            .ways
            .ok_or_else(|| ConfigError::new("ways", "`ways` is not set"))?;
        if ways == 0 {
            return Err(ConfigError::new("ways", "cache ways must be positive"));
        }

        Ok(Self {
            config,
            ways: ways as usize,
        })
    }

    /// Entries per way; at least 1 even when `size < ways`.
    pub fn way_size(&self) -> usize {
        let way_size = self.config.size / self.ways;
        if way_size == 0 { 1 } else { way_size }
    }

    /// Produces a copy whose runtime-adjustable part is replaced by `dynamic`.
    pub fn merge_with(&self, dynamic: LruCacheConfig) -> LruCacheConfigStatic {
        LruCacheConfigStatic {
            config: dynamic,
            ways: self.ways,
        }
    }
}
