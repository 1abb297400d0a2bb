//! Validated dump configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, RawCacheSettings, RawMaxAge, parse_human_duration};

const DEFAULT_MAX_DUMP_COUNT: usize = 1;

/// Dump settings of one cache, validated and ready for the manager.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Cache identifier, used only for logging.
    pub name: String,
    pub dump_directory: PathBuf,
    /// Whether finalized dumps should be readable by other users.
    pub world_readable: bool,
    pub dump_format_version: u64,
    /// `None` means no age limit.
    pub max_dump_age: Option<Duration>,
    /// Whether `max-age` was present in the document at all; `max-age: null`
    /// sets this while leaving `max_dump_age` empty.
    pub max_dump_age_set: bool,
    pub max_dump_count: usize,
}

impl DumpConfig {
    /// Builds the dump configuration from the `dump:` section of the
    /// declarative settings.
    ///
    /// Returns `Ok(None)` when the section is absent or `enable` is false.
    pub fn from_settings(
        name: &str,
        settings: &RawCacheSettings,
        dump_directory: impl Into<PathBuf>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(raw) = settings.dump.as_ref() else {
            return Ok(None);
        };
        if !raw.enable.unwrap_or(false) {
            return Ok(None);
        }

        let (max_dump_age, max_dump_age_set) = match &raw.max_age {
            RawMaxAge::Unset => (None, false),
            RawMaxAge::Unlimited => (None, true),
            RawMaxAge::Limited(text) => {
                let age = parse_human_duration(text, "dump.max-age")?;
                if age.is_zero() {
                    return Err(ConfigError::new(
                        "dump.max-age",
                        format!("max dump age must be positive for cache `{name}`"),
                    ));
                }
                (Some(age), true)
            }
        };

        let max_dump_count = raw.max_count.unwrap_or(DEFAULT_MAX_DUMP_COUNT as u64);
        if max_dump_count == 0 {
            return Err(ConfigError::new(
                "dump.max-count",
                format!("at least one dump must be kept for cache `{name}`"),
            ));
        }

        Ok(Some(Self {
            name: name.to_string(),
            dump_directory: dump_directory.into(),
            world_readable: raw.world_readable.unwrap_or(false),
            dump_format_version: raw.format_version.unwrap_or(0),
            max_dump_age,
            max_dump_age_set,
            max_dump_count: max_dump_count as usize,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from_yaml(yaml: &str) -> RawCacheSettings {
        RawCacheSettings::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn absent_or_disabled_section_means_no_dumps() {
        let settings = settings_from_yaml("update-interval: 1s\n");
        assert!(
            DumpConfig::from_settings("routes", &settings, "/tmp/dumps")
                .unwrap()
                .is_none()
        );

        let settings = settings_from_yaml(
            "update-interval: 1s\ndump:\n    enable: false\n    format-version: 5\n",
        );
        assert!(
            DumpConfig::from_settings("routes", &settings, "/tmp/dumps")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn parses_an_enabled_section() {
        let settings = settings_from_yaml(
            r#"
update-interval: 1s
dump:
    enable: true
    world-readable: true
    format-version: 5
    first-update-mode: skip
    max-count: 10
    max-age: 1500ms
"#,
        );

        let config = DumpConfig::from_settings("routes", &settings, "/var/cache/routes")
            .unwrap()
            .unwrap();
        assert_eq!(config.name, "routes");
        assert_eq!(config.dump_directory, PathBuf::from("/var/cache/routes"));
        assert!(config.world_readable);
        assert_eq!(config.dump_format_version, 5);
        assert_eq!(config.max_dump_age, Some(Duration::from_millis(1500)));
        assert!(config.max_dump_age_set);
        assert_eq!(config.max_dump_count, 10);
    }

    #[test]
    fn max_age_tri_state() {
        // Absent: not set at all.
        let raw = RawCacheSettings {
            dump: Some(crate::config::RawDumpSettings {
                enable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = DumpConfig::from_settings("c", &raw, "/d").unwrap().unwrap();
        assert!(!config.max_dump_age_set);
        assert!(config.max_dump_age.is_none());

        // Explicit null: set, unlimited. serde_json's null exercises the
        // same visitor path a YAML `max-age: null` takes.
        let max_age: RawMaxAge = serde_json::from_value(serde_json::Value::Null).unwrap();
        assert_eq!(max_age, RawMaxAge::Unlimited);

        let raw = RawCacheSettings {
            dump: Some(crate::config::RawDumpSettings {
                enable: Some(true),
                max_age,
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = DumpConfig::from_settings("c", &raw, "/d").unwrap().unwrap();
        assert!(config.max_dump_age_set);
        assert!(config.max_dump_age.is_none());

        // A concrete limit.
        let max_age: RawMaxAge = serde_json::from_value(serde_json::json!("30s")).unwrap();
        assert_eq!(max_age, RawMaxAge::Limited("30s".to_string()));
    }

    #[test]
    fn zero_max_count_is_rejected() {
        let raw = RawCacheSettings {
            dump: Some(crate::config::RawDumpSettings {
                enable: Some(true),
                max_count: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = DumpConfig::from_settings("c", &raw, "/d").unwrap_err();
        assert_eq!(err.path, "dump.max-count");
    }

    #[test]
    fn max_count_defaults_to_one() {
        let raw = RawCacheSettings {
            dump: Some(crate::config::RawDumpSettings {
                enable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = DumpConfig::from_settings("c", &raw, "/d").unwrap().unwrap();
        assert_eq!(config.max_dump_count, 1);
    }
}
