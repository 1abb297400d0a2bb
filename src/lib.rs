//! Rinfresco periodically refreshes in-memory datasets from authoritative
//! sources and persists snapshots ("dumps") to disk, so a freshly started
//! process restores working state without paying for a cold rebuild.
//!
//! The crate is organised around four cooperating pieces:
//!
//! - [`config`]: static (declarative YAML) and dynamic (runtime JSON) cache
//!   configuration, with cross-field validation.
//! - [`dump`]: the on-disk dump lifecycle: naming, discovery, registration,
//!   time bumping, and cleanup.
//! - [`update`]: the scheduling policy: full vs incremental selection and
//!   jittered deadlines.
//! - [`controller`]: the orchestrator that warms a cache from its latest
//!   dump, drives periodic updates, and writes dumps back out.
//!
//! ## Minimal usage
//!
//! ```ignore
//! let settings = RawCacheSettings::from_yaml_str(yaml)?;
//! let dump_config = DumpConfig::from_settings("routes", &settings, dump_dir)?;
//! let config = CacheConfigStatic::new("routes", &settings, dump_config.as_ref())?;
//! let controller = CacheController::start("routes", config, dump_config, updater).await?;
//! // ... serve traffic, read controller.current() ...
//! controller.stop().await;
//! ```

pub mod config;
pub mod controller;
pub mod dump;
pub mod update;

mod lock;

pub use config::{
    CacheConfig, CacheConfigSet, CacheConfigStatic, ConfigError, LruCacheConfig,
    LruCacheConfigStatic, RawCacheSettings,
};
pub use controller::{CacheController, CachePhase, CacheUpdater, UpdateError, UpdateOutcome};
pub use dump::{DumpConfig, DumpError, DumpFileStats, DumpManager};
pub use update::{AllowedUpdateTypes, FirstUpdateMode, UpdateKind, UpdateScheduler};
