//! Update scheduling policy.
//!
//! Decides when the next update fires and whether it is full or incremental.
//! Deadlines are computed on the monotonic clock and perturbed by a bounded
//! random jitter so that a fleet of processes does not refresh in lockstep.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::CacheConfigStatic;

/// What an update is allowed to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Replaces the cache state entirely.
    Full,
    /// Applies a delta since the last update.
    Incremental,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::Full => "full",
            UpdateKind::Incremental => "incremental",
        }
    }
}

/// Which update kinds a cache performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedUpdateTypes {
    FullAndIncremental,
    OnlyFull,
    OnlyIncremental,
}

impl FromStr for AllowedUpdateTypes {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "full-and-incremental" => Ok(Self::FullAndIncremental),
            "only-full" => Ok(Self::OnlyFull),
            "only-incremental" => Ok(Self::OnlyIncremental),
            other => Err(format!("invalid update types `{other}`")),
        }
    }
}

/// Whether the first update must succeed before the cache is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstUpdateMode {
    /// An update must succeed before readiness.
    Required,
    /// Attempt one update; tolerate failure if a fresh-enough dump (or no
    /// dump requirement) covers for it.
    BestEffort,
    /// No update is required before readiness.
    Skip,
}

impl FromStr for FirstUpdateMode {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "required" => Ok(Self::Required),
            "best-effort" => Ok(Self::BestEffort),
            "skip" => Ok(Self::Skip),
            other => Err(format!("invalid first update mode `{other}`")),
        }
    }
}

/// Computes update deadlines from a config snapshot.
///
/// The scheduler is immutable; the controller rebuilds it whenever the
/// config is replaced, so every deadline is computed against one consistent
/// snapshot.
#[derive(Debug, Clone)]
pub struct UpdateScheduler {
    allowed_update_types: AllowedUpdateTypes,
    update_interval: Duration,
    full_update_interval: Duration,
    update_jitter: Duration,
    force_periodic_update: bool,
}

impl UpdateScheduler {
    pub fn new(config: &CacheConfigStatic) -> Self {
        Self {
            allowed_update_types: config.allowed_update_types,
            update_interval: config.config.update_interval,
            full_update_interval: config.config.full_update_interval,
            update_jitter: config.config.update_jitter,
            force_periodic_update: config.force_periodic_update.unwrap_or(false),
        }
    }

    /// Picks the kind of the next update and its deadline.
    ///
    /// `last_full` is when the last full update finished, `last_any` when any
    /// update last finished. The deadline is `last_any` plus the base
    /// interval for the chosen kind, perturbed by a uniform jitter in
    /// `[-update_jitter, +update_jitter]` and clamped to at least one
    /// microsecond of progress.
    pub fn next_update(
        &self,
        now: Instant,
        last_full: Instant,
        last_any: Instant,
    ) -> (UpdateKind, Instant) {
        let (kind, base) = match self.allowed_update_types {
            AllowedUpdateTypes::OnlyFull => (UpdateKind::Full, self.full_update_interval),
            AllowedUpdateTypes::OnlyIncremental => {
                (UpdateKind::Incremental, self.update_interval)
            }
            AllowedUpdateTypes::FullAndIncremental => {
                if now.duration_since(last_full) >= self.full_update_interval {
                    (UpdateKind::Full, self.full_update_interval)
                } else {
                    (UpdateKind::Incremental, self.update_interval)
                }
            }
        };

        // The testsuite escape hatch fires on every tick.
        if self.force_periodic_update {
            return (kind, now);
        }

        (kind, last_any + self.jittered(base))
    }

    /// The kind of the very first update after startup: full, unless a dump
    /// provided a reconciliation base and incremental updates are allowed.
    pub fn first_update_kind(&self, loaded_from_dump: bool) -> UpdateKind {
        if loaded_from_dump && self.allowed_update_types != AllowedUpdateTypes::OnlyFull {
            UpdateKind::Incremental
        } else {
            UpdateKind::Full
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter_us = self.update_jitter.as_micros() as i64;
        if jitter_us == 0 {
            return base;
        }
        let base_us = base.as_micros() as i64;
        let offset = rand::rng().random_range(-jitter_us..=jitter_us);
        Duration::from_micros((base_us + offset).max(1) as u64)
    }
}
