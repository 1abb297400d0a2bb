//! Dump file bookkeeping.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::{fs, io};

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::lock;

use super::config::DumpConfig;
use super::filename::{self, ParsedDumpName};

/// Descriptor of one finalized dump file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFileStats {
    pub update_time: OffsetDateTime,
    pub full_path: PathBuf,
    pub format_version: u64,
}

/// Errors from [`DumpManager::register_new_dump`]; every other operation is
/// best-effort and logs instead of failing.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("dump file `{path}` already exists for cache `{cache_name}`")]
    AlreadyExists { cache_name: String, path: PathBuf },
    #[error("failed to create dump directory for cache `{cache_name}` at `{path}`: {source}")]
    CreateDirectory {
        cache_name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Manages the dump files of one cache on disk: naming, discovery of the
/// latest usable dump, slot reservation for new dumps, time bumping, and
/// cleanup.
///
/// Every operation is blocking filesystem I/O; async callers must run them
/// under `tokio::task::spawn_blocking`. All operations except [`Self::cleanup`]
/// may be called concurrently; `cleanup` must not overlap a
/// [`Self::register_new_dump`] for the same instance.
pub struct DumpManager {
    name: String,
    config: RwLock<Arc<DumpConfig>>,
}

impl DumpManager {
    pub fn new(config: DumpConfig) -> Self {
        Self {
            name: config.name.clone(),
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Atomically replaces the config used by subsequent operations;
    /// in-flight operations keep their snapshot.
    pub fn set_config(&self, config: DumpConfig) {
        *lock::rw_write(&self.config, &self.name, "set_config") = Arc::new(config);
    }

    /// Reserves the path for a new dump with the given update time.
    ///
    /// The file itself is not created; the caller writes a `.tmp` companion
    /// and renames it over the returned path. The dump directory is created
    /// if missing.
    pub fn register_new_dump(
        &self,
        update_time: OffsetDateTime,
    ) -> Result<DumpFileStats, DumpError> {
        let config = self.config_snapshot("register_new_dump");
        let update_time = filename::round_to_micros(update_time);
        let path = filename::dump_path(
            &config.dump_directory,
            update_time,
            config.dump_format_version,
        );

        if path.exists() {
            return Err(DumpError::AlreadyExists {
                cache_name: self.name.clone(),
                path,
            });
        }

        fs::create_dir_all(&config.dump_directory).map_err(|source| {
            DumpError::CreateDirectory {
                cache_name: self.name.clone(),
                path: config.dump_directory.clone(),
                source,
            }
        })?;

        Ok(DumpFileStats {
            update_time,
            full_path: path,
            format_version: config.dump_format_version,
        })
    }

    /// Finds the latest dump with the current format version that is fresh
    /// enough per `max_dump_age`.
    ///
    /// Filesystem errors are logged and swallowed; the best candidate found
    /// so far is still returned.
    pub fn get_latest_dump(&self) -> Option<DumpFileStats> {
        self.latest_dump_at(OffsetDateTime::now_utc())
    }

    /// [`Self::get_latest_dump`] against an explicit "now", for tests and
    /// callers that already hold a timestamp.
    pub fn latest_dump_at(&self, now: OffsetDateTime) -> Option<DumpFileStats> {
        let config = self.config_snapshot("get_latest_dump");
        let min_update_time = min_acceptable_update_time(&config, now);

        let entries = match fs::read_dir(&config.dump_directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    cache_name = %self.name,
                    directory = %config.dump_directory.display(),
                    "Dump directory does not exist"
                );
                return None;
            }
            Err(err) => {
                error!(
                    cache_name = %self.name,
                    directory = %config.dump_directory.display(),
                    error = %err,
                    "Failed to scan the dump directory"
                );
                return None;
            }
        };

        let mut best: Option<DumpFileStats> = None;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!(
                        cache_name = %self.name,
                        directory = %config.dump_directory.display(),
                        error = %err,
                        "Error while scanning the dump directory"
                    );
                    break;
                }
            };
            if !is_regular_file(&entry) {
                continue;
            }

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    "Unrelated file in the dump directory"
                );
                continue;
            };

            let Some(parsed) = filename::parse_dump_name(file_name) else {
                if filename::is_tmp_dump_name(file_name) {
                    debug!(
                        cache_name = %self.name,
                        path = %entry.path().display(),
                        "A leftover tmp file found; it will be removed on the next cleanup"
                    );
                } else {
                    warn!(
                        cache_name = %self.name,
                        path = %entry.path().display(),
                        "Unrelated file in the dump directory"
                    );
                }
                continue;
            };

            if parsed.format_version != config.dump_format_version {
                debug!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    dump_version = parsed.format_version,
                    current_version = config.dump_format_version,
                    "Ignoring a dump with a different format version"
                );
                continue;
            }

            if min_update_time.is_some_and(|min| parsed.update_time < min) {
                debug!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    "Ignoring a dump older than the maximum allowed dump age"
                );
                continue;
            }

            let candidate = DumpFileStats {
                update_time: parsed.update_time,
                full_path: entry.path(),
                format_version: parsed.format_version,
            };
            // Ties on update_time break by path so directory order cannot
            // change the winner.
            let is_better = best.as_ref().is_none_or(|best| {
                candidate.update_time > best.update_time
                    || (candidate.update_time == best.update_time
                        && candidate.full_path > best.full_path)
            });
            if is_better {
                best = Some(candidate);
            }
        }

        match &best {
            Some(stats) => debug!(
                cache_name = %self.name,
                path = %stats.full_path.display(),
                "A usable dump found"
            ),
            None => info!(cache_name = %self.name, "No usable dumps found"),
        }

        best
    }

    /// Renames the dump for `old_update_time` to advertise `new_update_time`
    /// without rewriting its contents.
    ///
    /// Returns `false` (after logging) when the old dump is missing or the
    /// rename fails; the caller should then write a fresh dump.
    pub fn bump_dump_time(
        &self,
        old_update_time: OffsetDateTime,
        new_update_time: OffsetDateTime,
    ) -> bool {
        debug_assert!(old_update_time <= new_update_time);
        let config = self.config_snapshot("bump_dump_time");

        let old_path = filename::dump_path(
            &config.dump_directory,
            old_update_time,
            config.dump_format_version,
        );
        let new_path = filename::dump_path(
            &config.dump_directory,
            new_update_time,
            config.dump_format_version,
        );

        let is_file = fs::metadata(&old_path)
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            warn!(
                cache_name = %self.name,
                path = %old_path.display(),
                "The previous dump has disappeared; a new dump will be created"
            );
            return false;
        }

        match fs::rename(&old_path, &new_path) {
            Ok(()) => {
                info!(
                    cache_name = %self.name,
                    from = %old_path.display(),
                    to = %new_path.display(),
                    "Renamed the dump to a newer update time"
                );
                true
            }
            Err(err) => {
                error!(
                    cache_name = %self.name,
                    from = %old_path.display(),
                    to = %new_path.display(),
                    error = %err,
                    "Failed to rename the dump"
                );
                false
            }
        }
    }

    /// Removes tmp leftovers, dumps with an outdated format version, dumps
    /// older than `max_dump_age`, and current-version dumps beyond
    /// `max_dump_count` (newest kept).
    ///
    /// Dumps with a format version *newer* than the current one are left in
    /// place (they belong to a newer release during a rolling downgrade) but
    /// are never returned by [`Self::get_latest_dump`]. Unrelated files are
    /// preserved. Errors are logged, never propagated.
    pub fn cleanup(&self) {
        self.cleanup_at(OffsetDateTime::now_utc());
    }

    /// [`Self::cleanup`] against an explicit "now".
    pub fn cleanup_at(&self, now: OffsetDateTime) {
        let config = self.config_snapshot("cleanup");
        let min_update_time = min_acceptable_update_time(&config, now);

        let entries = match fs::read_dir(&config.dump_directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(
                    cache_name = %self.name,
                    directory = %config.dump_directory.display(),
                    "Dump directory does not exist, nothing to clean up"
                );
                return;
            }
            Err(err) => {
                error!(
                    cache_name = %self.name,
                    directory = %config.dump_directory.display(),
                    error = %err,
                    "Failed to scan the dump directory for cleanup"
                );
                return;
            }
        };

        let mut current_dumps: Vec<(ParsedDumpName, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!(
                        cache_name = %self.name,
                        directory = %config.dump_directory.display(),
                        error = %err,
                        "Error while scanning the dump directory for cleanup"
                    );
                    break;
                }
            };
            if !is_regular_file(&entry) {
                continue;
            }

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    "Unrelated file in the dump directory"
                );
                continue;
            };

            if filename::is_tmp_dump_name(file_name) {
                debug!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    "Removing a leftover tmp file"
                );
                self.remove_file(&entry.path());
                continue;
            }

            let Some(parsed) = filename::parse_dump_name(file_name) else {
                warn!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    "Unrelated file in the dump directory"
                );
                continue;
            };

            let outdated_version = parsed.format_version < config.dump_format_version;
            let expired = min_update_time.is_some_and(|min| parsed.update_time < min);
            if outdated_version || expired {
                debug!(
                    cache_name = %self.name,
                    path = %entry.path().display(),
                    "Removing an expired dump"
                );
                self.remove_file(&entry.path());
                continue;
            }

            if parsed.format_version == config.dump_format_version {
                current_dumps.push((parsed, entry.path()));
            }
        }

        current_dumps.sort_by(|(a, a_path), (b, b_path)| {
            b.update_time
                .cmp(&a.update_time)
                .then_with(|| b_path.cmp(a_path))
        });

        for (_, path) in current_dumps.iter().skip(config.max_dump_count) {
            debug!(
                cache_name = %self.name,
                path = %path.display(),
                "Removing an excessive dump"
            );
            self.remove_file(path);
        }
    }

    fn remove_file(&self, path: &std::path::Path) {
        if let Err(err) = fs::remove_file(path) {
            error!(
                cache_name = %self.name,
                path = %path.display(),
                error = %err,
                "Failed to remove a file during dump cleanup"
            );
        }
    }

    fn config_snapshot(&self, op: &'static str) -> Arc<DumpConfig> {
        lock::rw_read(&self.config, &self.name, op).clone()
    }
}

/// The oldest update time still accepted, when an age limit is configured.
/// "Now" is rounded the same way stored timestamps are, so the comparison
/// cannot drift by a sub-microsecond remainder.
fn min_acceptable_update_time(config: &DumpConfig, now: OffsetDateTime) -> Option<OffsetDateTime> {
    config
        .max_dump_age
        .map(|max_age| filename::round_to_micros(now) - max_age)
}

fn is_regular_file(entry: &fs::DirEntry) -> bool {
    entry
        .file_type()
        .map(|file_type| file_type.is_file())
        .unwrap_or(false)
}
