//! Cache controller.
//!
//! Orchestrates the other pieces: warms a cache from its latest dump, runs
//! the first update per the configured policy, then drives periodic updates
//! on the schedule computed by [`UpdateScheduler`], persisting dumps after
//! each successful update and cleaning the dump directory once per cleanup
//! interval.

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{CacheConfig, CacheConfigSet, CacheConfigStatic};
use crate::dump::{DumpConfig, DumpError, DumpManager, round_to_micros};
use crate::lock;
use crate::update::{AllowedUpdateTypes, FirstUpdateMode, UpdateKind, UpdateScheduler};

const METRIC_UPDATES_OK: &str = "rinfresco_updates_succeeded_total";
const METRIC_UPDATES_FAILED: &str = "rinfresco_updates_failed_total";
const METRIC_DUMPS_WRITTEN: &str = "rinfresco_dumps_written_total";
const METRIC_DUMPS_BUMPED: &str = "rinfresco_dumps_bumped_total";

/// An update failure reported by cache-specific user code.
#[derive(Debug, Error)]
#[error("cache update failed: {message}")]
pub struct UpdateError {
    pub message: String,
}

impl UpdateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What an update produced.
#[derive(Debug)]
pub enum UpdateOutcome<S> {
    /// New content; the controller stores it and writes a dump.
    Changed(S),
    /// The source returned identical content; the existing dump is bumped to
    /// the new update time instead of being rewritten.
    Unchanged,
}

/// Cache-specific user code: fetches updates and codes the state to bytes.
#[async_trait]
pub trait CacheUpdater: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    /// Fetches a full snapshot or applies a delta on top of `prev`.
    async fn update(
        &self,
        kind: UpdateKind,
        prev: Option<&Self::State>,
    ) -> Result<UpdateOutcome<Self::State>, UpdateError>;

    /// Encodes the state for a dump file.
    fn serialize(&self, state: &Self::State) -> Vec<u8>;

    /// Decodes a dump file back into a state.
    fn deserialize(&self, bytes: &[u8]) -> Result<Self::State, UpdateError>;
}

/// Observable lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Cold,
    Warming,
    Ready,
    Updating,
    Stopping,
    Stopped,
}

/// Drives one cache: owns its state, its dump manager, and the background
/// update task.
///
/// At most one update is in flight at any time; the controller is the mutex.
/// Dropping the controller aborts the background task; [`Self::stop`] shuts
/// it down gracefully, letting an in-flight update finish.
pub struct CacheController<U: CacheUpdater> {
    inner: Arc<Inner<U>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct DumpResources {
    manager: Arc<DumpManager>,
    world_readable: bool,
}

struct Inner<U: CacheUpdater> {
    name: String,
    updater: U,
    config: RwLock<Arc<CacheConfigStatic>>,
    dump: Option<DumpResources>,
    state: RwLock<Option<Arc<U::State>>>,
    phase: RwLock<CachePhase>,
    shutdown: Notify,
    kick: Notify,
}

/// Mutable bookkeeping of the update loop, owned by the single update turn.
struct TurnState {
    last_full: Instant,
    last_any: Instant,
    last_cleanup: Instant,
    /// Update time of the dump currently on disk, if any.
    last_dump_time: Option<OffsetDateTime>,
    /// Armed when an only-incremental cache booted from a dump and must run
    /// one full update right after its first incremental one.
    resync_armed: bool,
    pending_full_resync: bool,
    resync_immediate: bool,
}

impl<U: CacheUpdater> CacheController<U> {
    /// Warms the cache (dump load plus first update per policy) and spawns
    /// the periodic update task.
    ///
    /// Fails only when the first update both fails and is required by
    /// `first_update_mode` with no `first-update-fail-ok` escape hatch.
    pub async fn start(
        name: impl Into<String>,
        config: CacheConfigStatic,
        dump_config: Option<DumpConfig>,
        updater: U,
    ) -> Result<Self, UpdateError> {
        let name = name.into();
        let dump = dump_config.map(|config| DumpResources {
            world_readable: config.world_readable,
            manager: Arc::new(DumpManager::new(config)),
        });

        let inner = Arc::new(Inner {
            name,
            updater,
            config: RwLock::new(Arc::new(config)),
            dump,
            state: RwLock::new(None),
            phase: RwLock::new(CachePhase::Cold),
            shutdown: Notify::new(),
            kick: Notify::new(),
        });

        inner.set_phase(CachePhase::Warming);
        let turn = inner.bootstrap().await?;
        inner.set_phase(CachePhase::Ready);

        let handle = tokio::spawn(run_loop(inner.clone(), turn));

        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The cache state as of the last completed update or dump load.
    pub fn current(&self) -> Option<Arc<U::State>> {
        lock::rw_read(&self.inner.state, &self.inner.name, "current").clone()
    }

    pub fn phase(&self) -> CachePhase {
        *lock::rw_read(&self.inner.phase, &self.inner.name, "phase")
    }

    /// Requests an update ahead of schedule. Returns immediately; the update
    /// runs on the background task.
    pub fn trigger_update(&self) {
        self.inner.kick.notify_one();
    }

    /// Replaces the base intervals with dynamically distributed values.
    ///
    /// A no-op (logged at DEBUG) when the cache was configured with
    /// `config-settings: false`. The next update turn observes the merged
    /// config; the turn in flight keeps its snapshot.
    pub fn set_dynamic_config(&self, dynamic: CacheConfig) {
        let config = self.inner.config_snapshot();
        if !config.config_updates_enabled {
            debug!(
                cache_name = %self.inner.name,
                "Ignoring dynamic config: config updates are disabled for this cache"
            );
            return;
        }

        let merged = config.merge_with(dynamic);
        *lock::rw_write(&self.inner.config, &self.inner.name, "set_dynamic_config") =
            Arc::new(merged);
        info!(cache_name = %self.inner.name, "Applied dynamic cache config");
    }

    /// Applies the entry for this cache from a freshly rebuilt config set,
    /// if one was distributed.
    pub fn apply_config_set(&self, set: &CacheConfigSet) {
        if let Some(dynamic) = set.get_config(&self.inner.name) {
            self.set_dynamic_config(dynamic);
        }
    }

    /// Gracefully stops the update task. An in-flight update finishes and
    /// its result is kept; no new updates start.
    pub async fn stop(&self) {
        self.inner.set_phase(CachePhase::Stopping);
        self.inner.shutdown.notify_one();

        let handle = lock::mutex_lock(&self.handle, &self.inner.name, "stop").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!(
                        cache_name = %self.inner.name,
                        error = %err,
                        "Cache update task terminated abnormally"
                    );
                }
            }
        }
        self.inner.set_phase(CachePhase::Stopped);
    }
}

impl<U: CacheUpdater> Drop for CacheController<U> {
    fn drop(&mut self) {
        if let Some(handle) = lock::mutex_lock(&self.handle, &self.inner.name, "drop").take() {
            handle.abort();
        }
    }
}

impl<U: CacheUpdater> Inner<U> {
    fn config_snapshot(&self) -> Arc<CacheConfigStatic> {
        lock::rw_read(&self.config, &self.name, "config_snapshot").clone()
    }

    fn set_phase(&self, phase: CachePhase) {
        *lock::rw_write(&self.phase, &self.name, "set_phase") = phase;
    }

    fn current_state(&self) -> Option<Arc<U::State>> {
        lock::rw_read(&self.state, &self.name, "current_state").clone()
    }

    fn store_state(&self, state: U::State) {
        *lock::rw_write(&self.state, &self.name, "store_state") = Some(Arc::new(state));
    }

    /// Loads the latest usable dump (if any) and runs the first update per
    /// `first_update_mode`. Returns the bookkeeping for the update loop.
    async fn bootstrap(&self) -> Result<TurnState, UpdateError> {
        let config = self.config_snapshot();

        let loaded_dump = self.load_latest_dump().await;
        let loaded_from_dump = loaded_dump.is_some();

        let now = Instant::now();
        let mut turn = TurnState {
            last_full: now,
            last_any: now,
            last_cleanup: now,
            last_dump_time: loaded_dump,
            resync_armed: loaded_from_dump
                && config.allowed_update_types == AllowedUpdateTypes::OnlyIncremental
                && config.force_full_second_update,
            pending_full_resync: false,
            resync_immediate: false,
        };

        let first_update_needed = match config.first_update_mode {
            FirstUpdateMode::Skip => !loaded_from_dump,
            FirstUpdateMode::BestEffort | FirstUpdateMode::Required => true,
        };
        if !first_update_needed {
            info!(
                cache_name = %self.name,
                "Started from a dump, first update deferred to the regular schedule"
            );
            return Ok(turn);
        }

        let scheduler = UpdateScheduler::new(&config);
        let kind = scheduler.first_update_kind(loaded_from_dump);
        match self.update_turn(kind, &mut turn).await {
            Ok(()) => {
                info!(cache_name = %self.name, update_kind = kind.as_str(), "First update succeeded");
            }
            Err(err) => {
                let tolerated = config.allow_first_update_failure
                    || config.first_update_mode != FirstUpdateMode::Required;
                if !tolerated {
                    error!(
                        cache_name = %self.name,
                        error = %err,
                        "First update failed and is required; refusing to start"
                    );
                    return Err(err);
                }
                warn!(
                    cache_name = %self.name,
                    error = %err,
                    loaded_from_dump,
                    "First update failed; proceeding with the state at hand"
                );
            }
        }

        Ok(turn)
    }

    /// Fetches and deserializes the latest usable dump. Freshness is already
    /// enforced by the manager's `max_dump_age` filter. Returns the dump's
    /// update time when the state was restored.
    async fn load_latest_dump(&self) -> Option<OffsetDateTime> {
        let dump = self.dump.as_ref()?;

        let manager = dump.manager.clone();
        let stats = match tokio::task::spawn_blocking(move || manager.get_latest_dump()).await {
            Ok(stats) => stats?,
            Err(err) => {
                error!(cache_name = %self.name, error = %err, "Dump discovery task failed");
                return None;
            }
        };

        let bytes = match tokio::fs::read(&stats.full_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    cache_name = %self.name,
                    path = %stats.full_path.display(),
                    error = %err,
                    "Failed to read the latest dump, proceeding without it"
                );
                return None;
            }
        };

        match self.updater.deserialize(&bytes) {
            Ok(state) => {
                info!(
                    cache_name = %self.name,
                    path = %stats.full_path.display(),
                    "Restored cache state from a dump"
                );
                self.store_state(state);
                Some(stats.update_time)
            }
            Err(err) => {
                warn!(
                    cache_name = %self.name,
                    path = %stats.full_path.display(),
                    error = %err,
                    "Failed to deserialize the latest dump, proceeding without it"
                );
                None
            }
        }
    }

    /// One full update turn: run the user update, persist the dump, and
    /// clean the dump directory when the cleanup interval elapsed.
    async fn update_turn(&self, kind: UpdateKind, turn: &mut TurnState) -> Result<(), UpdateError> {
        let prev = self.current_state();
        let result = self.updater.update(kind, prev.as_deref()).await;

        let now = Instant::now();
        turn.last_any = now;

        match result {
            Ok(outcome) => {
                counter!(METRIC_UPDATES_OK, "cache" => self.name.clone()).increment(1);
                if kind == UpdateKind::Full {
                    turn.last_full = now;
                    turn.pending_full_resync = false;
                    turn.resync_immediate = false;
                } else if turn.resync_armed {
                    turn.resync_armed = false;
                    turn.pending_full_resync = true;
                    turn.resync_immediate = true;
                    info!(
                        cache_name = %self.name,
                        "Scheduling one full update to converge the dump-restored state"
                    );
                }

                let changed = match outcome {
                    UpdateOutcome::Changed(state) => {
                        self.store_state(state);
                        true
                    }
                    UpdateOutcome::Unchanged => false,
                };
                self.persist(changed, turn).await;
                self.maybe_cleanup(turn).await;
                Ok(())
            }
            Err(err) => {
                counter!(METRIC_UPDATES_FAILED, "cache" => self.name.clone()).increment(1);
                self.maybe_cleanup(turn).await;
                Err(err)
            }
        }
    }

    /// Persists the update result: a changed state is written as a new dump;
    /// identical content bumps the existing dump's timestamp. A failed bump
    /// falls back to writing the dump anew.
    async fn persist(&self, changed: bool, turn: &mut TurnState) {
        let Some(dump) = self.dump.as_ref() else {
            return;
        };
        let update_time = round_to_micros(OffsetDateTime::now_utc());

        if !changed {
            if let Some(previous) = turn.last_dump_time {
                let manager = dump.manager.clone();
                let bumped = tokio::task::spawn_blocking(move || {
                    manager.bump_dump_time(previous, update_time)
                })
                .await
                .unwrap_or(false);
                if bumped {
                    counter!(METRIC_DUMPS_BUMPED, "cache" => self.name.clone()).increment(1);
                    turn.last_dump_time = Some(update_time);
                    return;
                }
            }
        }

        if let Some(written) = self.write_dump(dump, update_time).await {
            turn.last_dump_time = Some(written);
        }
    }

    /// Writes the current state through the tmp-then-rename protocol into
    /// the slot reserved by the dump manager.
    async fn write_dump(
        &self,
        dump: &DumpResources,
        update_time: OffsetDateTime,
    ) -> Option<OffsetDateTime> {
        let state = self.current_state()?;
        let bytes = self.updater.serialize(&state);

        let manager = dump.manager.clone();
        let stats = match tokio::task::spawn_blocking(move || manager.register_new_dump(update_time))
            .await
        {
            Ok(Ok(stats)) => stats,
            Ok(Err(DumpError::AlreadyExists { path, .. })) => {
                // Two updates within one microsecond; the slot already holds
                // equally fresh content.
                debug!(
                    cache_name = %self.name,
                    path = %path.display(),
                    "Dump slot already taken, skipping the write"
                );
                return None;
            }
            Ok(Err(err)) => {
                error!(cache_name = %self.name, error = %err, "Failed to reserve a dump slot");
                return None;
            }
            Err(err) => {
                error!(cache_name = %self.name, error = %err, "Dump registration task failed");
                return None;
            }
        };

        let mut tmp_path = stats.full_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_path);

        if let Err(err) = tokio::fs::write(&tmp_path, &bytes).await {
            error!(
                cache_name = %self.name,
                path = %tmp_path.display(),
                error = %err,
                "Failed to write the dump"
            );
            return None;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if dump.world_readable { 0o644 } else { 0o600 };
            if let Err(err) =
                tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode)).await
            {
                warn!(
                    cache_name = %self.name,
                    path = %tmp_path.display(),
                    error = %err,
                    "Failed to set dump file permissions"
                );
            }
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &stats.full_path).await {
            error!(
                cache_name = %self.name,
                from = %tmp_path.display(),
                to = %stats.full_path.display(),
                error = %err,
                "Failed to finalize the dump"
            );
            return None;
        }

        counter!(METRIC_DUMPS_WRITTEN, "cache" => self.name.clone()).increment(1);
        info!(
            cache_name = %self.name,
            path = %stats.full_path.display(),
            bytes = bytes.len(),
            "Dump written"
        );
        Some(stats.update_time)
    }

    /// Runs dump cleanup when the cleanup interval elapsed. Runs on the
    /// blocking pool and is awaited, so it never overlaps a registration
    /// from this cache's single update turn.
    async fn maybe_cleanup(&self, turn: &mut TurnState) {
        let Some(dump) = self.dump.as_ref() else {
            return;
        };
        let cleanup_interval = self.config_snapshot().config.cleanup_interval;
        let now = Instant::now();
        if now.duration_since(turn.last_cleanup) < cleanup_interval {
            return;
        }
        turn.last_cleanup = now;

        let manager = dump.manager.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || manager.cleanup()).await {
            error!(cache_name = %self.name, error = %err, "Dump cleanup task failed");
        }
    }
}

async fn run_loop<U: CacheUpdater>(inner: Arc<Inner<U>>, mut turn: TurnState) {
    loop {
        let config = inner.config_snapshot();
        let scheduler = UpdateScheduler::new(&config);

        let now = Instant::now();
        let (scheduled_kind, scheduled_deadline) =
            scheduler.next_update(now, turn.last_full, turn.last_any);
        let (kind, deadline) = if turn.pending_full_resync {
            let deadline = if turn.resync_immediate {
                now
            } else {
                scheduled_deadline
            };
            (UpdateKind::Full, deadline)
        } else {
            (scheduled_kind, scheduled_deadline)
        };
        turn.resync_immediate = false;

        tokio::select! {
            biased;
            _ = inner.shutdown.notified() => break,
            _ = inner.kick.notified() => {
                debug!(cache_name = %inner.name, "Update triggered ahead of schedule");
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }

        inner.set_phase(CachePhase::Updating);
        let result = inner.update_turn(kind, &mut turn).await;
        inner.set_phase(CachePhase::Ready);

        if let Err(err) = result {
            warn!(
                cache_name = %inner.name,
                update_kind = kind.as_str(),
                error = %err,
                "Periodic update failed, will retry on the next tick"
            );
        }
    }

    inner.set_phase(CachePhase::Stopped);
}
