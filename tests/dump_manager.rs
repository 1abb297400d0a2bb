//! Dump manager scenarios over a real temporary directory.
//!
//! Directories are pre-populated with a fixed set of dump files, tmp
//! leftovers, and unrelated junk; file contents equal their names so reads
//! can be asserted too.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use time::OffsetDateTime;
use time::macros::datetime;

use rinfresco::{DumpConfig, DumpError, DumpManager};

fn base_time() -> OffsetDateTime {
    datetime!(2015-03-22 09:00:00 UTC)
}

fn initial_file_names() -> Vec<&'static str> {
    vec![
        "2015-03-22T09:00:00.000000-v5",
        "2015-03-22T09:00:00.000000-v0",
        "2015-03-22T09:00:00.000000-v42",
        "2015-03-22T09:00:01.000000-v5",
        "2015-03-22T09:00:02.000000-v5",
        "2015-03-22T09:00:03.000000-v5",
    ]
}

fn junk_file_names() -> Vec<&'static str> {
    vec![
        "2015-03-22T09:00:00.000000-v0.tmp",
        "2015-03-22T09:00:00.000000-v5.tmp",
        "2000-01-01T00:00:00.000000-v42.tmp",
    ]
}

fn unrelated_file_names() -> Vec<&'static str> {
    vec![
        "blah-2015-03-22T09:00:00.000000-v5",
        "blah-2015-03-22T09:00:00.000000-v5.tmp",
        "foo",
        "foo.tmp",
        "2015-03-22T09:00:00.000000-v-5",
        "2015-03-22T09:00:00.000000-v-5.tmp",
        "2015-03-22T09:00:00.000000-5.tmp",
    ]
}

fn create_files(dir: &Path, names: &[&str]) {
    for name in names {
        fs::write(dir.join(name), name).expect("failed to create a fixture file");
    }
}

fn prefill(dir: &Path) {
    create_files(dir, &initial_file_names());
    create_files(dir, &junk_file_names());
    create_files(dir, &unrelated_file_names());
}

fn filenames_in(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .expect("failed to list the dump directory")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn config(dir: &Path, max_dump_age: Option<Duration>, max_dump_count: usize) -> DumpConfig {
    DumpConfig {
        name: "sample".to_string(),
        dump_directory: dir.to_path_buf(),
        world_readable: false,
        dump_format_version: 5,
        max_dump_age,
        max_dump_age_set: true,
        max_dump_count,
    }
}

#[test]
fn cleanup_removes_tmp_files_and_outdated_versions() {
    let dir = TempDir::new().unwrap();
    prefill(dir.path());

    // Everything except tmp junk and the version-0 dump survives; the
    // version-42 dump belongs to a newer release and is left alone.
    let mut expected: BTreeSet<String> = initial_file_names()
        .into_iter()
        .chain(unrelated_file_names())
        .map(str::to_string)
        .collect();
    assert!(expected.remove("2015-03-22T09:00:00.000000-v0"));

    let manager = DumpManager::new(config(dir.path(), None, 10));
    manager.cleanup_at(base_time());

    assert_eq!(filenames_in(dir.path()), expected);
}

#[test]
fn cleanup_removes_dumps_beyond_the_age_limit() {
    let dir = TempDir::new().unwrap();
    prefill(dir.path());

    // 3 s past base time with a 1500 ms limit: only dumps from 09:00:02
    // onwards survive. The age limit applies to every version, including
    // the future-version dump.
    let mut expected: BTreeSet<String> = initial_file_names()
        .into_iter()
        .chain(unrelated_file_names())
        .map(str::to_string)
        .collect();
    assert!(expected.remove("2015-03-22T09:00:00.000000-v0"));
    assert!(expected.remove("2015-03-22T09:00:00.000000-v5"));
    assert!(expected.remove("2015-03-22T09:00:01.000000-v5"));
    assert!(expected.remove("2015-03-22T09:00:00.000000-v42"));

    let manager = DumpManager::new(config(dir.path(), Some(Duration::from_millis(1500)), 10));
    manager.cleanup_at(base_time() + Duration::from_secs(3));

    assert_eq!(filenames_in(dir.path()), expected);
}

#[test]
fn cleanup_keeps_only_the_newest_dumps_up_to_the_count() {
    let dir = TempDir::new().unwrap();
    prefill(dir.path());

    let mut expected: BTreeSet<String> = initial_file_names()
        .into_iter()
        .chain(unrelated_file_names())
        .map(str::to_string)
        .collect();
    assert!(expected.remove("2015-03-22T09:00:00.000000-v0"));
    assert!(expected.remove("2015-03-22T09:00:00.000000-v5"));
    assert!(expected.remove("2015-03-22T09:00:01.000000-v5"));
    assert!(expected.remove("2015-03-22T09:00:02.000000-v5"));

    let manager = DumpManager::new(config(dir.path(), None, 1));
    manager.cleanup_at(base_time());

    assert_eq!(filenames_in(dir.path()), expected);
}

#[test]
fn get_latest_dump_picks_the_newest_current_version() {
    let dir = TempDir::new().unwrap();
    prefill(dir.path());

    let before: BTreeSet<String> = filenames_in(dir.path());

    let manager = DumpManager::new(config(dir.path(), None, 10));
    let stats = manager
        .latest_dump_at(base_time())
        .expect("a usable dump exists");

    assert_eq!(stats.update_time, base_time() + Duration::from_secs(3));
    assert_eq!(stats.format_version, 5);
    assert!(
        stats
            .full_path
            .ends_with("2015-03-22T09:00:03.000000-v5")
    );
    assert_eq!(
        fs::read_to_string(&stats.full_path).unwrap(),
        "2015-03-22T09:00:03.000000-v5"
    );

    // Reading never writes or removes anything.
    assert_eq!(filenames_in(dir.path()), before);
}

#[test]
fn get_latest_dump_ignores_foreign_versions_and_stale_dumps() {
    let dir = TempDir::new().unwrap();
    create_files(
        dir.path(),
        &[
            "2015-03-22T09:00:00.000000-v0",
            "2015-03-22T09:00:00.000000-v42",
        ],
    );

    let manager = DumpManager::new(config(dir.path(), None, 10));
    assert!(manager.latest_dump_at(base_time()).is_none());

    // A current-version dump beyond the age limit is ignored too.
    create_files(dir.path(), &["2015-03-22T09:00:00.000000-v5"]);
    let manager = DumpManager::new(config(dir.path(), Some(Duration::from_secs(1)), 10));
    assert!(
        manager
            .latest_dump_at(base_time() + Duration::from_secs(3))
            .is_none()
    );
}

#[test]
fn get_latest_dump_handles_a_missing_directory() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("never-created");

    let manager = DumpManager::new(config(&missing, None, 10));
    assert!(manager.latest_dump_at(base_time()).is_none());
}

#[test]
fn register_write_and_bump() {
    let dir = TempDir::new().unwrap();

    let manager = DumpManager::new(config(dir.path(), None, 10));

    let old_update_time = base_time();
    let stats = manager.register_new_dump(old_update_time).unwrap();
    assert!(
        stats
            .full_path
            .ends_with("2015-03-22T09:00:00.000000-v5")
    );
    assert_eq!(stats.format_version, 5);

    // Registration only reserves the slot; the caller writes the bytes.
    fs::write(&stats.full_path, "abc").unwrap();

    // A later update fetched identical data: rename instead of rewriting.
    let new_update_time = base_time() + Duration::from_secs(3);
    assert!(manager.bump_dump_time(old_update_time, new_update_time));

    let latest = manager.latest_dump_at(new_update_time).unwrap();
    assert_eq!(latest.update_time, new_update_time);
    assert!(
        latest
            .full_path
            .ends_with("2015-03-22T09:00:03.000000-v5")
    );
    assert_eq!(fs::read_to_string(&latest.full_path).unwrap(), "abc");

    let expected: BTreeSet<String> = ["2015-03-22T09:00:03.000000-v5".to_string()]
        .into_iter()
        .collect();
    assert_eq!(filenames_in(dir.path()), expected);
}

#[test]
fn register_creates_the_directory_and_rejects_collisions() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("deeper").join("dumps");

    let manager = DumpManager::new(config(&nested, None, 10));
    let stats = manager.register_new_dump(base_time()).unwrap();
    assert!(nested.is_dir());

    fs::write(&stats.full_path, "abc").unwrap();

    let err = manager.register_new_dump(base_time()).unwrap_err();
    assert!(matches!(err, DumpError::AlreadyExists { .. }));
}

#[test]
fn bump_of_a_missing_dump_leaves_the_directory_untouched() {
    let dir = TempDir::new().unwrap();
    create_files(dir.path(), &["2015-03-22T09:00:01.000000-v5"]);
    let before = filenames_in(dir.path());

    let manager = DumpManager::new(config(dir.path(), None, 10));
    assert!(!manager.bump_dump_time(base_time(), base_time() + Duration::from_secs(3)));

    assert_eq!(filenames_in(dir.path()), before);
}

#[test]
fn set_config_applies_to_subsequent_operations() {
    let dir = TempDir::new().unwrap();
    create_files(
        dir.path(),
        &[
            "2015-03-22T09:00:00.000000-v5",
            "2015-03-22T09:00:01.000000-v6",
        ],
    );

    let manager = DumpManager::new(config(dir.path(), None, 10));
    let latest = manager.latest_dump_at(base_time()).unwrap();
    assert!(
        latest
            .full_path
            .ends_with("2015-03-22T09:00:00.000000-v5")
    );

    let mut bumped = config(dir.path(), None, 10);
    bumped.dump_format_version = 6;
    manager.set_config(bumped);

    let latest = manager.latest_dump_at(base_time()).unwrap();
    assert!(
        latest
            .full_path
            .ends_with("2015-03-22T09:00:01.000000-v6")
    );
}
