//! Dump file naming scheme.
//!
//! A finalized dump is named `<timestamp>-v<version>`, an in-progress one
//! carries a `.tmp` suffix. The timestamp is UTC at microsecond precision,
//! fixed-width (`2015-03-22T09:00:00.000000`), so names sort
//! chronologically and parse by slicing.

use std::path::{Path, PathBuf};

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]");

/// Width of the formatted timestamp, `YYYY-MM-DDTHH:MM:SS.uuuuuu`.
const TIMESTAMP_LEN: usize = 26;

const TMP_SUFFIX: &str = ".tmp";

/// Rounds a wall-clock instant to whole microseconds (half-up).
///
/// All timestamps that reach the filesystem, and every comparison against
/// "now", go through this rounding so age checks cannot be off by a
/// sub-microsecond remainder.
pub(crate) fn round_to_micros(time: OffsetDateTime) -> OffsetDateTime {
    let remainder = time.nanosecond() % 1000;
    let delta = if remainder >= 500 {
        i64::from(1000 - remainder)
    } else {
        -i64::from(remainder)
    };
    time + time::Duration::nanoseconds(delta)
}

/// Formats an instant as the fixed-width UTC filename timestamp.
pub(crate) fn format_update_time(time: OffsetDateTime) -> String {
    round_to_micros(time)
        .to_offset(UtcOffset::UTC)
        .format(&TIMESTAMP_FORMAT)
        .expect("fixed UTC timestamp format never fails")
}

/// Full path of the finalized dump for `update_time` under `directory`.
pub(crate) fn dump_path(
    directory: &Path,
    update_time: OffsetDateTime,
    format_version: u64,
) -> PathBuf {
    directory.join(format!(
        "{}-v{format_version}",
        format_update_time(update_time)
    ))
}

/// A successfully parsed finalized dump name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParsedDumpName {
    pub update_time: OffsetDateTime,
    pub format_version: u64,
}

/// Parses a finalized dump filename; `None` for anything else, including
/// tmp files.
pub(crate) fn parse_dump_name(filename: &str) -> Option<ParsedDumpName> {
    let (timestamp, version) = split_name(filename)?;
    let version: u64 = version.parse().ok()?;
    let update_time = PrimitiveDateTime::parse(timestamp, &TIMESTAMP_FORMAT)
        .ok()?
        .assume_utc();
    Some(ParsedDumpName {
        update_time,
        format_version: version,
    })
}

/// True when the filename matches the in-progress (`.tmp`) grammar.
pub(crate) fn is_tmp_dump_name(filename: &str) -> bool {
    filename
        .strip_suffix(TMP_SUFFIX)
        .and_then(split_name)
        .is_some_and(|(timestamp, _)| {
            PrimitiveDateTime::parse(timestamp, &TIMESTAMP_FORMAT).is_ok()
        })
}

/// Splits `<timestamp>-v<digits>` into its parts without validating the
/// timestamp contents.
fn split_name(filename: &str) -> Option<(&str, &str)> {
    if !filename.is_char_boundary(TIMESTAMP_LEN) || filename.len() <= TIMESTAMP_LEN {
        return None;
    }
    let (timestamp, rest) = filename.split_at(TIMESTAMP_LEN);
    let version = rest.strip_prefix("-v")?;
    if version.is_empty() || !version.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some((timestamp, version))
}
