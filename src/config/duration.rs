//! Human-readable duration values for declarative config documents.
//!
//! Accepts an unsigned decimal integer with a unit suffix (`us`, `ms`, `s`,
//! `m`, `h`, `d`); a bare integer is interpreted as seconds.

use std::time::Duration;

use super::ConfigError;

pub(crate) fn parse_human_duration(input: &str, path: &str) -> Result<Duration, ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::new(path, "duration value is empty"));
    }

    let digits_end = input
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(digits_end);

    let amount: u64 = digits.parse().map_err(|_| {
        ConfigError::new(
            path,
            format!("`{input}` does not start with an unsigned integer"),
        )
    })?;

    match unit {
        "us" => Ok(Duration::from_micros(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "s" | "" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        "d" => Ok(Duration::from_secs(amount * 86400)),
        other => Err(ConfigError::new(
            path,
            format!("unknown duration unit `{other}` in `{input}`"),
        )),
    }
}

/// Parses an optional duration field, falling back to `default` when absent.
pub(crate) fn parse_optional(
    value: Option<&str>,
    path: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(text) => parse_human_duration(text, path),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(
            parse_human_duration("250us", "t").unwrap(),
            Duration::from_micros(250)
        );
        assert_eq!(
            parse_human_duration("1500ms", "t").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            parse_human_duration("1s", "t").unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            parse_human_duration("2m", "t").unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            parse_human_duration("3h", "t").unwrap(),
            Duration::from_secs(10800)
        );
        assert_eq!(
            parse_human_duration("1d", "t").unwrap(),
            Duration::from_secs(86400)
        );
    }

    #[test]
    fn bare_integer_means_seconds() {
        assert_eq!(
            parse_human_duration("42", "t").unwrap(),
            Duration::from_secs(42)
        );
    }

    #[test]
    fn zero_is_allowed() {
        assert_eq!(parse_human_duration("0s", "t").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_human_duration("", "t").is_err());
        assert!(parse_human_duration("fast", "t").is_err());
        assert!(parse_human_duration("10parsecs", "t").is_err());
        assert!(parse_human_duration("-1s", "t").is_err());
        assert!(parse_human_duration("1.5s", "t").is_err());
    }

    #[test]
    fn error_carries_the_config_path() {
        let err = parse_human_duration("oops", "caches.routes.update-interval").unwrap_err();
        assert_eq!(err.path, "caches.routes.update-interval");
    }
}
