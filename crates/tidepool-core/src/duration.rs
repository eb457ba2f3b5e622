//! Human-readable duration strings (`"250ms"`, `"30s"`, `"5m"`, `"1h"`).

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Parse a duration string with a `ms`, `s`, `m` or `h` suffix.
///
/// A bare integer is read as seconds.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let trimmed = s.trim();
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: s.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty string"));
    }

    // `ms` must be checked before `s` and `m`.
    let (digits, unit_ms) = if let Some(n) = trimmed.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = trimmed.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = trimmed.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (trimmed, 1_000)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid("expected an integer followed by ms, s, m or h"))?;

    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid("value out of range"))
}
