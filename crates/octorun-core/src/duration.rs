//! Human-readable durations used in octorun.toml (`"250ms"`, `"30s"`, `"5m"`, `"1h"`).

use std::time::Duration;

use anyhow::{Context, bail};

/// Parse a duration string. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let (digits, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    let millis = value
        .checked_mul(unit_ms)
        .with_context(|| format!("duration {s:?} overflows"))?;
    Ok(Duration::from_millis(millis))
}
