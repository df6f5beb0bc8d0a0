use anyhow::{Context, Result};
use chrono::NaiveDateTime;

/// Layout of the `utctime` field of a log line.
pub const LOG_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

pub fn parse_log_time(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), LOG_TIME_FORMAT)
        .with_context(|| format!("bad log timestamp {:?}", raw))
}

/// Whole seconds from `first` to `last`; negative when `last` is earlier.
pub fn seconds_between(first: &str, last: &str) -> Result<i64> {
    let first = parse_log_time(first)?;
    let last = parse_log_time(last)?;
    Ok((last - first).num_seconds())
}
