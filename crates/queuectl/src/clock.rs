use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use uuid::Uuid;

/// Every persisted instant uses this format: UTC, second resolution.
/// Strings in this format order lexicographically the same way they order
/// chronologically, so SQL comparisons never need to parse them.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

pub fn ts_after_secs(secs: i64) -> String {
    format_ts(Utc::now() + Duration::seconds(secs))
}

pub fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .with_context(|| format!("invalid timestamp {s:?}, expected YYYY-MM-DDTHH:MM:SSZ"))?;
    Ok(naive.and_utc())
}

pub fn gen_job_id() -> String {
    Uuid::new_v4().to_string()
}
