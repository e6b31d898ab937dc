use anyhow::{bail, Context};
use sqlx::SqlitePool;

/// The recognized tuning keys and the values seeded at schema creation.
pub const DEFAULTS: [(&str, &str); 5] = [
    ("max_retries", "3"),
    ("backoff_base", "2"),
    ("lease_seconds", "60"),
    ("poll_interval_ms", "500"),
    ("timeout_seconds", "300"),
];

pub fn is_known_key(key: &str) -> bool {
    DEFAULTS.iter().any(|(k, _)| *k == key)
}

pub async fn get(pool: &SqlitePool, key: &str) -> anyhow::Result<String> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    match row {
        Some((value,)) => Ok(value),
        None => bail!("config key not found: {key}"),
    }
}

pub async fn get_i64(pool: &SqlitePool, key: &str) -> anyhow::Result<i64> {
    let raw = get(pool, key).await?;
    raw.parse()
        .with_context(|| format!("config key {key} holds non-integer value {raw:?}"))
}

/// Upsert a tuning key. Keys outside [`DEFAULTS`] are rejected.
pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> anyhow::Result<()> {
    if !is_known_key(key) {
        bail!(
            "unknown config key: {key} (known keys: {})",
            DEFAULTS.map(|(k, _)| k).join(", ")
        );
    }
    sqlx::query(
        "INSERT INTO config(key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
