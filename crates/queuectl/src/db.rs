use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config;

pub const DEFAULT_DB_FILE: &str = "queue.db";

/// `QUEUECTL_DB` when set, otherwise `./queue.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("QUEUECTL_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_FILE))
}

/// Open (creating if missing) the database file and bring the schema up to
/// date. Safe to call from any number of processes concurrently.
pub async fn connect(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Idempotent on every open: create tables if absent, seed config defaults
/// with insert-or-ignore.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT PRIMARY KEY,
            command      TEXT NOT NULL,
            state        TEXT NOT NULL CHECK(state IN
                         ('pending','processing','completed','failed','dead')),
            attempts     INTEGER NOT NULL DEFAULT 0,
            max_retries  INTEGER NOT NULL DEFAULT 3,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            run_at       TEXT NOT NULL,
            priority     INTEGER NOT NULL DEFAULT 0,
            worker_id    TEXT,
            locked_until TEXT,
            last_error   TEXT
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id     TEXT NOT NULL,
            created_at TEXT NOT NULL,
            exit_code  INTEGER,
            stdout     TEXT,
            stderr     TEXT,
            FOREIGN KEY(job_id) REFERENCES jobs(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(state, run_at)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id)")
        .execute(&mut *tx)
        .await?;

    for (key, value) in config::DEFAULTS {
        sqlx::query("INSERT OR IGNORE INTO config(key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
