use sqlx::SqlitePool;
use tempfile::TempDir;

use queuectl::db;
use queuectl::jobs::{Job, JobsRepo, NewJob};

/// Each test gets its own database file; the tempdir lives as long as the
/// pool does.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn setup_db() -> TestDb {
    let dir = TempDir::new().expect("tempdir");
    let pool = db::connect(&dir.path().join("queue.db"))
        .await
        .expect("failed to open test database");
    TestDb { pool, _dir: dir }
}

#[allow(dead_code)]
pub async fn enqueue_command(pool: &SqlitePool, command: &str) -> Job {
    enqueue_with(
        pool,
        NewJob {
            command: command.to_string(),
            ..NewJob::default()
        },
    )
    .await
}

#[allow(dead_code)]
pub async fn enqueue_with(pool: &SqlitePool, new: NewJob) -> Job {
    JobsRepo::new(pool.clone())
        .enqueue(new)
        .await
        .expect("enqueue failed")
}

#[allow(dead_code)]
pub async fn set_config(pool: &SqlitePool, key: &str, value: &str) {
    queuectl::config::set(pool, key, value)
        .await
        .expect("config set failed");
}

/// Shift a job's created_at into the past to get deterministic FIFO order
/// despite second-resolution timestamps.
#[allow(dead_code)]
pub async fn backdate_created_at(pool: &SqlitePool, job_id: &str, secs_ago: i64) {
    sqlx::query("UPDATE jobs SET created_at = ? WHERE id = ?")
        .bind(queuectl::clock::ts_after_secs(-secs_ago))
        .bind(job_id)
        .execute(pool)
        .await
        .expect("backdate created_at failed");
}

/// Force a job runnable now, skipping a pending backoff delay.
#[allow(dead_code)]
pub async fn make_runnable_now(pool: &SqlitePool, job_id: &str) {
    sqlx::query("UPDATE jobs SET run_at = ? WHERE id = ?")
        .bind(queuectl::clock::ts_after_secs(-1))
        .bind(job_id)
        .execute(pool)
        .await
        .expect("make_runnable_now failed");
}
