use anyhow::{bail, Context};
use sqlx::SqlitePool;

use crate::clock;
use crate::config;
use crate::jobs::backoff::backoff_seconds;
use crate::jobs::model::{Job, JobLog, JobState, NewJob, QueueStatus};

/// last_error is a short diagnostic, not the full log.
pub const LAST_ERROR_MAX: usize = 512;
/// Per-field clamp on stored execution output.
pub const LOG_TEXT_MAX: usize = 65_535;

#[derive(Clone)]
pub struct JobsRepo {
    pool: SqlitePool,
}

impl JobsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(&self, new: NewJob) -> anyhow::Result<Job> {
        if new.command.is_empty() {
            bail!("job command must not be empty");
        }
        let max_retries = match new.max_retries {
            Some(n) => n,
            None => config::get_i64(&self.pool, "max_retries").await?,
        };
        if max_retries < 0 {
            bail!("max_retries must be non-negative, got {max_retries}");
        }

        let now = clock::now_ts();
        let id = new.id.unwrap_or_else(clock::gen_job_id);
        let run_at = new.run_at.unwrap_or_else(|| now.clone());
        let priority = new.priority.unwrap_or(0);

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries,
                              created_at, updated_at, run_at, priority)
            VALUES (?, ?, 'pending', 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.command)
        .bind(max_retries)
        .bind(&now)
        .bind(&now)
        .bind(&run_at)
        .bind(priority)
        .execute(&self.pool)
        .await;

        if let Err(err) = inserted {
            if let sqlx::Error::Database(db_err) = &err {
                if db_err.is_unique_violation() {
                    bail!("job id already exists: {id}");
                }
            }
            return Err(err).context("enqueue failed");
        }

        self.get(&id)
            .await?
            .context("enqueued job missing on re-read")
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let limit = limit.clamp(1, 500);
        let rows = match state {
            Some(st) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE state = ? ORDER BY created_at ASC LIMIT ?",
                )
                .bind(st.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at ASC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn status(&self) -> anyhow::Result<QueueStatus> {
        let mut states = std::collections::BTreeMap::new();
        for st in JobState::ALL {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
                .bind(st.as_str())
                .fetch_one(&self.pool)
                .await?;
            states.insert(st.as_str().to_string(), count);
        }
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        // Advisory: lags by up to one lease period after a worker crash.
        let active_workers: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT worker_id) FROM jobs
             WHERE worker_id IS NOT NULL AND locked_until > ?",
        )
        .bind(clock::now_ts())
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStatus {
            total,
            states,
            active_workers,
        })
    }

    // ----------------------------
    // Lease acquisition
    // ----------------------------

    /// Lease exactly one eligible job for this worker, or `None` when the
    /// queue has nothing runnable.
    ///
    /// The claim is the guarded UPDATE: it re-asserts the full eligibility
    /// predicate and runs as its own write transaction, so under WAL two
    /// workers serialize on it. Zero affected rows means another worker took
    /// the candidate between SELECT and UPDATE, and the SELECT runs again.
    /// (A SELECT-then-UPDATE inside one deferred transaction would instead
    /// hit SQLITE_BUSY_SNAPSHOT on the lock upgrade.)
    pub async fn acquire_next_job(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        let lease_seconds = config::get_i64(&self.pool, "lease_seconds").await?;

        loop {
            let now = clock::now_ts();
            let locked_until = clock::ts_after_secs(lease_seconds);

            let candidate: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT id FROM jobs
                WHERE state IN ('pending', 'failed')
                  AND run_at <= ?
                  AND (locked_until IS NULL OR locked_until <= ?)
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                "#,
            )
            .bind(&now)
            .bind(&now)
            .fetch_optional(&self.pool)
            .await?;

            let Some((job_id,)) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                r#"
                UPDATE jobs
                   SET state = 'processing',
                       worker_id = ?,
                       locked_until = ?,
                       updated_at = ?
                 WHERE id = ?
                   AND state IN ('pending', 'failed')
                   AND run_at <= ?
                   AND (locked_until IS NULL OR locked_until <= ?)
                "#,
            )
            .bind(worker_id)
            .bind(&locked_until)
            .bind(&now)
            .bind(&job_id)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                tracing::debug!(%job_id, worker_id, "lost lease race, reselecting");
                continue;
            }

            return self.get(&job_id).await;
        }
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Terminal success write, fenced by the lease: a worker whose lease
    /// expired gets `false` back and must drop its result.
    pub async fn complete_job(&self, job_id: &str, worker_id: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
               SET state = 'completed',
                   worker_id = NULL,
                   locked_until = NULL,
                   updated_at = ?
             WHERE id = ? AND state = 'processing' AND worker_id = ?
            "#,
        )
        .bind(clock::now_ts())
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Failure write, fenced the same way. Increments attempts; schedules a
    /// backoff retry while attempts stay within max_retries, otherwise the
    /// job goes to the dead-letter queue with run_at untouched.
    pub async fn fail_job(
        &self,
        job: &Job,
        worker_id: &str,
        last_error: &str,
    ) -> anyhow::Result<bool> {
        let now = clock::now_ts();
        let attempts = job.attempts + 1;
        let last_error = clamp_text(last_error, LAST_ERROR_MAX);

        let (state, run_at) = if attempts > job.max_retries {
            (JobState::Dead, job.run_at.clone())
        } else {
            let base = config::get_i64(&self.pool, "backoff_base").await?;
            let delay = backoff_seconds(base, attempts);
            (JobState::Failed, clock::ts_after_secs(delay))
        };

        let res = sqlx::query(
            r#"
            UPDATE jobs
               SET attempts = ?,
                   state = ?,
                   run_at = ?,
                   worker_id = NULL,
                   locked_until = NULL,
                   updated_at = ?,
                   last_error = ?
             WHERE id = ? AND state = 'processing' AND worker_id = ?
            "#,
        )
        .bind(attempts)
        .bind(state.as_str())
        .bind(&run_at)
        .bind(&now)
        .bind(&last_error)
        .bind(&job.id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // DLQ
    // ----------------------------

    pub async fn dlq_list(&self) -> anyhow::Result<Vec<Job>> {
        let rows =
            sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE state = 'dead' ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Revive a dead job: pending, attempts 0, eligible immediately. Only
    /// rows currently dead are touched; the returned bool reports whether
    /// anything changed, so a second call on the same id returns false.
    pub async fn dlq_retry(&self, job_id: &str) -> anyhow::Result<bool> {
        let now = clock::now_ts();
        let res = sqlx::query(
            r#"
            UPDATE jobs
               SET state = 'pending',
                   attempts = 0,
                   run_at = ?,
                   updated_at = ?,
                   last_error = NULL
             WHERE id = ? AND state = 'dead'
            "#,
        )
        .bind(&now)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    // ----------------------------
    // Execution logs
    // ----------------------------

    pub async fn log_execution(
        &self,
        job_id: &str,
        exit_code: i64,
        stdout: &str,
        stderr: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, created_at, exit_code, stdout, stderr)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(clock::now_ts())
        .bind(exit_code)
        .bind(clamp_text(stdout, LOG_TEXT_MAX))
        .bind(clamp_text(stderr, LOG_TEXT_MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_logs(&self, job_id: &str, limit: i64) -> anyhow::Result<Vec<JobLog>> {
        let rows = sqlx::query_as::<_, JobLog>(
            "SELECT * FROM job_logs WHERE job_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Truncate the tail, backing up to a char boundary.
fn clamp_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
