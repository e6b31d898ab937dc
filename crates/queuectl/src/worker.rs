use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::config;
use crate::exec;
use crate::jobs::JobsRepo;

/// The polling loop: acquire, execute, log, transition. Runs until the
/// shutdown flag flips; an in-flight job always drains before the loop
/// exits. Job-level failures feed the retry state machine and never stop
/// the loop; only a store error does.
pub async fn run_worker(
    pool: SqlitePool,
    worker_id: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let repo = JobsRepo::new(pool.clone());
    let poll_interval =
        Duration::from_millis(config::get_i64(&pool, "poll_interval_ms").await?.max(0) as u64);
    let timeout_secs = config::get_i64(&pool, "timeout_seconds").await?;

    tracing::info!(worker_id, "worker started");

    while !*shutdown.borrow() {
        let Some(job) = repo.acquire_next_job(worker_id).await? else {
            // Idle: sleep the poll interval, waking early on shutdown.
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };

        tracing::info!(worker_id, job_id = %job.id, command = %job.command, "executing");
        let output = exec::run_command(&job.command, timeout_secs).await;
        repo.log_execution(&job.id, output.exit_code, &output.stdout, &output.stderr)
            .await?;

        if output.exit_code == 0 {
            if !repo.complete_job(&job.id, worker_id).await? {
                tracing::warn!(worker_id, job_id = %job.id, "lease lost, dropping completion");
            }
        } else {
            let last_error = if output.stderr.is_empty() {
                format!("exit {}", output.exit_code)
            } else {
                output.stderr.clone()
            };
            if !repo.fail_job(&job, worker_id, &last_error).await? {
                tracing::warn!(worker_id, job_id = %job.id, "lease lost, dropping failure");
            } else {
                tracing::info!(
                    worker_id,
                    job_id = %job.id,
                    exit_code = output.exit_code,
                    "attempt failed"
                );
            }
        }
    }

    tracing::info!(worker_id, "worker stopped");
    Ok(())
}

/// Entry point for a worker process: pid-derived worker id, signal handlers
/// flipping a per-worker stop flag, then the loop. SIGTERM and SIGINT both
/// mean drain-then-exit.
pub async fn worker_main(pool: SqlitePool) -> anyhow::Result<()> {
    let worker_id = format!("pid-{}", std::process::id());
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    run_worker(pool, &worker_id, stop_rx).await
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
