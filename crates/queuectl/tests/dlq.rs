mod common;

use common::{enqueue_with, make_runnable_now, setup_db};
use queuectl::clock;
use queuectl::jobs::{Job, JobsRepo, NewJob};
use sqlx::SqlitePool;

async fn make_dead(pool: &SqlitePool, command: &str) -> Job {
    let repo = JobsRepo::new(pool.clone());
    let job = enqueue_with(
        pool,
        NewJob {
            command: command.to_string(),
            max_retries: Some(0),
            ..NewJob::default()
        },
    )
    .await;
    let leased = repo.acquire_next_job("worker-a").await.unwrap().unwrap();
    assert!(repo.fail_job(&leased, "worker-a", "exit 1").await.unwrap());
    repo.get(&job.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn exhausted_retries_move_job_to_dead() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = enqueue_with(
        &db.pool,
        NewJob {
            command: "exit 1".to_string(),
            max_retries: Some(1),
            ..NewJob::default()
        },
    )
    .await;

    // Attempt 1: within max_retries, goes to failed with a backoff.
    let leased = repo.acquire_next_job("worker-a").await.unwrap().unwrap();
    assert!(repo.fail_job(&leased, "worker-a", "exit 1").await.unwrap());
    let row = repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(row.state, "failed");
    assert_eq!(row.attempts, 1);

    // Attempt 2: exceeds max_retries.
    make_runnable_now(&db.pool, &job.id).await;
    let leased = repo.acquire_next_job("worker-a").await.unwrap().unwrap();
    let run_at_before = leased.run_at.clone();
    assert!(repo.fail_job(&leased, "worker-a", "exit 1").await.unwrap());

    let row = repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(row.state, "dead");
    assert_eq!(row.attempts, 2, "dead implies attempts = max_retries + 1");
    assert_eq!(row.run_at, run_at_before, "dead keeps run_at untouched");
    assert_eq!(row.worker_id, None);
    assert_eq!(row.locked_until, None);
    assert!(row.last_error.is_some());
}

#[tokio::test]
async fn dead_jobs_are_not_eligible() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = make_dead(&db.pool, "exit 1").await;
    make_runnable_now(&db.pool, &job.id).await;
    assert!(repo.acquire_next_job("worker-b").await.unwrap().is_none());
}

#[tokio::test]
async fn dlq_list_orders_most_recent_first() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let older = make_dead(&db.pool, "exit 1").await;
    let newer = make_dead(&db.pool, "exit 2").await;
    sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
        .bind(clock::ts_after_secs(-60))
        .bind(&older.id)
        .execute(&db.pool)
        .await
        .unwrap();

    let dead = repo.dlq_list().await.unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].id, newer.id);
    assert_eq!(dead[1].id, older.id);
}

#[tokio::test]
async fn dlq_retry_revives_exactly_once() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = make_dead(&db.pool, "exit 1").await;

    assert!(repo.dlq_retry(&job.id).await.unwrap());
    let row = repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(row.state, "pending");
    assert_eq!(row.attempts, 0);
    assert_eq!(row.last_error, None);
    assert!(row.run_at <= clock::now_ts(), "revived job is eligible now");

    // Second call: no longer dead, so nothing to do.
    assert!(!repo.dlq_retry(&job.id).await.unwrap());
    let row = repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(row.state, "pending");

    let leased = repo.acquire_next_job("worker-b").await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
}

#[tokio::test]
async fn dlq_retry_ignores_jobs_outside_the_dlq() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = common::enqueue_command(&db.pool, "echo fine").await;
    assert!(!repo.dlq_retry(&job.id).await.unwrap());
    assert!(!repo.dlq_retry("no-such-job").await.unwrap());
}
