mod common;

use common::{enqueue_command, enqueue_with, make_runnable_now, set_config, setup_db};
use queuectl::clock;
use queuectl::jobs::{JobsRepo, NewJob};

#[tokio::test]
async fn future_run_at_gates_acquisition() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = enqueue_with(
        &db.pool,
        NewJob {
            command: "echo later".to_string(),
            run_at: Some(clock::ts_after_secs(60)),
            ..NewJob::default()
        },
    )
    .await;

    assert!(repo.acquire_next_job("worker-a").await.unwrap().is_none());

    make_runnable_now(&db.pool, &job.id).await;
    let leased = repo.acquire_next_job("worker-a").await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
}

#[tokio::test]
async fn enqueue_fills_defaults() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = enqueue_command(&db.pool, "echo defaults").await;
    let row = repo.get(&job.id).await.unwrap().unwrap();

    assert_eq!(row.state, "pending");
    assert_eq!(row.attempts, 0);
    assert_eq!(row.max_retries, 3, "seeded config default");
    assert_eq!(row.priority, 0);
    assert_eq!(row.created_at, row.updated_at);
    assert_eq!(row.run_at, row.created_at);
    assert_eq!(row.worker_id, None);
    assert_eq!(row.locked_until, None);
    assert_eq!(row.last_error, None);
    clock::parse_ts(&row.created_at).expect("created_at must be in the fixed format");
}

#[tokio::test]
async fn enqueue_honors_configured_default_max_retries() {
    let db = setup_db().await;
    set_config(&db.pool, "max_retries", "7").await;

    let job = enqueue_command(&db.pool, "echo tuned").await;
    assert_eq!(job.max_retries, 7);

    // An explicit value still wins over the configured default.
    let explicit = enqueue_with(
        &db.pool,
        NewJob {
            command: "echo explicit".to_string(),
            max_retries: Some(1),
            ..NewJob::default()
        },
    )
    .await;
    assert_eq!(explicit.max_retries, 1);
}

#[tokio::test]
async fn enqueue_rejects_duplicate_ids() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let job = enqueue_with(
        &db.pool,
        NewJob {
            command: "echo one".to_string(),
            id: Some("fixed-id".to_string()),
            ..NewJob::default()
        },
    )
    .await;
    assert_eq!(job.id, "fixed-id");

    let err = repo
        .enqueue(NewJob {
            command: "echo two".to_string(),
            id: Some("fixed-id".to_string()),
            ..NewJob::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn enqueue_rejects_empty_commands() {
    let db = setup_db().await;
    let repo = JobsRepo::new(db.pool.clone());

    let err = repo.enqueue(NewJob::default()).await.unwrap_err();
    assert!(err.to_string().contains("command"));
}
