use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuectl::clock;
use queuectl::config;
use queuectl::controller::Controller;
use queuectl::db;
use queuectl::jobs::{Job, JobState, JobsRepo, NewJob};
use queuectl::worker;

#[derive(Debug, Parser)]
#[command(name = "queuectl", version, about = "Persistent multi-worker job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Add a new job to the queue. Provide JSON or use flags.
    Enqueue {
        /// Full job record as JSON: {"command": ..., "id"?, "max_retries"?,
        /// "priority"?, "run_at"?}. Flags override individual fields.
        job_json: Option<String>,
        /// Command to execute.
        #[arg(short, long)]
        command: Option<String>,
        /// Job id (defaults to a fresh UUID).
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        max_retries: Option<i64>,
        #[arg(long)]
        priority: Option<i64>,
        /// ISO UTC time (YYYY-MM-DDTHH:MM:SSZ) before which the job will not run.
        #[arg(long)]
        run_at: Option<String>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Start worker processes.
    WorkerStart {
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Stop worker processes gracefully.
    WorkerStop,
    /// Run one worker loop in this process. Spawned by worker-start.
    #[command(hide = true)]
    WorkerRun {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show job-state counts and active workers.
    Status {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List jobs, optionally filtered by state.
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List dead jobs awaiting intervention.
    DlqList {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Move a dead job back to pending.
    DlqRetry {
        job_id: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show recent execution logs for a job.
    Logs {
        job_id: String,
        #[arg(long, default_value_t = 5)]
        limit: i64,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Get or set tuning keys.
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
enum ConfigCmd {
    Get {
        key: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    Set {
        key: String,
        value: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn resolve_db(db: Option<PathBuf>) -> PathBuf {
    db.unwrap_or_else(db::default_db_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue {
            job_json,
            command,
            id,
            max_retries,
            priority,
            run_at,
            db,
        } => {
            let mut new = match job_json {
                Some(raw) => serde_json::from_str::<NewJob>(&raw).context("invalid job JSON")?,
                None => {
                    let Some(command) = command else {
                        bail!("either JOB_JSON or --command is required");
                    };
                    NewJob {
                        command,
                        ..NewJob::default()
                    }
                }
            };
            if id.is_some() {
                new.id = id;
            }
            if max_retries.is_some() {
                new.max_retries = max_retries;
            }
            if priority.is_some() {
                new.priority = priority;
            }
            if run_at.is_some() {
                new.run_at = run_at;
            }
            if let Some(ts) = &new.run_at {
                clock::parse_ts(ts)?;
            }

            let pool = db::connect(&resolve_db(db)).await?;
            let job = JobsRepo::new(pool).enqueue(new).await?;
            println!("enqueued {} : {}", job.id, job.command);
        }

        Commands::WorkerStart { count, db } => {
            let db_path = resolve_db(db);
            // Open once so a bad path fails here, not in every child.
            db::connect(&db_path).await?;
            let children = Controller::new(Controller::default_dir()).start_workers(count, &db_path)?;
            println!("started {} workers: {:?}", children.len(), children);
        }

        Commands::WorkerStop => {
            if Controller::new(Controller::default_dir()).stop_workers()? {
                println!("sent stop signal to workers and cleaned up pid files");
            } else {
                println!("no controller pid file; nothing to stop");
            }
        }

        Commands::WorkerRun { db } => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "info,sqlx=warn".into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();
            let pool = db::connect(&resolve_db(db)).await?;
            worker::worker_main(pool).await?;
        }

        Commands::Status { db, json } => {
            let db_path = resolve_db(db);
            let pool = db::connect(&db_path).await?;
            let status = JobsRepo::new(pool).status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{:<16}{}", "total", status.total);
                for (state, count) in &status.states {
                    println!("{:<16}{}", state, count);
                }
                println!("{:<16}{}", "active workers", status.active_workers);
                println!("{:<16}{}", "db", db_path.display());
            }
        }

        Commands::List {
            state,
            limit,
            db,
            json,
        } => {
            let state = match state.as_deref() {
                Some(s) => Some(JobState::parse(s).with_context(|| {
                    format!("unknown state {s:?}, expected pending|processing|completed|failed|dead")
                })?),
                None => None,
            };
            let pool = db::connect(&resolve_db(db)).await?;
            let jobs = JobsRepo::new(pool).list_jobs(state, limit).await?;
            print_jobs(&jobs, json)?;
        }

        Commands::DlqList { db, json } => {
            let pool = db::connect(&resolve_db(db)).await?;
            let jobs = JobsRepo::new(pool).dlq_list().await?;
            print_jobs(&jobs, json)?;
        }

        Commands::DlqRetry { job_id, db } => {
            let pool = db::connect(&resolve_db(db)).await?;
            if !JobsRepo::new(pool).dlq_retry(&job_id).await? {
                bail!("job {job_id} is not in the dead-letter queue");
            }
            println!("requeued {job_id}");
        }

        Commands::Logs {
            job_id,
            limit,
            db,
            json,
        } => {
            let pool = db::connect(&resolve_db(db)).await?;
            let logs = JobsRepo::new(pool).get_logs(&job_id, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                for log in &logs {
                    println!(
                        "[{}] {} exit={} stdout={:?} stderr={:?}",
                        log.id,
                        log.created_at,
                        log.exit_code.map_or_else(|| "-".into(), |c| c.to_string()),
                        truncate(log.stdout.as_deref().unwrap_or("")),
                        truncate(log.stderr.as_deref().unwrap_or("")),
                    );
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigCmd::Get { key, db } => {
                let pool = db::connect(&resolve_db(db)).await?;
                let value = config::get(&pool, &key).await?;
                println!("{key} = {value}");
            }
            ConfigCmd::Set { key, value, db } => {
                let pool = db::connect(&resolve_db(db)).await?;
                config::set(&pool, &key, &value).await?;
                println!("set {key} = {value}");
            }
        },

        Commands::Version => {
            println!("queuectl v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn print_jobs(jobs: &[Job], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    for job in jobs {
        print!(
            "{} state={} attempts={}/{} priority={} run_at={} command={:?}",
            job.id,
            job.state,
            job.attempts,
            job.max_retries,
            job.priority,
            job.run_at,
            truncate(&job.command),
        );
        if let Some(err) = &job.last_error {
            print!(" last_error={:?}", truncate(err));
        }
        println!();
    }
    Ok(())
}

fn truncate(s: &str) -> String {
    const MAX: usize = 80;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        s.chars().take(MAX).collect()
    }
}
