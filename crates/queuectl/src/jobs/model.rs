use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: String,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: String,
    pub updated_at: String,
    pub run_at: String,
    pub priority: i64,
    pub worker_id: Option<String>,
    pub locked_until: Option<String>,
    pub last_error: Option<String>,
}

/// Partial job record accepted by enqueue; every `None` gets a default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewJob {
    pub command: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub run_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

/// One row per execution attempt, append-only.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: String,
    pub created_at: String,
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub total: i64,
    pub states: BTreeMap<String, i64>,
    pub active_workers: i64,
}
