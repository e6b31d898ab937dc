use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context};

/// Supervises worker child processes: records PIDs under a working
/// directory, refuses to double-start, forwards SIGTERM on stop.
pub struct Controller {
    dir: PathBuf,
}

impl Controller {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// `./.queuectl` next to wherever the CLI runs.
    pub fn default_dir() -> PathBuf {
        PathBuf::from(".queuectl")
    }

    fn pid_file(&self) -> PathBuf {
        self.dir.join("controller.pid")
    }

    fn children_file(&self) -> PathBuf {
        self.dir.join("children.json")
    }

    /// Spawn `count` worker processes running `worker-run` against `db_path`
    /// and record their PIDs. Hard refusal when a PID file already exists.
    pub fn start_workers(&self, count: u32, db_path: &Path) -> anyhow::Result<Vec<u32>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("cannot create {}", self.dir.display()))?;
        if self.pid_file().exists() {
            bail!(
                "workers already running (pid file {} exists)",
                self.pid_file().display()
            );
        }
        fs::write(self.pid_file(), std::process::id().to_string())?;

        let exe = std::env::current_exe().context("cannot locate own executable")?;
        let mut children = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let child = Command::new(&exe)
                .arg("worker-run")
                .arg("--db")
                .arg(db_path)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .context("failed to spawn worker process")?;
            children.push(child.id());
        }
        fs::write(self.children_file(), serde_json::to_string(&children)?)?;
        Ok(children)
    }

    /// Send SIGTERM to every recorded child and remove the PID files.
    /// Returns false when there was no controller to stop.
    pub fn stop_workers(&self) -> anyhow::Result<bool> {
        if !self.pid_file().exists() {
            return Ok(false);
        }
        let children: Vec<u32> = match fs::read_to_string(self.children_file()) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for pid in children {
            terminate(pid);
        }
        let _ = fs::remove_file(self.pid_file());
        let _ = fs::remove_file(self.children_file());
        Ok(true)
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // ESRCH means the child is already gone.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, %err, "failed to signal worker");
        }
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
