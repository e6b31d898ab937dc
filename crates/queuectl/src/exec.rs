use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Reserved exit code for a command killed by the timeout.
pub const EXIT_TIMEOUT: i64 = 124;
/// Reserved exit code when the command cannot be launched at all.
pub const EXIT_NOT_FOUND: i64 = 127;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn launch_failure(exit_code: i64, err: impl std::fmt::Display) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }
}

/// Incrementally drained pipe. The buffer is shared so that whatever was
/// read before a timeout kill is still recoverable.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut reader| {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.lock().unwrap().extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Wait for EOF, but only up to `grace`: a killed shell can leave
    /// grandchildren holding the pipe open indefinitely.
    async fn finish(mut self, grace: Duration) -> String {
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                // Reader still blocked on an open pipe; keep what we have.
                abort.abort();
            }
        }
        let bytes = self.buf.lock().unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Run a command string through the shell, bounded by `timeout_secs`.
///
/// A non-zero exit from the command is ordinary output, not an error. The
/// reserved mappings: 124 when the timeout kills the command (stderr gets a
/// TIMEOUT marker, partial output is kept), 127 when the shell itself cannot
/// be found, 1 for any other launch failure. A missing command *inside* the
/// shell already comes back as the shell's own 127.
pub async fn run_command(cmd: &str, timeout_secs: i64) -> CommandOutput {
    let mut command = shell_command(cmd);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return CommandOutput::launch_failure(EXIT_NOT_FOUND, err);
        }
        Err(err) => return CommandOutput::launch_failure(1, err),
    };

    // Drain both pipes concurrently so a chatty command cannot deadlock on a
    // full pipe buffer while we wait on it.
    let stdout = PipeReader::spawn(child.stdout.take());
    let stderr = PipeReader::spawn(child.stderr.take());

    let timeout = Duration::from_secs(timeout_secs.max(0) as u64);
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => CommandOutput {
            exit_code: status.code().unwrap_or(1) as i64,
            stdout: stdout.finish(Duration::from_secs(5)).await,
            stderr: stderr.finish(Duration::from_secs(5)).await,
        },
        Ok(Err(err)) => CommandOutput::launch_failure(1, err),
        Err(_) => {
            let _ = child.kill().await;
            let mut err_text = stderr.finish(Duration::from_millis(250)).await;
            err_text.push_str("\nTIMEOUT");
            CommandOutput {
                exit_code: EXIT_TIMEOUT,
                stdout: stdout.finish(Duration::from_millis(250)).await,
                stderr: err_text,
            }
        }
    }
}

#[cfg(unix)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

#[cfg(windows)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}
