//! External executable runner.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::transition::JobContext;
use crate::jobs::model::{Failure, FailureReason, ServerConfig};
use crate::jobs::runnable::ExecutableJob;
use serde_json::{Map, Value};

pub const STDOUT_FILE: &str = "stdout.log";
pub const STDERR_FILE: &str = "stderr.log";

/// Write the input files and run the job's command in its working directory.
///
/// stdout and stderr go to files in the working directory and are kept on
/// failure. A cancellation request seen in the index terminates the whole
/// process group.
pub async fn run_executable(
    ctx: &JobContext,
    job: Arc<dyn ExecutableJob>,
    input: &Map<String, Value>,
    server: &ServerConfig,
    working_directory: &Path,
) -> std::result::Result<(), Failure> {
    tokio::fs::create_dir_all(working_directory).await.map_err(|e| {
        Failure::new(
            FailureReason::WriteInputFailed,
            format!("cannot create {}: {}", working_directory.display(), e),
        )
    })?;

    let writer = Arc::clone(&job);
    let input = input.clone();
    let wd = working_directory.to_path_buf();
    tokio::task::spawn_blocking(move || writer.write_input(&input, &wd))
        .await
        .map_err(|e| Failure::new(FailureReason::Panicked, format!("write_input panicked: {}", e)))?
        .map_err(|e| Failure::new(FailureReason::WriteInputFailed, format!("{:#}", e)))?;

    let command_line = job
        .command(server)
        .map_err(|e| Failure::new(FailureReason::SpawnFailed, e.to_string()))?;

    let stdout = std::fs::File::create(working_directory.join(STDOUT_FILE))
        .map_err(|e| Failure::new(FailureReason::SpawnFailed, format!("cannot create stdout file: {}", e)))?;
    let stderr = std::fs::File::create(working_directory.join(STDERR_FILE))
        .map_err(|e| Failure::new(FailureReason::SpawnFailed, format!("cannot create stderr file: {}", e)))?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&command_line)
        .current_dir(working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .env("JOBRACK_CORES", server.cores.to_string())
        .env("JOBRACK_THREADS", server.threads.to_string())
        .env("JOBRACK_GPUS", server.gpus.unwrap_or(0).to_string())
        .env("JOBRACK_JOB_ID", ctx.job_id.to_string())
        .env("JOBRACK_WORKING_DIRECTORY", working_directory)
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    info!(job_id = ctx.job_id, job_name = %ctx.job_name, cmd = %command_line, "Starting external command");
    let mut child = cmd.spawn().map_err(|e| {
        Failure::new(
            FailureReason::SpawnFailed,
            format!("failed to spawn '{}': {}", command_line, e),
        )
    })?;

    let status = match wait_or_cancel(ctx, &mut child).await {
        Ok(Some(status)) => status,
        Ok(None) => return Err(Failure::cancelled()),
        Err(e) => {
            return Err(Failure::new(
                FailureReason::Internal,
                format!("waiting for external command: {}", e),
            ))
        }
    };

    let code = status.code().unwrap_or(-1);
    info!(job_id = ctx.job_id, exit_code = code, success = status.success(), "External command exited");
    if status.code().map(|c| server.accepts_exit_code(c)).unwrap_or(false) {
        return Ok(());
    }

    let tail_bytes = ctx.system.config().execution.stderr_tail_bytes;
    let tail = read_tail(&working_directory.join(STDERR_FILE), tail_bytes);
    let message = match status.code() {
        Some(c) => format!("command exited with code {}", c),
        None => "command was terminated by a signal".to_string(),
    };
    let mut failure = Failure::new(FailureReason::NonZeroExit, message).with_exit_code(code);
    if let Some(tail) = tail {
        failure = failure.with_stderr_tail(tail);
    }
    Err(failure)
}

/// Wait for the child, polling the cancellation flag. `None` means the child
/// was cancelled and terminated.
async fn wait_or_cancel(ctx: &JobContext, child: &mut Child) -> std::io::Result<Option<ExitStatus>> {
    let execution = &ctx.system.config().execution;
    loop {
        tokio::select! {
            status = child.wait() => return status.map(Some),
            _ = tokio::time::sleep(execution.cancel_poll_interval) => {
                match ctx.cancel_requested().await {
                    Ok(true) => {
                        info!(job_id = ctx.job_id, "Cancellation requested, terminating external command");
                        terminate(child, execution.kill_grace_period).await;
                        return Ok(None);
                    }
                    Ok(false) => {}
                    Err(e) => debug!(job_id = ctx.job_id, "Cancel check failed: {}", e),
                }
            }
        }
    }
}

/// SIGTERM the process group, then SIGKILL after the grace period
async fn terminate(child: &mut Child, grace: std::time::Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                debug!(pid, "SIGTERM to process group failed: {}", e);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(group, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    if let Err(e) = child.kill().await {
        warn!("Failed to kill external command: {}", e);
    }
}

/// Last `max_bytes` of a file, lossily decoded
pub fn read_tail(path: &Path, max_bytes: usize) -> Option<String> {
    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let start = len.saturating_sub(max_bytes as u64);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).ok()?;
    if buf.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stderr.log");
        std::fs::write(&path, "first line\nsecond line\n").unwrap();
        assert_eq!(read_tail(&path, 12).unwrap(), "second line\n");
        assert_eq!(read_tail(&path, 1000).unwrap(), "first line\nsecond line\n");

        std::fs::write(&path, "").unwrap();
        assert!(read_tail(&path, 10).is_none());
        assert!(read_tail(&dir.path().join("missing"), 10).is_none());
    }
}
