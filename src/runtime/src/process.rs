//! Cancellable external processes.
//!
//! Both expensive pipeline steps shell out to an external program. These
//! helpers race the child against the invocation's cancellation token and
//! kill it when the token fires first.

use std::process::{ExitStatus, Output, Stdio};

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Outcome of waiting on a child process.
#[derive(Debug)]
pub enum Completion<T> {
    /// The process ran to completion.
    Finished(T),
    /// The cancellation token fired first and the process was killed.
    Cancelled,
}

/// Run `cmd` to completion with captured stdout and stderr.
pub async fn output(cmd: &mut Command, cancel: &CancellationToken) -> std::io::Result<Completion<Output>> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    tokio::select! {
        result = child.wait_with_output() => result.map(Completion::Finished),
        // Dropping the wait future drops the child, which kills it.
        _ = cancel.cancelled() => Ok(Completion::Cancelled),
    }
}

/// Wait for an already spawned child.
pub async fn wait(child: &mut Child, cancel: &CancellationToken) -> std::io::Result<Completion<ExitStatus>> {
    tokio::select! {
        status = child.wait() => return status.map(Completion::Finished),
        _ = cancel.cancelled() => {}
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill child process");
    }
    Ok(Completion::Cancelled)
}

/// Exit code of a finished process, mapping death by signal to `128 + signal`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Last `max_lines` lines of `bytes`, lossily decoded.
pub fn tail(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
