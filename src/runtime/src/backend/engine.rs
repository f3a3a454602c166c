//! Docker-compatible engine CLI backend.
//!
//! Docker and Podman accept the same `load` and `run` invocations, so one
//! backend drives both; only the executable and a few flags differ.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use apko_shell_core::error::{Result, ShellError};
use apko_shell_core::TOOL_NAME;
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, RunRequest, RuntimeBackend, SCRIPT_MOUNT, WORKSPACE_MOUNT};
use crate::process::{self, Completion};

/// Lines of engine output kept in errors.
const ERROR_TAIL_LINES: usize = 10;

/// How long cleanup waits for `<engine> kill`.
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs containers through a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct EngineBackend {
    kind: BackendKind,
    program: String,
    kill_timeout: Duration,
}

impl EngineBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            program: kind.program().to_string(),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// Bound the wait for the engine when killing a cancelled container.
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Use a different executable for this engine.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Load the image tarball and return the reference the engine reports.
    async fn load(&self, image_path: &Path, cancel: &CancellationToken) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("load").arg("-i").arg(image_path);

        let output = match process::output(&mut cmd, cancel)
            .await
            .map_err(|e| run_error(format!("starting {} load: {}", self.program, e)))?
        {
            Completion::Finished(output) => output,
            Completion::Cancelled => return Err(ShellError::Cancelled("image load".to_string())),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        tracing::debug!(backend = %self.kind, output = %combined.trim(), "Image load output");

        if !output.status.success() {
            return Err(run_error(format!(
                "{} load failed with status {}: {}",
                self.program,
                process::exit_code(&output.status),
                process::tail(combined.as_bytes(), ERROR_TAIL_LINES)
            )));
        }

        parse_load_output(&combined).ok_or_else(|| {
            run_error(format!(
                "could not find image reference in {} load output: {}",
                self.program,
                combined.trim()
            ))
        })
    }

    /// Arguments of the `run` invocation.
    fn run_args(
        &self,
        request: &RunRequest,
        image_ref: &str,
        container_name: &str,
        user: Option<(u32, u32)>,
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];

        if request.interactive {
            args.push("-t".to_string());
        }

        if let Some((uid, gid)) = user {
            args.push("--user".to_string());
            args.push(format!("{}:{}", uid, gid));
            if self.kind == BackendKind::Podman {
                // Rootless podman maps the invoking user to root by default.
                args.push("--userns=keep-id".to_string());
            }
        }

        args.push("--name".to_string());
        args.push(container_name.to_string());

        args.push("-v".to_string());
        args.push(format!("{}:{}:rw", absolute(&request.work_dir).display(), WORKSPACE_MOUNT));
        args.push("-w".to_string());
        args.push(WORKSPACE_MOUNT.to_string());

        if let Some(script) = &request.script_path {
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", absolute(script).display(), SCRIPT_MOUNT));
        }

        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(image_ref.to_string());

        if request.script_path.is_some() && !request.interactive {
            args.push(SCRIPT_MOUNT.to_string());
            args.extend(request.script_args.iter().cloned());
        }

        args
    }

    /// Best-effort removal of a container left behind by a cancelled run.
    async fn kill_container(&self, name: &str) {
        let mut cmd = Command::new(&self.program);
        cmd.arg("kill").arg(name);
        // The engine process is killed if the timeout drops it.
        let never_cancel = CancellationToken::new();
        let kill = process::output(&mut cmd, &never_cancel);
        match tokio::time::timeout(self.kill_timeout, kill).await {
            Ok(Ok(Completion::Finished(output))) if output.status.success() => {
                tracing::debug!(container = name, "Killed container");
            }
            Ok(Ok(_)) => tracing::debug!(container = name, "Container already gone"),
            Ok(Err(e)) => tracing::warn!(container = name, error = %e, "Failed to kill container"),
            Err(_) => tracing::warn!(
                container = name,
                timeout = ?self.kill_timeout,
                "Engine did not answer kill in time, giving up"
            ),
        }
    }
}

#[async_trait]
impl RuntimeBackend for EngineBackend {
    fn name(&self) -> &str {
        self.kind.program()
    }

    async fn available(&self) -> bool {
        Command::new(&self.program)
            .args(["version", "--format", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<()> {
        let image_ref = self.load(&request.image_path, cancel).await?;
        tracing::debug!(backend = %self.kind, image = %image_ref, "Loaded image");

        let container_name = container_name();
        let args = self.run_args(request, &image_ref, &container_name, current_user());
        tracing::debug!(backend = %self.kind, args = ?args, "Running container");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| run_error(format!("starting {} run: {}", self.program, e)))?;

        let status = match process::wait(&mut child, cancel)
            .await
            .map_err(|e| run_error(format!("waiting for {}: {}", self.program, e)))?
        {
            Completion::Finished(status) => status,
            Completion::Cancelled => {
                self.kill_container(&container_name).await;
                return Err(ShellError::Cancelled("container run".to_string()));
            }
        };

        if status.success() {
            return Ok(());
        }

        let code = process::exit_code(&status);
        Err(ShellError::RunError {
            message: format!("container exited with status {}", code),
            exit_code: Some(code),
        })
    }
}

/// Extract the image reference from `load` output.
///
/// Docker prints `Loaded image: <ref>`, Podman prints
/// `Loaded image(s): <ref>[,<ref>...]`. Untagged images only report
/// `Loaded image ID: <id>`.
pub fn parse_load_output(output: &str) -> Option<String> {
    let lines = || output.lines().map(str::trim);

    for line in lines() {
        if let Some(rest) = line.strip_prefix("Loaded image: ") {
            return non_empty(rest);
        }
        if let Some(rest) = line.strip_prefix("Loaded image(s): ") {
            return rest.split(',').next().and_then(non_empty);
        }
    }

    lines()
        .find_map(|line| line.strip_prefix("Loaded image ID: "))
        .and_then(non_empty)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn run_error(message: String) -> ShellError {
    ShellError::RunError {
        message,
        exit_code: None,
    }
}

fn container_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", TOOL_NAME, &id[..12])
}

#[cfg(unix)]
fn current_user() -> Option<(u32, u32)> {
    Some((
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    ))
}

#[cfg(not(unix))]
fn current_user() -> Option<(u32, u32)> {
    None
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
