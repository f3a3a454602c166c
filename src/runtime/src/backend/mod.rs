//! Container runtime backends.
//!
//! A backend loads an image tarball into a container engine and runs one
//! container from it. The set of backends is closed; they are probed in a
//! fixed order and the first available one is used for the invocation.

mod engine;

pub use engine::{parse_load_output, EngineBackend};

use std::collections::BTreeMap;
use std::path::PathBuf;

use apko_shell_core::error::{Result, ShellError};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Mount point of the host working directory inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Mount point of the rendered script inside the container.
pub const SCRIPT_MOUNT: &str = "/apko-shell/script";

/// What to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRequest {
    /// Image tarball to load
    pub image_path: PathBuf,

    /// Rendered script, mounted read-only at [`SCRIPT_MOUNT`]
    pub script_path: Option<PathBuf>,

    /// Arguments passed to the script
    pub script_args: Vec<String>,

    /// Host directory mounted read-write at [`WORKSPACE_MOUNT`]
    pub work_dir: PathBuf,

    /// Allocate a TTY and run the image's default command
    pub interactive: bool,

    /// Container environment
    pub env: BTreeMap<String, String>,
}

/// A container engine able to load and run image tarballs.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether the engine is installed and responding.
    async fn available(&self) -> bool;

    /// Load the image and run the container to completion.
    ///
    /// stdio is passed through. A non-zero container exit is reported as
    /// [`ShellError::RunError`] carrying the exit code.
    async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<()>;
}

/// Known container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Docker,
    Podman,
}

impl BackendKind {
    /// Order in which engines are probed.
    pub const PROBE_ORDER: [BackendKind; 2] = [BackendKind::Docker, BackendKind::Podman];

    /// Executable name of the engine CLI.
    pub fn program(&self) -> &'static str {
        match self {
            BackendKind::Docker => "docker",
            BackendKind::Podman => "podman",
        }
    }

    /// Backend driving this engine.
    pub fn backend(self) -> Box<dyn RuntimeBackend> {
        Box::new(EngineBackend::new(self))
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.program())
    }
}

/// All backends in probe order.
pub fn registered_backends() -> Vec<Box<dyn RuntimeBackend>> {
    BackendKind::PROBE_ORDER
        .iter()
        .map(|kind| kind.backend())
        .collect()
}

/// Pick the first available backend.
pub async fn select_backend(
    backends: Vec<Box<dyn RuntimeBackend>>,
) -> Result<Box<dyn RuntimeBackend>> {
    let mut tried = Vec::with_capacity(backends.len());
    for backend in backends {
        if backend.available().await {
            tracing::debug!(backend = backend.name(), "Selected container runtime");
            return Ok(backend);
        }
        tracing::debug!(backend = backend.name(), "Container runtime not available");
        tried.push(backend.name().to_string());
    }

    Err(ShellError::RuntimeUnavailable(if tried.is_empty() {
        "no backends registered".to_string()
    } else {
        format!("tried {}; install one of them and make sure it is running", tried.join(", "))
    }))
}
