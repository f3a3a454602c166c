//! Image builder.
//!
//! Turns a resolved [`ImageConfiguration`] into an OCI image tarball. The
//! package resolution and layer assembly are done by `apko`; this module
//! only prepares its inputs, runs it, and reports failures with context.
//!
//! # Process
//!
//! 1. Write the configuration to `<work_dir>/apko.yaml`
//! 2. Run `apko build apko.yaml <tag> <output> --arch <host> --cache-dir <cache>`
//! 3. Return the tarball path

use std::path::{Path, PathBuf};

use apko_shell_core::error::{Result, ShellError};
use apko_shell_core::{ImageConfiguration, TOOL_NAME};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::process::{self, Completion};

/// Number of stderr lines kept in a build error.
const ERROR_TAIL_LINES: usize = 20;

/// Inputs for one image build.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    /// Resolved image configuration
    pub config: &'a ImageConfiguration,
    /// Image reference written into the tarball
    pub tag: &'a str,
    /// Where the tarball is written
    pub output: &'a Path,
    /// Per-invocation scratch directory
    pub work_dir: &'a Path,
}

/// Builds image tarballs from image configurations.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image and return the path of the tarball.
    async fn build(&self, request: BuildRequest<'_>, cancel: &CancellationToken) -> Result<PathBuf>;
}

/// [`ImageBuilder`] backed by the `apko` command.
#[derive(Debug, Clone)]
pub struct ApkoBuilder {
    program: String,
    cache_dir: PathBuf,
}

impl ApkoBuilder {
    /// Create a builder sharing the layer cache at `cache_dir` across runs.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "apko".to_string(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Use a different `apko` executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn build_args(&self, config_path: &Path, request: &BuildRequest<'_>) -> Vec<String> {
        vec![
            "build".to_string(),
            config_path.display().to_string(),
            request.tag.to_string(),
            request.output.display().to_string(),
            "--arch".to_string(),
            host_arch().to_string(),
            "--cache-dir".to_string(),
            self.cache_dir.display().to_string(),
        ]
    }
}

#[async_trait]
impl ImageBuilder for ApkoBuilder {
    async fn build(&self, request: BuildRequest<'_>, cancel: &CancellationToken) -> Result<PathBuf> {
        let config_path = request.work_dir.join("apko.yaml");
        let yaml = request.config.to_yaml()?;
        tokio::fs::write(&config_path, yaml)
            .await
            .map_err(|e| build_error("writing configuration", e))?;

        // A leftover tarball must not pass for this build's output.
        match tokio::fs::remove_file(request.output).await {
            Ok(()) => tracing::debug!(path = %request.output.display(), "Removed stale image"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(build_error("removing stale image", e)),
        }

        let args = self.build_args(&config_path, &request);
        tracing::debug!(program = %self.program, args = ?args, "Running image builder");

        let mut cmd = Command::new(&self.program);
        // apko writes SBOMs into its working directory.
        cmd.args(&args).current_dir(request.work_dir);

        let output = match process::output(&mut cmd, cancel)
            .await
            .map_err(|e| build_error(&format!("starting {}", self.program), e))?
        {
            Completion::Finished(output) => output,
            Completion::Cancelled => return Err(ShellError::Cancelled("image build".to_string())),
        };

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::debug!(target: "apko", "{}", line);
        }

        if !output.status.success() {
            return Err(ShellError::BuildError {
                stage: format!("{} build", self.program),
                message: format!(
                    "exited with status {}: {}",
                    process::exit_code(&output.status),
                    process::tail(&output.stderr, ERROR_TAIL_LINES)
                ),
            });
        }

        if !request.output.exists() {
            return Err(ShellError::BuildError {
                stage: format!("{} build", self.program),
                message: format!("no image written to {}", request.output.display()),
            });
        }

        tracing::info!(path = %request.output.display(), tag = request.tag, "Image built");
        Ok(request.output.to_path_buf())
    }
}

fn build_error(stage: &str, err: impl std::fmt::Display) -> ShellError {
    ShellError::BuildError {
        stage: stage.to_string(),
        message: err.to_string(),
    }
}

/// Deterministic image reference for a configuration.
///
/// Identical configurations yield identical tags.
pub fn image_tag(config: &ImageConfiguration) -> Result<String> {
    let yaml = config.to_yaml()?;
    let digest = hex::encode(Sha256::digest(yaml.as_bytes()));
    Ok(format!("{}:{}", TOOL_NAME, &digest[..12]))
}

/// Tarball file name for an image reference.
pub fn artifact_name(tag: &str) -> String {
    format!("{}.tar", tag.replace([':', '/'], "-"))
}

/// Tarball file name for an image reference, unique to this call.
///
/// Used for tarballs kept in a shared directory.
pub fn unique_artifact_name(tag: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}.tar", tag.replace([':', '/'], "-"), &id[..8])
}

/// Host architecture in apko's naming.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm/v7",
        other => other,
    }
}
