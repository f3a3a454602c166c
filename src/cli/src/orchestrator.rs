//! Invocation pipeline.
//!
//! One invocation resolves an image configuration, builds the image, and
//! either prints the tarball path (`--build-only`) or runs a container from
//! it. Every temporary file lives under a per-invocation directory that is
//! removed when the pipeline returns, whichever way it returns.

use std::io::Write;
use std::path::{Path, PathBuf};

use apko_shell_core::error::{Result, ShellError};
use apko_shell_core::{
    parse_file, render_script, resolve, write_inline_script, ImageConfiguration, Paths,
    RenderedScript, TOOL_NAME,
};
use apko_shell_runtime::{
    artifact_name, image_tag, registered_backends, select_backend, unique_artifact_name,
    ApkoBuilder, BuildRequest, ImageBuilder, RunRequest, RuntimeBackend,
};
use tokio_util::sync::CancellationToken;

use crate::args::Cli;

/// What the invocation runs, in priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// `-c <command>`: a one-line script
    Inline { command: String },
    /// A script file and its arguments
    Script { path: PathBuf, args: Vec<String> },
    /// `-p` without a script: the image's default command
    Packages,
}

impl Mode {
    /// Select the mode for a parsed command line.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if let Some(command) = cli.command.as_ref().filter(|c| !c.is_empty()) {
            return Ok(Mode::Inline {
                command: command.clone(),
            });
        }
        if let Some(path) = &cli.script {
            return Ok(Mode::Script {
                path: path.clone(),
                args: cli.args.clone(),
            });
        }
        if !cli.overrides().packages.is_empty() {
            return Ok(Mode::Packages);
        }
        Err(ShellError::ConfigError(
            "either provide a script or use -p to specify packages".to_string(),
        ))
    }
}

/// Runs the build and run pipeline for one invocation.
pub struct Orchestrator {
    paths: Paths,
    builder: Box<dyn ImageBuilder>,
    backends: Vec<Box<dyn RuntimeBackend>>,
}

impl Orchestrator {
    pub fn new(
        paths: Paths,
        builder: Box<dyn ImageBuilder>,
        backends: Vec<Box<dyn RuntimeBackend>>,
    ) -> Self {
        Self {
            paths,
            builder,
            backends,
        }
    }

    /// Orchestrator using `apko` and the registered container engines.
    pub fn with_defaults(paths: Paths) -> Self {
        let builder = ApkoBuilder::new(&paths.cache_dir);
        Self::new(paths, Box::new(builder), registered_backends())
    }

    /// Run the pipeline, printing the tarball path to stdout in build-only mode.
    pub async fn run(self, cli: &Cli, cancel: &CancellationToken) -> Result<()> {
        self.run_with_output(cli, cancel, &mut std::io::stdout()).await
    }

    /// Run the pipeline, writing the build-only output to `out`.
    pub async fn run_with_output<W: Write>(
        self,
        cli: &Cli,
        cancel: &CancellationToken,
        out: &mut W,
    ) -> Result<()> {
        let mode = Mode::from_cli(cli)?;
        let env = cli.environment()?;
        tracing::debug!(mode = ?mode, "Selected invocation mode");

        let (base, work_dir) = match &mode {
            Mode::Inline { .. } | Mode::Packages => (None, std::env::current_dir()?),
            Mode::Script { path, .. } => {
                let header = parse_file(path).map_err(|e| e.with_stage("parsing script"))?;
                (header.image_config, script_dir(path))
            }
        };

        let config = resolve(base, &cli.overrides());
        log_config(&config);

        // Dropped last: every other temporary lives inside it.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", TOOL_NAME))
            .tempdir_in(&self.paths.tmp_dir)
            .map_err(|e| {
                ShellError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("creating work directory in {}: {}", self.paths.tmp_dir.display(), e),
                ))
            })?;

        let tag = image_tag(&config)?;
        let output = scratch.path().join(artifact_name(&tag));

        tracing::info!(packages = ?config.contents.packages, tag = %tag, "Building image");
        let image_path = self
            .builder
            .build(
                BuildRequest {
                    config: &config,
                    tag: &tag,
                    output: &output,
                    work_dir: scratch.path(),
                },
                cancel,
            )
            .await
            .map_err(|e| e.with_stage("building image"))?;

        if cli.build_only {
            // Kept tarballs share the temp root, so each gets its own name.
            let kept = self.paths.tmp_dir.join(unique_artifact_name(&tag));
            std::fs::rename(&image_path, &kept).map_err(|e| {
                ShellError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("keeping image at {}: {}", kept.display(), e),
                ))
            })?;
            writeln!(out, "{}", kept.display())?;
            out.flush()?;
            return Ok(());
        }

        let script = render(&mode, &cli.shell, scratch.path())?;
        let request = RunRequest {
            image_path,
            script_path: script.as_ref().map(|s| s.path().to_path_buf()),
            script_args: match &mode {
                Mode::Script { args, .. } => args.clone(),
                _ => Vec::new(),
            },
            work_dir,
            interactive: cli.interactive,
            env,
        };

        let backend = select_backend(self.backends)
            .await
            .map_err(|e| e.with_stage("selecting container runtime"))?;
        tracing::info!(backend = backend.name(), interactive = request.interactive, "Running container");
        let result = backend
            .run(&request, cancel)
            .await
            .map_err(|e| e.with_stage("running container"));

        drop(script);
        drop(scratch);
        result
    }
}

/// Directory a script runs in: its parent, or `.` for a bare file name.
fn script_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn render(mode: &Mode, shell: &str, dir: &Path) -> Result<Option<RenderedScript>> {
    let script = match mode {
        Mode::Inline { command } => Some(write_inline_script(shell, command, dir)?),
        Mode::Script { path, .. } => {
            Some(render_script(path, shell, dir).map_err(|e| e.with_stage("rendering script"))?)
        }
        Mode::Packages => None,
    };
    if let Some(script) = &script {
        tracing::debug!(path = %script.path().display(), "Prepared script");
    }
    Ok(script)
}

fn log_config(config: &ImageConfiguration) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match config.to_yaml() {
        Ok(yaml) => tracing::debug!(config = %yaml, "Resolved image configuration"),
        Err(e) => tracing::debug!(error = %e, "Could not serialize image configuration"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clap::Parser;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Builder that writes a placeholder tarball and records its requests.
    #[derive(Default, Clone)]
    struct FakeBuilder {
        configs: Arc<Mutex<Vec<ImageConfiguration>>>,
    }

    #[async_trait]
    impl ImageBuilder for FakeBuilder {
        async fn build(&self, request: BuildRequest<'_>, cancel: &CancellationToken) -> Result<PathBuf> {
            self.configs.lock().unwrap().push(request.config.clone());
            std::fs::write(request.output, b"image")?;
            if cancel.is_cancelled() {
                return Err(ShellError::Cancelled("image build".to_string()));
            }
            Ok(request.output.to_path_buf())
        }
    }

    /// What the fake backend observed during a run.
    #[derive(Debug, Clone)]
    struct Observed {
        request: RunRequest,
        script: Option<String>,
        image_existed: bool,
    }

    #[derive(Clone)]
    struct FakeBackend {
        available: bool,
        exit_code: i32,
        runs: Arc<Mutex<Vec<Observed>>>,
        /// Fired once the container "starts", as a signal would.
        cancel_on_run: Option<CancellationToken>,
    }

    impl FakeBackend {
        fn new(available: bool, exit_code: i32) -> Self {
            Self {
                available,
                exit_code,
                runs: Arc::default(),
                cancel_on_run: None,
            }
        }
    }

    #[async_trait]
    impl RuntimeBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn available(&self) -> bool {
            self.available
        }

        async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<()> {
            self.runs.lock().unwrap().push(Observed {
                request: request.clone(),
                script: request
                    .script_path
                    .as_ref()
                    .map(|p| std::fs::read_to_string(p).unwrap()),
                image_existed: request.image_path.exists(),
            });
            if let Some(after) = self.cancel_on_run.as_ref() {
                after.cancel();
            }
            if cancel.is_cancelled() {
                return Err(ShellError::Cancelled("container run".to_string()));
            }
            if self.exit_code == 0 {
                Ok(())
            } else {
                Err(ShellError::RunError {
                    message: format!("container exited with status {}", self.exit_code),
                    exit_code: Some(self.exit_code),
                })
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        paths: Paths,
        builder: FakeBuilder,
        backend: FakeBackend,
    }

    impl Fixture {
        fn new(backend: FakeBackend) -> Self {
            let dir = TempDir::new().unwrap();
            let paths = Paths::new(dir.path().join("cache"), dir.path().join("tmp"));
            paths.ensure().unwrap();
            Self {
                dir,
                paths,
                builder: FakeBuilder::default(),
                backend,
            }
        }

        fn script(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        async fn run(&self, args: &[&str]) -> (Result<()>, String) {
            self.run_with_cancel(args, &CancellationToken::new()).await
        }

        async fn run_with_cancel(&self, args: &[&str], cancel: &CancellationToken) -> (Result<()>, String) {
            let cli = Cli::try_parse_from(std::iter::once("apko-shell").chain(args.iter().copied())).unwrap();
            let backends: Vec<Box<dyn RuntimeBackend>> = vec![Box::new(self.backend.clone())];
            let orchestrator =
                Orchestrator::new(self.paths.clone(), Box::new(self.builder.clone()), backends);
            let mut out = Vec::new();
            let result = orchestrator
                .run_with_output(&cli, cancel, &mut out)
                .await;
            (result, String::from_utf8(out).unwrap())
        }

        fn runs(&self) -> Vec<Observed> {
            self.backend.runs.lock().unwrap().clone()
        }

        fn built(&self) -> Vec<ImageConfiguration> {
            self.builder.configs.lock().unwrap().clone()
        }

        /// Entries left in the temp root.
        fn leftovers(&self) -> Vec<PathBuf> {
            std::fs::read_dir(&self.paths.tmp_dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect()
        }
    }

    #[test]
    fn test_mode_priority() {
        let cli = Cli::try_parse_from(["apko-shell", "-c", "ls", "-p", "jq", "script.sh"]).unwrap();
        assert_eq!(Mode::from_cli(&cli).unwrap(), Mode::Inline { command: "ls".to_string() });

        let cli = Cli::try_parse_from(["apko-shell", "-p", "jq", "script.sh", "a"]).unwrap();
        assert_eq!(
            Mode::from_cli(&cli).unwrap(),
            Mode::Script {
                path: PathBuf::from("script.sh"),
                args: vec!["a".to_string()],
            }
        );

        let cli = Cli::try_parse_from(["apko-shell", "-p", "jq"]).unwrap();
        assert_eq!(Mode::from_cli(&cli).unwrap(), Mode::Packages);
    }

    #[test]
    fn test_no_mode_is_config_error() {
        let cli = Cli::try_parse_from(["apko-shell"]).unwrap();
        let err = Mode::from_cli(&cli).unwrap_err();
        assert!(matches!(err, ShellError::ConfigError(_)));
        assert!(err
            .to_string()
            .contains("either provide a script or use -p to specify packages"));
    }

    #[test]
    fn test_script_dir() {
        assert_eq!(script_dir(Path::new("script.sh")), PathBuf::from("."));
        assert_eq!(script_dir(Path::new("/a/b/script.sh")), PathBuf::from("/a/b"));
        assert_eq!(script_dir(Path::new("b/script.sh")), PathBuf::from("b"));
    }

    #[tokio::test]
    async fn test_no_mode_builds_nothing() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let (result, out) = fx.run(&[]).await;
        assert!(matches!(result, Err(ShellError::ConfigError(_))));
        assert!(out.is_empty());
        assert!(fx.built().is_empty());
        assert!(fx.runs().is_empty());
    }

    #[tokio::test]
    async fn test_build_only_prints_path_and_runs_nothing() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let script = fx.script(
            "script.sh",
            "#!/usr/bin/env apko-shell\n#!apko-shell -p curl,jq\necho \"hello\"\n",
        );
        let script = script.to_string_lossy().into_owned();

        let (result, out) = fx.run(&["--build-only", "-p", "curl,jq", script.as_str()]).await;
        result.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1);
        let tarball = PathBuf::from(lines[0]);
        assert!(tarball.exists());
        assert_eq!(tarball.parent().unwrap(), fx.paths.tmp_dir);
        assert!(fx.runs().is_empty());

        // Only the kept tarball remains in the temp root.
        assert_eq!(fx.leftovers(), vec![tarball.clone()]);

        // The same configuration built again gets its own tarball.
        let (result, out) = fx.run(&["--build-only", "-p", "curl,jq", script.as_str()]).await;
        result.unwrap();
        let second = PathBuf::from(out.trim_end());
        assert_ne!(second, tarball);
        assert!(second.exists());
        assert!(tarball.exists());
        assert_eq!(fx.built()[0], fx.built()[1]);
    }

    #[tokio::test]
    async fn test_directive_script_end_to_end() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let body = "echo \"hello\"\n\nif [ -n \"$1\" ]; then\n  echo \"$1\"\nfi\n";
        let script = fx.script(
            "script.sh",
            &format!("#!/usr/bin/env apko-shell\n#!apko-shell -p curl,jq\n{}", body),
        );
        let script_arg = script.to_string_lossy().into_owned();

        let (result, out) = fx.run(&["-p", "curl,jq", script_arg.as_str(), "first", "second"]).await;
        result.unwrap();
        assert!(out.is_empty());

        let built = fx.built();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].contents.packages, vec!["curl", "jq", "busybox"]);
        assert_eq!(built[0].contents.repositories, vec!["https://packages.wolfi.dev/os"]);
        assert_eq!(built[0].cmd, "/bin/sh");

        let runs = fx.runs();
        assert_eq!(runs.len(), 1);
        let observed = &runs[0];
        assert!(observed.image_existed);
        assert_eq!(observed.script.as_deref(), Some(format!("#!/bin/sh\n{}", body).as_str()));
        assert_eq!(observed.request.script_args, vec!["first", "second"]);
        assert_eq!(observed.request.work_dir, fx.dir.path());
        assert!(!observed.request.interactive);

        // Rendered script, tarball and work directory are gone.
        assert!(!observed.request.script_path.as_ref().unwrap().exists());
        assert!(!observed.request.image_path.exists());
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_fenced_block_is_base() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let script = fx.script(
            "py.sh",
            "#!/usr/bin/env apko-shell\n# /// apko\n# contents:\n#   packages:\n#     - python3\n# cmd: /usr/bin/python3\n# ///\nprint('hi')\n",
        );
        let script = script.to_string_lossy().into_owned();

        let (result, _) = fx.run(&["-p", "curl", script.as_str()]).await;
        result.unwrap();

        let built = fx.built();
        assert_eq!(built[0].contents.packages, vec!["python3", "curl", "busybox"]);
        assert_eq!(built[0].cmd, "/usr/bin/python3");
    }

    #[tokio::test]
    async fn test_inline_command() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let (result, _) = fx.run(&["-c", "echo $HOME", "--shell", "/bin/bash", "-e", "A=1"]).await;
        result.unwrap();

        let built = fx.built();
        assert_eq!(built[0].contents.packages, vec!["busybox", "bash"]);
        assert_eq!(built[0].cmd, "/bin/bash");

        let observed = &fx.runs()[0];
        assert_eq!(observed.script.as_deref(), Some("#!/bin/bash\necho $HOME\n"));
        assert!(observed.request.script_args.is_empty());
        assert_eq!(observed.request.work_dir, std::env::current_dir().unwrap());
        assert_eq!(observed.request.env.get("A").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_direct_packages() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let (result, _) = fx.run(&["-p", "curl", "-i"]).await;
        result.unwrap();

        let observed = &fx.runs()[0];
        assert!(observed.request.script_path.is_none());
        assert!(observed.script.is_none());
        assert!(observed.request.interactive);
        assert_eq!(fx.built()[0].contents.packages, vec!["curl", "busybox"]);
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let fx = Fixture::new(FakeBackend::new(true, 42));
        let (result, _) = fx.run(&["-c", "exit 42"]).await;
        let err = result.unwrap_err();
        assert_eq!(err.exit_code(), 42);
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_no_backend_after_build() {
        let fx = Fixture::new(FakeBackend::new(false, 0));
        let (result, _) = fx.run(&["-p", "curl"]).await;
        let err = result.unwrap_err();
        assert!(matches!(err, ShellError::RuntimeUnavailable(_)));
        assert!(err.to_string().contains("selecting container runtime: "));
        assert_eq!(fx.built().len(), 1);
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_errors_name_their_stage() {
        let fx = Fixture::new(FakeBackend::new(true, 3));
        let (result, _) = fx.run(&["-c", "exit 3"]).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("running container: container exited with status 3"));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_during_build() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let script = fx.script("script.sh", "#!/usr/bin/env apko-shell\necho hi\n");
        let script = script.to_string_lossy().into_owned();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, out) = fx.run_with_cancel(&["-p", "curl", script.as_str()], &cancel).await;
        let err = result.unwrap_err();
        assert!(matches!(err, ShellError::Cancelled(_)));
        assert!(err.to_string().contains("building image"));
        assert_eq!(err.exit_code(), 130);
        assert!(out.is_empty());
        assert_eq!(fx.built().len(), 1);
        assert!(fx.runs().is_empty());
        // The partial tarball went with the work directory.
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_build_only_leaves_nothing() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, out) = fx.run_with_cancel(&["--build-only", "-p", "curl"], &cancel).await;
        assert_eq!(result.unwrap_err().exit_code(), 130);
        assert!(out.is_empty());
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_during_run() {
        let cancel = CancellationToken::new();
        let mut backend = FakeBackend::new(true, 0);
        backend.cancel_on_run = Some(cancel.clone());
        let fx = Fixture::new(backend);
        let script = fx.script("script.sh", "#!/usr/bin/env apko-shell\nsleep 60\n");
        let script = script.to_string_lossy().into_owned();

        let (result, _) = fx.run_with_cancel(&[script.as_str()], &cancel).await;
        let err = result.unwrap_err();
        assert!(matches!(err, ShellError::Cancelled(_)));
        assert!(err.to_string().contains("running container"));
        assert_eq!(err.exit_code(), 130);

        let runs = fx.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].image_existed);
        assert!(!runs[0].request.script_path.as_ref().unwrap().exists());
        assert!(!runs[0].request.image_path.exists());
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_fence_fails_before_build() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let script = fx.script("bad.sh", "#!/usr/bin/env apko-shell\n# /// apko\n# cmd: /bin/sh\n");
        let script = script.to_string_lossy().into_owned();

        let (result, _) = fx.run(&[script.as_str()]).await;
        assert!(matches!(result, Err(ShellError::ParseError(_))));
        assert!(fx.built().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_env_fails_before_build() {
        let fx = Fixture::new(FakeBackend::new(true, 0));
        let (result, _) = fx.run(&["-p", "curl", "-e", "NOEQUALS"]).await;
        assert!(matches!(result, Err(ShellError::ConfigError(_))));
        assert!(fx.built().is_empty());
    }
}
