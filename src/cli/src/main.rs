//! apko-shell CLI entry point.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use apko_shell_cli::{Cli, Orchestrator};
use apko_shell_core::{merge_directive_args, Paths, Result, ShellError};

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => report(&e),
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let raw: Vec<String> = std::env::args_os()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let args = merge_directive_args(&raw).map_err(|e| e.with_stage("reading script directives"))?;
    let merged = args.len() - raw.len();

    let cli = Cli::parse_from(
        std::iter::once(apko_shell_core::TOOL_NAME.to_string()).chain(args.iter().cloned()),
    );

    // RUST_LOG takes precedence over --log-level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // The merge ran before logging was configured.
    if merged > 0 {
        tracing::debug!(directives = ?&args[..merged], args = ?args, "Merged script directives");
    }
    tracing::debug!(version = apko_shell_core::VERSION, cli = ?cli, "Starting");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let paths = Paths::from_env()?;
    paths.ensure()?;

    Orchestrator::with_defaults(paths).run(&cli, &cancel).await
}

/// Print the error and return the process exit code.
fn report(err: &ShellError) -> i32 {
    match err {
        // The container already reported its own failure on stderr.
        ShellError::RunError {
            exit_code: Some(code),
            ..
        } => tracing::debug!(exit_code = code, "Container exited with non-zero status"),
        _ => eprintln!("Error: {err}"),
    }
    err.exit_code()
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = interrupt => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = interrupt.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = interrupt.await;
        }

        tracing::debug!("Received termination signal, cancelling");
        token.cancel();
    });
}
