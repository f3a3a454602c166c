//! Command-line surface.
//!
//! Every scalar flag overrides itself (`args_override_self`), so when a
//! script's directives are spliced in front of the literal command line the
//! literal flags win.

use std::collections::BTreeMap;
use std::path::PathBuf;

use apko_shell_core::resolve::DEFAULT_SHELL;
use apko_shell_core::{LogLevel, Overrides, ShellError};
use clap::{ArgAction, Parser};

/// Run scripts in ephemeral containers built from the packages they declare.
///
/// Use `#!/usr/bin/env apko-shell` as the interpreter line and declare
/// packages with `#!apko-shell -p <pkg,...>` lines or a `# /// apko` block.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "apko-shell", version, about, args_override_self = true)]
pub struct Cli {
    /// Script to run
    pub script: Option<PathBuf>,

    /// Arguments passed to the script
    pub args: Vec<String>,

    /// Packages to install, comma separated (last occurrence wins)
    #[arg(
        short = 'p',
        long = "packages",
        value_delimiter = ',',
        action = ArgAction::Set,
        num_args = 1
    )]
    pub packages: Vec<String>,

    /// Additional package repositories, comma separated
    #[arg(long = "repository", value_delimiter = ',', action = ArgAction::Append)]
    pub repositories: Vec<String>,

    /// Additional repository signing keys, comma separated
    #[arg(long = "keyring", value_delimiter = ',', action = ArgAction::Append)]
    pub keyring: Vec<String>,

    /// Start an interactive session using the image's default command
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Build the image, print the tarball path and exit
    #[arg(long)]
    pub build_only: bool,

    /// Shell used to run the script inside the container
    #[arg(long, default_value = DEFAULT_SHELL)]
    pub shell: String,

    /// Command to run instead of a script file
    #[arg(short = 'c', long)]
    pub command: Option<String>,

    /// Environment variable for the container (KEY=VALUE), can be repeated
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl Cli {
    /// Flag values that feed configuration resolution.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            packages: non_empty(&self.packages),
            repositories: non_empty(&self.repositories),
            keyring: non_empty(&self.keyring),
            shell: self.shell.clone(),
        }
    }

    /// Container environment from `--env` flags.
    pub fn environment(&self) -> Result<BTreeMap<String, String>, ShellError> {
        parse_env_vars(&self.env).map_err(ShellError::ConfigError)
    }
}

/// Parse KEY=VALUE pairs into a map. Later keys replace earlier ones.
pub fn parse_env_vars(vars: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for var in vars {
        let (key, value) = var
            .split_once('=')
            .ok_or_else(|| format!("Invalid environment variable (expected KEY=VALUE): {var}"))?;
        if key.is_empty() {
            return Err(format!("Invalid environment variable (empty key): {var}"));
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

/// Drop empty entries left by stray commas (`-p curl,`).
fn non_empty(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
