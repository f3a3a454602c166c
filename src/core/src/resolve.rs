//! Configuration resolution.
//!
//! Two steps, on either side of command-line parsing:
//!
//! 1. [`merge_directive_args`] splices a script's directive arguments in
//!    front of the literal command line, so the flag parser sees them as if
//!    they had been typed. Literal arguments come last and therefore win.
//! 2. [`resolve`] merges the script's fenced configuration block with the
//!    parsed flags and fills in defaults, yielding the image configuration
//!    handed to the builder.

use std::path::Path;

use crate::config::{ImageConfiguration, ImageContents};
use crate::error::Result;
use crate::script::parse_file;

/// Repository used when none is configured.
pub const DEFAULT_REPOSITORY: &str = "https://packages.wolfi.dev/os";

/// Signing key for [`DEFAULT_REPOSITORY`].
pub const DEFAULT_KEYRING: &str = "https://packages.wolfi.dev/os/wolfi-signing.rsa.pub";

/// Package installed when none is configured.
pub const DEFAULT_PACKAGE: &str = "busybox";

/// Shell used when none is given.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Package providing each known shell. Lookup is by exact path.
const SHELL_PACKAGES: &[(&str, &str)] = &[
    ("/bin/sh", "busybox"),
    ("/bin/ash", "busybox"),
    ("/bin/bash", "bash"),
    ("/bin/zsh", "zsh"),
];

/// Values taken from command-line flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Overrides {
    pub packages: Vec<String>,
    pub repositories: Vec<String>,
    pub keyring: Vec<String>,
    pub shell: String,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            repositories: Vec::new(),
            keyring: Vec::new(),
            shell: DEFAULT_SHELL.to_string(),
        }
    }
}

/// Prepend the directives of the script named by `args[0]` to `args`.
///
/// `args` is the command line without the program name. Nothing is merged
/// unless the first argument is not flag-like and names an existing file.
pub fn merge_directive_args(args: &[String]) -> Result<Vec<String>> {
    let Some(first) = args.first() else {
        return Ok(args.to_vec());
    };
    if first.starts_with('-') {
        return Ok(args.to_vec());
    }

    let path = Path::new(first);
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => {}
        _ => return Ok(args.to_vec()),
    }

    let header = parse_file(path)?;
    if header.directives.is_empty() {
        return Ok(args.to_vec());
    }

    let mut merged: Vec<String> = header
        .directives
        .iter()
        .flat_map(|d| d.split_whitespace().map(String::from))
        .collect();
    merged.extend(args.iter().cloned());
    Ok(merged)
}

/// Build the final image configuration.
///
/// A fenced configuration block, when present, is the base and the
/// command-line packages are appended to it. Otherwise a base is built from
/// the command-line packages with the shell as default command. Defaults
/// are applied last (see [`apply_defaults`]).
pub fn resolve(base: Option<ImageConfiguration>, overrides: &Overrides) -> ImageConfiguration {
    let mut config = match base {
        Some(mut config) => {
            config
                .contents
                .packages
                .extend(overrides.packages.iter().cloned());
            config
        }
        None => ImageConfiguration {
            contents: ImageContents {
                packages: overrides.packages.clone(),
                ..Default::default()
            },
            cmd: overrides.shell.clone(),
            ..Default::default()
        },
    };

    config
        .contents
        .repositories
        .extend(overrides.repositories.iter().cloned());
    config
        .contents
        .keyring
        .extend(overrides.keyring.iter().cloned());

    apply_defaults(&mut config, &overrides.shell);
    config
}

/// Fill in the default repository, package and shell package.
///
/// Each default is independent and idempotent.
pub fn apply_defaults(config: &mut ImageConfiguration, shell: &str) {
    let contents = &mut config.contents;

    if contents.repositories.is_empty() {
        contents.repositories.push(DEFAULT_REPOSITORY.to_string());
        if !contents.keyring.iter().any(|k| k == DEFAULT_KEYRING) {
            contents.keyring.push(DEFAULT_KEYRING.to_string());
        }
    }

    if contents.packages.is_empty() {
        contents.packages.push(DEFAULT_PACKAGE.to_string());
    }

    if let Some(package) = shell_package(shell) {
        if !contents.packages.iter().any(|p| p == package) {
            contents.packages.push(package.to_string());
        }
    }
}

/// Package that provides `shell`, if the shell is a known one.
pub fn shell_package(shell: &str) -> Option<&'static str> {
    SHELL_PACKAGES
        .iter()
        .find(|(path, _)| *path == shell)
        .map(|(_, package)| *package)
}
