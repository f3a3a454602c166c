use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShellError};
use crate::TOOL_NAME;

/// Image configuration handed to the image builder.
///
/// Mirrors the apko image configuration format. This is both the shape of a
/// script's fenced configuration block and of the fully resolved image
/// specification. Keys this type does not model are carried through in
/// `extra` so they still reach the builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfiguration {
    /// Package sources and package list
    #[serde(default)]
    pub contents: ImageContents,

    /// Image entrypoint
    #[serde(default, skip_serializing_if = "ImageEntrypoint::is_empty")]
    pub entrypoint: ImageEntrypoint,

    /// Default command
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cmd: String,

    /// Working directory inside the image
    #[serde(default, rename = "work-dir", skip_serializing_if = "String::is_empty")]
    pub work_dir: String,

    /// Image environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Filesystem path mutations applied to the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathMutation>,

    /// Target architectures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archs: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Package sources and packages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageContents {
    /// APK repositories
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<String>,

    /// Repository signing keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyring: Vec<String>,

    /// Packages to install
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Image entrypoint. Only `command` is read here; `type`,
/// `shell-fragment` and `services` pass through in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageEntrypoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ImageEntrypoint {
    fn is_empty(&self) -> bool {
        self.command.is_empty() && self.extra.is_empty()
    }
}

/// A filesystem mutation applied while assembling the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMutation {
    pub path: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ImageConfiguration {
    /// Serialize to the YAML document the image builder consumes.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Per-user directories used by one invocation.
///
/// Built once at startup and passed down explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    /// Persistent build-layer cache (`<user cache>/apko-shell`)
    pub cache_dir: PathBuf,

    /// Root for per-invocation temporary files (`<system temp>/apko-shell`)
    pub tmp_dir: PathBuf,
}

impl Paths {
    pub fn new(cache_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Resolve the default locations from the user's environment.
    pub fn from_env() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| ShellError::ConfigError("Cannot determine cache directory".to_string()))?
            .join(TOOL_NAME);
        let tmp_dir = std::env::temp_dir().join(TOOL_NAME);
        Ok(Self { cache_dir, tmp_dir })
    }

    /// Create both directories if they do not exist yet.
    pub fn ensure(&self) -> Result<()> {
        create_dir(&self.cache_dir)?;
        create_dir(&self.tmp_dir)?;
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        ShellError::ConfigError(format!("Failed to create {}: {}", path.display(), e))
    })
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: debug, info, warn, error)",
                s
            )),
        }
    }
}
