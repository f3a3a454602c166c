use thiserror::Error;

/// apko-shell error types
#[derive(Error, Debug)]
pub enum ShellError {
    /// Malformed fenced block or unreadable script
    #[error("Parse error: {0}")]
    ParseError(String),

    /// No usable invocation mode could be resolved
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Image builder failure
    #[error("Build failed ({stage}): {message}")]
    BuildError { stage: String, message: String },

    /// No container runtime backend probed successfully
    #[error("No container runtime found: {0}")]
    RuntimeUnavailable(String),

    /// Backend spawn failure or non-zero child exit
    #[error("Run failed: {message}")]
    RunError {
        message: String,
        exit_code: Option<i32>,
    },

    /// Interrupted by a cancellation signal
    #[error("Cancelled during {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ShellError {
    /// Prefix the error message with the pipeline stage it occurred in.
    ///
    /// The variant is preserved so callers can still match on the kind.
    pub fn with_stage(self, stage: &str) -> Self {
        match self {
            ShellError::ParseError(msg) => ShellError::ParseError(format!("{stage}: {msg}")),
            ShellError::ConfigError(msg) => ShellError::ConfigError(format!("{stage}: {msg}")),
            ShellError::BuildError { stage: inner, message } => ShellError::BuildError {
                stage: format!("{stage}: {inner}"),
                message,
            },
            ShellError::RuntimeUnavailable(msg) => {
                ShellError::RuntimeUnavailable(format!("{stage}: {msg}"))
            }
            ShellError::RunError { message, exit_code } => ShellError::RunError {
                message: format!("{stage}: {message}"),
                exit_code,
            },
            ShellError::Cancelled(inner) => ShellError::Cancelled(format!("{stage}: {inner}")),
            ShellError::IoError(err) => {
                ShellError::IoError(std::io::Error::new(err.kind(), format!("{stage}: {err}")))
            }
            ShellError::SerializationError(msg) => {
                ShellError::SerializationError(format!("{stage}: {msg}"))
            }
        }
    }

    /// Process exit code for this error.
    ///
    /// A container that exited non-zero propagates its own code; a
    /// cancelled invocation exits with 130 like an interrupted shell.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShellError::RunError {
                exit_code: Some(code),
                ..
            } => *code,
            ShellError::Cancelled(_) => 130,
            _ => 1,
        }
    }
}

impl From<serde_yaml::Error> for ShellError {
    fn from(err: serde_yaml::Error) -> Self {
        ShellError::SerializationError(err.to_string())
    }
}

/// Result type alias for apko-shell operations
pub type Result<T> = std::result::Result<T, ShellError>;
