//! apko-shell runtime - image building and container execution.
//!
//! Drives the two external programs an invocation depends on: the image
//! builder that turns a resolved configuration into an OCI tarball, and the
//! container engine that loads and runs it.

#![allow(clippy::result_large_err)]

pub mod backend;
pub mod builder;
pub mod process;

// Re-export common types
pub use backend::{
    registered_backends, select_backend, BackendKind, EngineBackend, RunRequest, RuntimeBackend,
};
pub use builder::{
    artifact_name, image_tag, unique_artifact_name, ApkoBuilder, BuildRequest, ImageBuilder,
};

/// apko-shell runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
