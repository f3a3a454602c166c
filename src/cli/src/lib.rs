//! apko-shell CLI - run scripts in containers built from their headers.

pub mod args;
pub mod orchestrator;

pub use args::Cli;
pub use orchestrator::{Mode, Orchestrator};
