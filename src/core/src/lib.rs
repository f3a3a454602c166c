//! apko-shell core - script headers, image configuration, rendering.
//!
//! Everything here is free of container engines and image builders:
//! parsing a script's header, merging it with command-line overrides into
//! one image configuration, and producing the directive-free copy of the
//! script that runs inside the container.

pub mod config;
pub mod error;
pub mod render;
pub mod resolve;
pub mod script;

// Re-export commonly used types
pub use config::{ImageConfiguration, ImageContents, LogLevel, Paths};
pub use error::{Result, ShellError};
pub use render::{render_script, write_inline_script, RenderedScript};
pub use resolve::{merge_directive_args, resolve, Overrides};
pub use script::{parse, parse_file, parse_str, ScriptHeader};

/// Name of the tool, used for header markers and directory namespacing.
pub const TOOL_NAME: &str = "apko-shell";

/// apko-shell version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
