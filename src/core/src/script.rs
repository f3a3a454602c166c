//! Script header parser.
//!
//! Extracts `#!apko-shell` directive lines and an optional fenced
//! configuration block from the comment header of a script:
//!
//! ```text
//! #!/usr/bin/env apko-shell
//! #!apko-shell -p curl,jq
//! # /// apko
//! # contents:
//! #   packages:
//! #     - python3
//! # ///
//! print("hello")
//! ```
//!
//! Scanning stops at the first line that is not a comment, or right after
//! the fenced block closes. The body is never inspected.

use std::io::BufRead;
use std::path::Path;

use crate::config::ImageConfiguration;
use crate::error::{Result, ShellError};

/// Prefix of a directive line.
pub const DIRECTIVE_PREFIX: &str = "#!apko-shell";

/// Prefix of the line opening a fenced configuration block.
pub const FENCE_OPEN: &str = "# /// apko";

/// Prefix of the line closing a fenced configuration block.
pub const FENCE_CLOSE: &str = "# ///";

/// Configuration extracted from a script header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptHeader {
    /// Raw argument strings of the directive lines, in file order
    pub directives: Vec<String>,

    /// Decoded fenced configuration block, if the header had one
    pub image_config: Option<ImageConfiguration>,
}

/// Parse a script header from a reader.
pub fn parse<R: BufRead>(reader: R) -> Result<ScriptHeader> {
    let mut header = ScriptHeader::default();
    let mut fence: Option<Vec<String>> = None;

    for (idx, line) in reader.split(b'\n').enumerate() {
        let line = line
            .map_err(|e| ShellError::ParseError(format!("reading script: {}", e)))?;
        // Header comments may carry any bytes; only the text we keep is decoded.
        let line = String::from_utf8_lossy(line.strip_suffix(b"\r").unwrap_or(&line));

        if line.starts_with(FENCE_OPEN) {
            fence.get_or_insert_with(Vec::new);
            continue;
        }

        if let Some(block) = fence.as_mut() {
            if line.starts_with(FENCE_CLOSE) {
                let content = block.join("\n");
                header.image_config = Some(decode_block(&content, idx + 1)?);
                return Ok(header);
            }
            // "# " drops two characters, a bare "#" drops one.
            if let Some(rest) = line.strip_prefix("# ") {
                block.push(rest.to_string());
            } else if let Some(rest) = line.strip_prefix('#') {
                block.push(rest.to_string());
            }
            continue;
        }

        if let Some(args) = line.strip_prefix(DIRECTIVE_PREFIX) {
            let args = args.trim();
            if !args.is_empty() {
                header.directives.push(args.to_string());
            }
            continue;
        }

        if !line.starts_with('#') {
            break;
        }
    }

    if fence.is_some() {
        return Err(ShellError::ParseError(format!(
            "fenced block opened with '{}' is never closed with '{}'",
            FENCE_OPEN, FENCE_CLOSE
        )));
    }

    Ok(header)
}

/// Parse a script header from text.
pub fn parse_str(content: &str) -> Result<ScriptHeader> {
    parse(content.as_bytes())
}

/// Parse the header of the script at `path`.
pub fn parse_file(path: &Path) -> Result<ScriptHeader> {
    let file = std::fs::File::open(path).map_err(|e| {
        ShellError::ParseError(format!("opening script {}: {}", path.display(), e))
    })?;
    parse(std::io::BufReader::new(file))
}

fn decode_block(content: &str, line_num: usize) -> Result<ImageConfiguration> {
    // An empty block decodes to an empty configuration.
    if content.trim().is_empty() {
        return Ok(ImageConfiguration::default());
    }
    serde_yaml::from_str(content).map_err(|e| {
        ShellError::ParseError(format!(
            "fenced block ending on line {}: {}",
            line_num, e
        ))
    })
}
