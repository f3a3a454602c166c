//! Script rendering.
//!
//! The script mounted into the container is a copy of the user's script
//! with the interpreter line pointing at the configured shell and every
//! `#!apko-shell` directive line removed. Rendered files live in temporary
//! storage and are deleted when the [`RenderedScript`] is dropped.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tempfile::{NamedTempFile, TempPath};

use crate::error::{Result, ShellError};
use crate::script::DIRECTIVE_PREFIX;

/// An executable temporary script, removed on drop.
#[derive(Debug)]
pub struct RenderedScript {
    path: TempPath,
}

impl RenderedScript {
    /// Location of the script on the host.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Render `source` for execution with `shell`, writing the copy into `dir`.
///
/// The first line is always replaced by `#!<shell>`. Directive lines are
/// dropped wherever they appear; every other line is copied verbatim.
pub fn render_script(source: &Path, shell: &str, dir: &Path) -> Result<RenderedScript> {
    let input = std::fs::File::open(source).map_err(|e| {
        ShellError::ParseError(format!("opening script {}: {}", source.display(), e))
    })?;

    let mut file = create_temp(dir, "apko-shell-script-")?;
    {
        let mut out = BufWriter::new(file.as_file_mut());
        writeln!(out, "#!{}", shell)?;

        // Lines are copied as raw bytes; script bodies need not be UTF-8.
        for line in BufReader::new(input).split(b'\n').skip(1) {
            let line = line?;
            if line.starts_with(DIRECTIVE_PREFIX.as_bytes()) {
                continue;
            }
            out.write_all(&line)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }

    let rendered = finish(file)?;
    tracing::debug!(
        original = %source.display(),
        rendered = %rendered.path().display(),
        shell,
        "Rendered script"
    );
    Ok(rendered)
}

/// Write a one-line script running `command` with `shell` into `dir`.
pub fn write_inline_script(shell: &str, command: &str, dir: &Path) -> Result<RenderedScript> {
    let mut file = create_temp(dir, "apko-shell-inline-")?;
    write!(file, "#!{}\n{}\n", shell, command)?;
    file.flush()?;
    finish(file)
}

fn create_temp(dir: &Path, prefix: &str) -> Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".sh")
        .tempfile_in(dir)
        .map_err(|e| {
            ShellError::IoError(std::io::Error::new(
                e.kind(),
                format!("creating temp script in {}: {}", dir.display(), e),
            ))
        })
}

/// Make the file executable and close its handle.
fn finish(file: NamedTempFile) -> Result<RenderedScript> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(RenderedScript {
        path: file.into_temp_path(),
    })
}
