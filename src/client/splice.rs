//! Atomic replacement of generated sections in user-owned files.
//!
//! `known_hosts` and `ssh_config` belong to the user; we only own the
//! region between our markers. [`replace_section`] removes any previous
//! marked section, appends the new one, and rewrites the file atomically
//! (temp file + rename) only when the bytes actually change.
//!
//! The marker lines are load-bearing external contracts:
//!
//! ```text
//! # AUTOGENERATED:BEGIN:<section> - DO NOT EDIT BETWEEN MARKERS!
//! ...
//! # AUTOGENERATED:END:<section> - DO NOT EDIT BETWEEN MARKERS!
//! ```

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::debug;

use crate::Result;

/// Suffix appended to both marker lines.
const MARKER_SUFFIX: &str = " - DO NOT EDIT BETWEEN MARKERS!";

/// Replace the `section` region of the file at `path` with `new_lines`.
///
/// Missing files are treated as empty. An empty `new_lines` removes the
/// section entirely. The rewritten file always ends with exactly one
/// newline. Returns `true` when the file was rewritten, `false` when the
/// rendered content already matched byte-for-byte.
///
/// The write goes to `<path>.tmpfornew` with `mode`, then renames over
/// `path`; a failure at either step leaves the original file untouched.
pub fn replace_section(
    path: &Path,
    section: &str,
    new_lines: &[String],
    mode: u32,
) -> Result<bool> {
    let begin_marker = format!("# AUTOGENERATED:BEGIN:{section}");
    let end_marker = format!("# AUTOGENERATED:END:{section}");

    let contents = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let contents_str = String::from_utf8_lossy(&contents);

    // Copy everything except our previous section, markers included.
    let mut output: Vec<&str> = Vec::new();
    let mut include = true;
    for line in contents_str.split('\n') {
        if line.starts_with(&begin_marker) {
            include = false;
        } else if line.starts_with(&end_marker) {
            include = true;
        } else if include {
            output.push(line);
        }
    }

    // Strip trailing blank lines from the retained portion.
    while output.last().is_some_and(|line| line.is_empty()) {
        output.pop();
    }

    let mut rendered: Vec<String> = output.iter().map(ToString::to_string).collect();
    if !new_lines.is_empty() {
        rendered.push(String::new());
        rendered.push(format!("{begin_marker}{MARKER_SUFFIX}"));
        rendered.extend(new_lines.iter().cloned());
        rendered.push(format!("{end_marker}{MARKER_SUFFIX}"));
    }

    // Always finish with exactly one newline.
    rendered.push(String::new());
    let new_contents = rendered.join("\n");

    if new_contents.as_bytes() == contents.as_slice() {
        return Ok(false);
    }

    debug!(path = %path.display(), section = %section, "Rewriting generated section");
    atomic_write(path, new_contents.as_bytes(), mode)?;
    Ok(true)
}

/// Write `contents` to `<path>.tmpfornew` with `mode`, then rename over
/// `path`.
fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmpfornew");
    let tmp_path = Path::new(&tmp_path);

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(tmp_path)?;
        file.write_all(contents)?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}
