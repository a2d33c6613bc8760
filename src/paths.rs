//! Security-critical path resolution.
//!
//! Incident URIs arrive from the analyzer and from the provider; both are
//! untrusted. Every path is normalized, mapped into the input directory, and
//! verified to stay inside it before any file I/O or git invocation. The same
//! module validates branch names and file arguments handed to git.

use crate::errors::PathError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Absolute prefixes that indicate a host filesystem path leaked into the
/// analyzer output. `/opt/input` is the conventional container mount and is
/// excepted.
const LOCAL_FILESYSTEM_ROOTS: &[&str] = &[
    "/Users/", "/home/", "/root/", "/mnt/", "/media/", "/var/", "/tmp/", "/etc/", "/usr/",
    "/opt/",
];

const CONTAINER_INPUT_MOUNT: &str = "/opt/input";

/// Maps analyzer/provider URIs to safe paths relative to the input directory.
pub struct PathResolver {
    abs_input: String,
}

impl PathResolver {
    pub fn new(input_dir: &Path) -> Result<Self> {
        let abs = if input_dir.is_absolute() {
            input_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .context("Failed to resolve current directory")?
                .join(input_dir)
        };
        let abs_input = clean(&abs.to_string_lossy());
        Ok(Self { abs_input })
    }

    /// Absolute form of the input directory after normalization.
    pub fn input_dir(&self) -> &Path {
        Path::new(&self.abs_input)
    }

    /// Resolve a `file://` URI or bare path to a path relative to the input
    /// directory, rejecting anything that escapes it.
    pub fn resolve(&self, uri_or_path: &str) -> std::result::Result<PathBuf, PathError> {
        let raw = uri_or_path.strip_prefix("file://").unwrap_or(uri_or_path);
        let raw = strip_line_suffix(raw);
        let cleaned = clean(raw);

        let rel = if cleaned.starts_with('/') {
            if let Some(rest) = strip_dir_prefix(&cleaned, &self.abs_input) {
                rest.to_string()
            } else if is_local_filesystem_root(&cleaned) {
                return Err(PathError::LocalFilesystemRoot {
                    path: cleaned.clone(),
                });
            } else {
                // Container-style absolute path: strip leading separators and
                // treat the remainder as relative to the input directory.
                cleaned.trim_start_matches('/').to_string()
            }
        } else if cleaned.starts_with("C:\\") || cleaned.starts_with("D:\\") {
            return Err(PathError::LocalFilesystemRoot { path: cleaned });
        } else {
            cleaned
        };

        // Final containment check: the joined absolute path must stay inside
        // the input directory.
        let joined = clean(&format!("{}/{}", self.abs_input, rel));
        if joined != self.abs_input && strip_dir_prefix(&joined, &self.abs_input).is_none() {
            return Err(PathError::OutsideInputRoot {
                path: uri_or_path.to_string(),
            });
        }

        Ok(PathBuf::from(rel))
    }

    /// Absolute on-disk path for a previously resolved relative path.
    pub fn full_path(&self, rel: &Path) -> PathBuf {
        Path::new(&self.abs_input).join(rel)
    }
}

/// Strip a trailing `:<digits>` line-number suffix. A colon followed by
/// anything non-numeric is part of the filename and preserved.
pub fn strip_line_suffix(path: &str) -> &str {
    if let Some((prefix, suffix)) = path.rsplit_once(':') {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return prefix;
        }
    }
    path
}

fn is_local_filesystem_root(path: &str) -> bool {
    if path == CONTAINER_INPUT_MOUNT || path.starts_with("/opt/input/") {
        return false;
    }
    LOCAL_FILESYSTEM_ROOTS
        .iter()
        .any(|root| path.starts_with(root) || path == root.trim_end_matches('/'))
}

/// Lexical normalization: collapse `//` and `.`, resolve `..` without
/// touching the filesystem. `..` at an absolute root disappears; in a
/// relative path a leading `..` is preserved.
fn clean(path: &str) -> String {
    let is_abs = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if stack.last().is_some_and(|last| *last != "..") {
                    stack.pop();
                } else if !is_abs {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }

    let body = stack.join("/");
    if is_abs {
        format!("/{body}")
    } else if body.is_empty() {
        ".".to_string()
    } else {
        body
    }
}

/// If `path` is inside `dir`, return the remainder without the leading
/// separator. Prefix equality is component-wise, not byte-wise.
fn strip_dir_prefix<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(dir)?;
    rest.strip_prefix('/')
}

const MAX_GIT_ARG_LEN: usize = 255;

/// Validate a branch name or file path before handing it to git as an
/// argument. Forbids traversal, option injection, and shell-hostile bytes.
pub fn validate_git_argument(arg: &str) -> std::result::Result<(), PathError> {
    let reject = |reason: &str| {
        Err(PathError::InvalidGitArgument {
            arg: arg.to_string(),
            reason: reason.to_string(),
        })
    };

    if arg.is_empty() {
        return reject("empty argument");
    }
    if arg.len() > MAX_GIT_ARG_LEN {
        return reject("longer than 255 characters");
    }
    if arg.contains("..") {
        return reject("contains '..'");
    }
    if arg.starts_with('.') {
        return reject("leading '.'");
    }
    if arg.starts_with('-') {
        return reject("leading '-'");
    }
    if let Some(bad) = arg
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
    {
        return reject(&format!("character {bad:?} not allowed"));
    }
    Ok(())
}
