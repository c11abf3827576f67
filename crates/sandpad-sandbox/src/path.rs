//! Virtual path handling shared by every runtime.
//!
//! Sandbox paths are slash separated and rooted at the sandbox root. They are
//! normalized to a relative form without leading slash (`""` is the root), so
//! `/index.js`, `index.js` and `./index.js` all name the same file.

use std::path::{Path, PathBuf};

use crate::SandboxError;

pub fn normalize(path: &str) -> Result<String, SandboxError> {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    return Err(SandboxError::InvalidPath(format!(
                        "{path} escapes the sandbox root"
                    )));
                }
            }
            seg if seg.contains('\0') || seg.contains('\\') => {
                return Err(SandboxError::InvalidPath(path.to_string()));
            }
            seg => out.push(seg),
        }
    }
    Ok(out.join("/"))
}

/// Parent of a normalized path; the root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Last segment of a normalized path.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Map a virtual path onto a host directory. The result never leaves `root`.
pub fn resolve_under(root: &Path, path: &str) -> Result<PathBuf, SandboxError> {
    let normalized = normalize(path)?;
    if normalized.is_empty() {
        return Ok(root.to_path_buf());
    }
    Ok(root.join(normalized))
}
