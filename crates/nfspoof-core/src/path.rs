//! Mount-relative path handling
//!
//! Paths handed to the filesystem bridge are absolute within the mount
//! (`/`, `/dir/file.txt`). They are normalised into a canonical form before
//! they reach the handle cache so that each remote object has exactly one
//! cache key: a leading `/`, no empty or `.` segments, no trailing `/`.
//!
//! `..` is rejected. The kernel resolves it before a callback is made, and
//! the only deliberate upward walk (escaping the export root) goes through
//! LOOKUP on the client directly.

use thiserror::Error;

use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// The mount root
pub const ROOT: &str = "/";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path too long: {0} bytes (max {max})", max = MAX_PATH_LEN)]
    PathTooLong(usize),

    #[error("filename too long: {0} bytes (max {max})", max = MAX_FILENAME_LEN)]
    NameTooLong(usize),

    #[error("invalid path: {0}")]
    Invalid(&'static str),
}

impl PathError {
    pub fn to_errno(&self) -> i32 {
        match self {
            PathError::PathTooLong(_) | PathError::NameTooLong(_) => libc::ENAMETOOLONG,
            PathError::Invalid(_) => libc::EINVAL,
        }
    }
}

/// Validate a filename (single path component)
pub fn validate_filename(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Invalid("empty filename"));
    }
    if name.contains('\0') {
        return Err(PathError::Invalid("filename contains null byte"));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(PathError::NameTooLong(name.len()));
    }
    if name == "." || name == ".." {
        return Err(PathError::Invalid("special directory names not allowed"));
    }
    if name.contains('/') {
        return Err(PathError::Invalid("filename contains path separator"));
    }
    Ok(())
}

/// Split a path into its validated components (empty for the root)
pub fn components(path: &str) -> Result<Vec<&str>, PathError> {
    if path.len() > MAX_PATH_LEN {
        return Err(PathError::PathTooLong(path.len()));
    }
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Invalid("parent directory (..) not allowed")),
            name => {
                validate_filename(name)?;
                parts.push(name);
            }
        }
    }
    Ok(parts)
}

/// Canonical form of `path`
pub fn normalize(path: &str) -> Result<String, PathError> {
    let parts = components(path)?;
    if parts.is_empty() {
        return Ok(ROOT.to_string());
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    Ok(out)
}

/// Append one component to a canonical path
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split a canonical path into (parent, name); `None` for the root
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if path == ROOT {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { ROOT } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

/// True if `path` equals `ancestor` or lies beneath it (both canonical)
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    match path.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Rewrite `path` that lies within `from` to lie within `to` (for renames)
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if !is_within(path, from) {
        return None;
    }
    let rest = if from == ROOT {
        path
    } else {
        &path[from.len()..]
    };
    if rest.is_empty() || rest == ROOT {
        return Some(to.to_string());
    }
    if to == ROOT {
        Some(rest.to_string())
    } else {
        Some(format!("{}{}", to, rest))
    }
}
