//! Storage-root path resolution.
//!
//! Layout: one directory per user under the root, one regular file per
//! logical name inside it, ingest temps prefixed `.tmp.upload.`. All
//! resolution goes through [`resolve_file`], which re-checks the name rules
//! so a worker can never be talked into leaving the user directory even if
//! a hostile row reaches it through the store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use protocol::validate_filename;

/// Directory holding `username`'s files.
pub(crate) fn user_dir(root: &Path, username: &str) -> PathBuf {
    root.join(username)
}

/// Creates (if needed) and returns the user's directory.
pub(crate) fn ensure_user_dir(root: &Path, username: &str) -> io::Result<PathBuf> {
    let dir = user_dir(root, username);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Resolves the final path of `name` inside the user's directory, or `None`
/// when the name violates the protocol rules.
pub(crate) fn resolve_file(root: &Path, username: &str, name: &str) -> Option<PathBuf> {
    if validate_filename(name) {
        Some(user_dir(root, username).join(name))
    } else {
        None
    }
}
