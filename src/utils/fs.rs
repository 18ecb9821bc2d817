// src/utils/fs.rs

//! Filesystem helpers.

use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a file's contents. Blocking.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// One path component built from free text: trimmed, with whitespace and
/// path separators replaced by `_`. Never empty, `.` or `..`.
pub fn safe_component(raw: &str) -> String {
    let component: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect();
    match component.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => component,
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
