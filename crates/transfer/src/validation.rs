use std::path::{Component, Path};

use crate::TransferError;

/// Checks that a path taken relative to a Location base stays inside it.
///
/// Backslashes count as separators too, so `..\x` is caught on every
/// platform. NUL bytes, drive prefixes and rooted paths are refused.
pub fn validate_relative_path(path: &str) -> Result<(), TransferError> {
    match escape_reason(path) {
        Some(reason) => Err(TransferError::InvalidPath(format!("{reason}: {path:?}"))),
        None => Ok(()),
    }
}

fn escape_reason(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        return Some("empty path");
    }
    if path.contains('\0') {
        return Some("NUL byte in path");
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Some("path leaves its base");
    }
    let rooted = Path::new(path)
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)));
    if rooted || path.starts_with('\\') {
        return Some("path is not relative");
    }
    None
}
