//! Slash-separated node path helpers.

use crate::error::{CoordError, CoordResult};

/// Join path segments, collapsing duplicate separators.
///
/// ```
/// assert_eq!(warpgrid_coord::path::join(&["/net", "pub/", "hostA"]), "/net/pub/hostA");
/// ```
pub fn join(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        for seg in part.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(seg);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Normalise a path: leading slash, no trailing slash, no empty segments.
pub fn clean(path: &str) -> CoordResult<String> {
    if !path.starts_with('/') {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    let cleaned = join(&[path]);
    if cleaned.split('/').any(|s| s == "." || s == "..") {
        return Err(CoordError::InvalidPath(path.to_string()));
    }
    Ok(cleaned)
}

/// Parent of a cleaned path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a cleaned path.
pub fn base(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_collapses_separators() {
        assert_eq!(join(&["/net/export", "t1", "app1/"]), "/net/export/t1/app1");
        assert_eq!(join(&[]), "/");
        assert_eq!(join(&["//a//b"]), "/a/b");
    }

    #[test]
    fn clean_rejects_relative_paths() {
        assert!(clean("net/pub").is_err());
        assert!(clean("/net/../pub").is_err());
        assert_eq!(clean("/net/pub/").unwrap(), "/net/pub");
    }

    #[test]
    fn parent_and_base() {
        assert_eq!(parent("/net/pub/hostA"), Some("/net/pub"));
        assert_eq!(parent("/net"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(base("/net/pub/hostA"), "hostA");
    }
}
