//! Relative path normalization and root containment checks.

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Normalize a user- or watcher-supplied relative path.
///
/// Backslashes become `/`, empty and `.` segments are dropped, and any `..`
/// segment is rejected so the result can never escape its storage root.
pub fn normalize_rel_path(raw: &str) -> Result<String> {
    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::Validation(format!(
                    "path '{raw}' escapes its storage root"
                )))
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(Error::Validation(format!("path '{raw}' is empty")));
    }
    Ok(parts.join("/"))
}

/// Like [`normalize_rel_path`] but an empty path means the root itself.
pub fn normalize_rel_dir(raw: &str) -> Result<String> {
    if raw.replace('\\', "/").split('/').all(|s| s.is_empty() || s == ".") {
        return Ok(String::new());
    }
    normalize_rel_path(raw)
}

/// Join a normalized relative path onto a root.
pub fn resolve_under(root: &Path, rel_path: &str) -> PathBuf {
    if rel_path.is_empty() {
        return root.to_path_buf();
    }
    rel_path.split('/').fold(root.to_path_buf(), |acc, s| acc.join(s))
}

/// Express `abs` relative to `root` as a normalized POSIX path.
///
/// Returns `None` when `abs` lies outside `root` or names the root itself.
pub fn rel_path_of(root: &Path, abs: &Path) -> Option<String> {
    let rest = abs.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Whether `rel_path` equals `prefix` or lies beneath it.
pub fn is_under(rel_path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    rel_path == prefix
        || (rel_path.len() > prefix.len()
            && rel_path.starts_with(prefix)
            && rel_path.as_bytes()[prefix.len()] == b'/')
}

/// Rewrite `rel_path` from under `old_prefix` to under `new_prefix`.
pub fn rebase(rel_path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if !is_under(rel_path, old_prefix) {
        return None;
    }
    let rest = rel_path[old_prefix.len()..].trim_start_matches('/');
    Some(match (new_prefix.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => new_prefix.to_string(),
        (false, false) => format!("{new_prefix}/{rest}"),
    })
}

/// Lowercased extension of a relative path, without the dot.
pub fn extension_of(rel_path: &str) -> Option<String> {
    Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slashes_and_dots() {
        assert_eq!(normalize_rel_path("/a//b/./c.mp4/").unwrap(), "a/b/c.mp4");
        assert_eq!(normalize_rel_path("a\\b.mkv").unwrap(), "a/b.mkv");
    }

    #[test]
    fn normalize_rejects_traversal() {
        assert!(normalize_rel_path("../etc/passwd").is_err());
        assert!(normalize_rel_path("a/../../b").is_err());
    }

    #[test]
    fn normalize_rejects_empty() {
        assert!(normalize_rel_path("").is_err());
        assert!(normalize_rel_path("/./").is_err());
        assert_eq!(normalize_rel_dir("/").unwrap(), "");
        assert_eq!(normalize_rel_dir("shows/").unwrap(), "shows");
    }

    #[test]
    fn resolve_and_relativize() {
        let root = Path::new("/media/movies");
        let abs = resolve_under(root, "a/b.mp4");
        assert_eq!(abs, PathBuf::from("/media/movies/a/b.mp4"));
        assert_eq!(rel_path_of(root, &abs).as_deref(), Some("a/b.mp4"));
        assert_eq!(rel_path_of(root, root), None);
        assert_eq!(rel_path_of(root, Path::new("/media/shows/x.mp4")), None);
    }

    #[test]
    fn prefix_matching_respects_segments() {
        assert!(is_under("a/b.mp4", "a"));
        assert!(is_under("a", "a"));
        assert!(!is_under("ab/c.mp4", "a"));
        assert!(is_under("anything", ""));
    }

    #[test]
    fn rebase_moves_prefix() {
        assert_eq!(rebase("old/x/y.mp4", "old", "new").as_deref(), Some("new/x/y.mp4"));
        assert_eq!(rebase("old", "old", "new").as_deref(), Some("new"));
        assert_eq!(rebase("old/y.mp4", "old", "").as_deref(), Some("y.mp4"));
        assert_eq!(rebase("other/y.mp4", "old", "new"), None);
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("a/B.MKV").as_deref(), Some("mkv"));
        assert_eq!(extension_of("noext"), None);
    }
}
