//! Logical vault path helpers
//!
//! Vault paths are `/`-rooted, normalized, and never escape the vault:
//! `..` and empty segments are rejected at validation.

use vaulthalla_core::{Error, Result};

/// Validate and normalize a caller-supplied vault path.
pub fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::Validation(format!(
            "path must be absolute within the vault: '{path}'"
        )));
    }

    let mut segments = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        validate_name(segment)?;
        segments.push(segment);
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Validate a single entry name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("entry name must not be empty".into()));
    }
    if name == "." || name == ".." {
        return Err(Error::Validation(format!("entry name '{name}' is reserved")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::Validation(format!(
            "entry name '{name}' contains forbidden characters"
        )));
    }
    if name.len() > 255 {
        return Err(Error::Validation("entry name exceeds 255 bytes".into()));
    }
    Ok(())
}

/// Parent of a normalized path; `/` has no parent.
pub fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Final component of a normalized path.
pub fn file_name(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    path.rsplit('/').next()
}

/// Join a normalized directory path with a validated name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// True when `candidate` lives inside `dir` (or equals it).
pub fn is_within(dir: &str, candidate: &str) -> bool {
    if dir == "/" {
        return true;
    }
    candidate == dir || candidate.starts_with(&format!("{dir}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_slashes() {
        assert_eq!(normalize("/a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
    }

    #[test]
    fn test_relative_and_escaping_paths_rejected() {
        assert!(normalize("a/b").is_err());
        assert!(normalize("/a/../b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b.txt").unwrap(), "/a");
        assert_eq!(parent("/a").unwrap(), "/");
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b.txt").unwrap(), "b.txt");
    }

    #[test]
    fn test_join_and_containment() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert!(is_within("/a", "/a/b/c"));
        assert!(!is_within("/a", "/ab"));
    }
}
