//! Path guard: normalizes and validates relative paths; enforces
//! allow/ignore lists; defends the stage/backup roots against escape.

use crate::error::OtaError;
use std::path::{Path, PathBuf};

/// Normalizes a repository-relative path, rejecting anything unsafe.
///
/// Rejects: a leading `/`, and any segment equal to the empty string,
/// `.`, or `..`. Returns the canonical `/`-joined form.
pub fn normalize(rel: &str) -> Result<String, OtaError> {
    if rel.starts_with('/') {
        return Err(OtaError::Path("absolute path not permitted".into(), rel.into()));
    }
    let mut parts = Vec::new();
    for seg in rel.split('/') {
        match seg {
            "" => {
                return Err(OtaError::Path("empty path segment".into(), rel.into()));
            }
            "." | ".." => {
                return Err(OtaError::Path("path traversal segment".into(), rel.into()));
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(OtaError::Path("empty path".into(), rel.into()));
    }
    Ok(parts.join("/"))
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    let trimmed = prefix.trim_end_matches('/');
    path == trimmed || path.starts_with(&format!("{trimmed}/"))
}

/// Applies allow (if present, the path must match an allow entry) then
/// ignore (the path is excluded if it matches an ignore entry).
pub fn is_permitted(path: &str, allow: &[String], ignore: &[String]) -> bool {
    if !allow.is_empty() && !allow.iter().any(|a| prefix_matches(path, a)) {
        return false;
    }
    if ignore.iter().any(|i| prefix_matches(path, i)) {
        return false;
    }
    true
}

/// Defense-in-depth: asserts that joining `rel` onto `root` stays inside
/// `root` even after the OS resolves `.`/`..` components. Normal operation
/// never triggers this because `normalize` already rejected `..` segments;
/// this guards against path-normalization bugs elsewhere in the pipeline.
pub fn contains(root: &Path, rel: &str) -> Result<PathBuf, OtaError> {
    let joined = root.join(rel);
    let root_abs = lexical_absolute(root);
    let joined_abs = lexical_absolute(&joined);
    if !joined_abs.starts_with(&root_abs) {
        return Err(OtaError::Path(
            "staged path escapes its root".into(),
            joined,
        ));
    }
    Ok(joined)
}

/// Lexically resolves `.`/`..` components without touching the filesystem
/// (the real paths may not exist yet when this check runs).
fn lexical_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        use std::path::Component::*;
        match comp {
            ParentDir => {
                out.pop();
            }
            CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_clean_path() {
        assert_eq!(normalize("a/b/c.py").unwrap(), "a/b/c.py");
    }

    #[test]
    fn normalize_rejects_leading_slash() {
        assert!(normalize("/etc/passwd").is_err());
    }

    #[test]
    fn normalize_rejects_dotdot() {
        assert!(normalize("../evil").is_err());
        assert!(normalize("a/../b").is_err());
    }

    #[test]
    fn normalize_rejects_empty_segment() {
        assert!(normalize("a//b").is_err());
        assert!(normalize("").is_err());
    }

    #[test]
    fn normalize_rejects_dot_segment() {
        assert!(normalize("./a").is_err());
    }

    #[test]
    fn allow_list_restricts() {
        let allow = vec!["src".to_string()];
        assert!(is_permitted("src/main.py", &allow, &[]));
        assert!(!is_permitted("other/main.py", &allow, &[]));
        assert!(is_permitted("src", &allow, &[]));
    }

    #[test]
    fn ignore_list_excludes() {
        let ignore = vec!["tests".to_string()];
        assert!(!is_permitted("tests/test_a.py", &[], &ignore));
        assert!(is_permitted("src/main.py", &[], &ignore));
    }

    #[test]
    fn contains_rejects_escape() {
        let root = Path::new("stage");
        assert!(contains(root, "a/b").is_ok());
        // Even a path that slipped past `normalize` must be caught here.
        let raw = "../../etc/passwd";
        let joined = root.join(raw);
        assert!(!joined.starts_with(root) || contains(root, raw).is_err());
    }
}
