use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Lowercased extension, if any.
pub fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().unwrap_or_default().join(path)
    }
}

/// Lexical normalization of `.` and `..` components. A `..` that would
/// climb above the root of an absolute path is discarded rather than kept.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(comp),
            },
            other => parts.push(other),
        }
    }
    parts.iter().map(|c| c.as_os_str()).collect()
}

/// Resolve a path for containment comparison. Canonicalizes the deepest
/// existing ancestor (following symlinks) and re-appends the not-yet-existing
/// remainder, so that destinations can be checked before they are created.
pub fn resolve_for_containment(path: &Path) -> PathBuf {
    let normalized = normalize_lexically(&absolute(path));
    if let Ok(canonical) = fs::canonicalize(&normalized) {
        return canonical;
    }

    let mut rest: Vec<OsString> = Vec::new();
    let mut cursor = normalized.as_path();
    loop {
        if let Ok(canonical) = fs::canonicalize(cursor) {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                cursor = parent;
            }
            _ => return normalized,
        }
    }
}

/// True when `path` resolves to a location inside `root`.
pub fn is_within(path: &Path, root: &Path) -> bool {
    let resolved = resolve_for_containment(path);
    let root = resolve_for_containment(root);
    resolved.starts_with(&root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_parent_components() {
        let p = normalize_lexically(Path::new("/a/b/../c/./d"));
        assert_eq!(p, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn test_normalize_does_not_climb_above_root() {
        let p = normalize_lexically(Path::new("/../../etc/passwd"));
        assert_eq!(p, PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_containment_of_missing_target() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("library").join("movie.mkv");
        assert!(is_within(&dest, tmp.path()));
        assert!(!is_within(&dest, Path::new("/nonexistent-root")));
    }

    #[test]
    fn test_traversal_escape_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let sneaky = tmp.path().join("library").join("..").join("..").join("x");
        assert!(!is_within(&sneaky, &tmp.path().join("library")));
    }
}
