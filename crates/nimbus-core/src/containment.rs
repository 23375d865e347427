//! Path containment.
//!
//! Every path that reaches the filesystem on behalf of a tenant goes through
//! this module: request paths in the static file server and entry paths in
//! the deploy archive extractor. Both sides normalize with
//! [`normalize_relative`] so they agree on what "inside the root" means.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainmentError {
    #[error("absolute path not allowed: {0}")]
    Absolute(String),

    #[error("path escapes root: {0}")]
    Escapes(String),

    #[error("i/o error while resolving path: {0}")]
    Io(String),
}

/// Lexically normalize a relative path.
///
/// `.` components are dropped and `..` pops the previous component. A `..`
/// with nothing left to pop escapes the root and is rejected, as is any
/// absolute path or drive prefix. An empty result means the root itself.
pub fn normalize_relative(path: &Path) -> Result<PathBuf, ContainmentError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ContainmentError::Escapes(path.display().to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ContainmentError::Absolute(path.display().to_string()));
            }
        }
    }
    Ok(parts.iter().collect())
}

/// Join `relative` onto `root` after normalization.
///
/// Purely lexical: the result never leaves `root` by way of `..`, but
/// symlinks under `root` are not followed. Callers writing into a directory
/// they populated themselves (the deploy stager) can rely on this alone.
pub fn contained_join(root: &Path, relative: &Path) -> Result<PathBuf, ContainmentError> {
    Ok(root.join(normalize_relative(relative)?))
}

/// Resolve `relative` under `root`, following symlinks.
///
/// Returns `Ok(None)` when nothing exists at the resolved location. The
/// canonical result must stay under the canonical `root`; a symlink that
/// points elsewhere yields [`ContainmentError::Escapes`].
pub fn resolve_within(root: &Path, relative: &Path) -> Result<Option<PathBuf>, ContainmentError> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| ContainmentError::Io(e.to_string()))?;
    let candidate = contained_join(&canonical_root, relative)?;

    let resolved = match candidate.canonicalize() {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ContainmentError::Io(e.to_string())),
    };

    if resolved.starts_with(&canonical_root) {
        Ok(Some(resolved))
    } else {
        Err(ContainmentError::Escapes(relative.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dot_segments() {
        assert_eq!(
            normalize_relative(Path::new("./a/./b/../c.txt")).unwrap(),
            PathBuf::from("a/c.txt")
        );
        assert_eq!(normalize_relative(Path::new("a/..")).unwrap(), PathBuf::new());
    }

    #[test]
    fn rejects_escaping_parent_segments() {
        for p in ["..", "../etc/passwd", "a/../../b", "./../x"] {
            assert!(
                matches!(normalize_relative(Path::new(p)), Err(ContainmentError::Escapes(_))),
                "{p} should escape"
            );
        }
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(matches!(
            normalize_relative(Path::new("/etc/passwd")),
            Err(ContainmentError::Absolute(_))
        ));
    }

    #[test]
    fn resolve_finds_files_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/page.html"), "hi").unwrap();

        let found = resolve_within(dir.path(), Path::new("sub/page.html")).unwrap();
        assert!(found.unwrap().ends_with("sub/page.html"));
        assert_eq!(resolve_within(dir.path(), Path::new("missing")).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "nope").unwrap();

        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let result = resolve_within(root.path(), Path::new("link/secret"));
        assert!(matches!(result, Err(ContainmentError::Escapes(_))));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_allows_symlink_inside_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("real.txt"), "ok").unwrap();
        std::os::unix::fs::symlink(root.path().join("real.txt"), root.path().join("alias.txt"))
            .unwrap();

        let found = resolve_within(root.path(), Path::new("alias.txt")).unwrap();
        assert!(found.unwrap().ends_with("real.txt"));
    }
}
