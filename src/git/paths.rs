//! Repository name → on-disk path resolution.
//!
//! Names arrive from URLs and SSH command lines.  They are normalised to a
//! single `<name>.git` directory under the repository root, and the result
//! is checked for containment after symlinks are followed.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Suffix carried by every bare repository directory.
pub const REPO_SUFFIX: &str = ".git";

/// Strip surrounding slashes and the `.git` suffix from a client-supplied
/// name.  `"/acme.git"` and `"acme"` both become `"acme"`.
pub fn normalize_name(name: &str) -> &str {
    let name = name.trim_matches('/');
    name.strip_suffix(REPO_SUFFIX).unwrap_or(name)
}

/// Map `name` to its bare repository directory inside `root`.
///
/// The returned path is not required to exist.  When it (or any ancestor
/// below `root`) exists, the canonical form must still live under the
/// canonical root, so a symlinked repository cannot point outside it.
pub fn resolve(root: &Path, name: &str) -> Result<PathBuf> {
    let invalid = || Error::InvalidPath(name.to_string());

    let base = normalize_name(name);
    if base.is_empty()
        || base.contains("..")
        || base.contains(['/', '\\', '\0'])
        || base.starts_with('.')
    {
        return Err(invalid());
    }

    let relative = PathBuf::from(format!("{base}{REPO_SUFFIX}"));
    let mut components = relative.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(invalid()),
    }

    let joined = root.join(&relative);
    if !joined.starts_with(root) {
        return Err(invalid());
    }

    // Symlink check: only meaningful once something exists on disk.
    if joined.exists() {
        let canonical_root = root.canonicalize().map_err(|_| invalid())?;
        let canonical = joined.canonicalize().map_err(|_| invalid())?;
        if !canonical.starts_with(&canonical_root) {
            return Err(invalid());
        }
        return Ok(canonical);
    }

    Ok(joined)
}

/// Repository display name for a directory under the root.
pub fn repo_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    normalize_name(&file).to_string()
}

// ---------------------------------------------------------------------------
// Ref allow-list
// ---------------------------------------------------------------------------

/// Refs accepted by archive generation: `[A-Za-z0-9._/-]+`, no `..`, and no
/// leading `-` so a ref can never be parsed as a git option.
pub fn is_valid_ref(reference: &str) -> bool {
    !reference.is_empty()
        && !reference.contains("..")
        && !reference.starts_with('-')
        && reference
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn resolve_appends_suffix_once() {
        let root = Path::new("/srv/git");
        assert_eq!(
            resolve(root, "widgets").unwrap(),
            PathBuf::from("/srv/git/widgets.git")
        );
        assert_eq!(
            resolve(root, "widgets.git").unwrap(),
            PathBuf::from("/srv/git/widgets.git")
        );
        assert_eq!(
            resolve(root, "/widgets.git").unwrap(),
            PathBuf::from("/srv/git/widgets.git")
        );
    }

    #[test]
    fn resolve_rejects_traversal_and_empty() {
        let root = Path::new("/srv/git");
        for name in ["", "/", ".git", "..", "../etc", "a/../b", "/etc/passwd", "a/b", "..git", "x\0y"] {
            assert!(
                matches!(resolve(root, name), Err(Error::InvalidPath(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape.git")).unwrap();
        assert!(matches!(
            resolve(root.path(), "escape"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn repo_name_strips_suffix() {
        assert_eq!(repo_name(Path::new("/srv/git/widgets.git")), "widgets");
        assert_eq!(repo_name(Path::new("/srv/git/plain")), "plain");
    }

    #[test]
    fn valid_refs() {
        for r in ["main", "v1.0.0", "feature/x-y_z", "a1b2c3d4"] {
            assert!(is_valid_ref(r), "{r}");
        }
        for r in ["", "..", "main..dev", "a b", "--output=/tmp/x", "-v", "ref;rm", "x$(id)"] {
            assert!(!is_valid_ref(r), "{r}");
        }
    }

    proptest! {
        #[test]
        fn traversal_never_resolves(prefix in "[a-z/]{0,8}", suffix in "[a-z/]{0,8}") {
            let root = Path::new("/srv/git");
            let name = format!("{prefix}..{suffix}");
            prop_assert!(resolve(root, &name).is_err());
        }

        #[test]
        fn resolved_paths_stay_under_root(name in "[ -~]{0,24}") {
            let root = Path::new("/srv/git");
            if let Ok(path) = resolve(root, &name) {
                prop_assert!(path.starts_with(root));
                prop_assert_eq!(path.parent(), Some(root));
            }
        }

        #[test]
        fn refs_outside_charset_rejected(r in ".*[^A-Za-z0-9._/-].*") {
            prop_assert!(!is_valid_ref(&r));
        }
    }
}
