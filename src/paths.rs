//! Path translation between the local watched tree, the wire, and a user's
//! sandbox on the server.
//!
//! Wire paths are always `/`-separated and relative (no leading separator).
//! Local paths are converted component by component, so the separator used
//! to strip the watched root can never disagree with the one used to join on
//! the server side.

use anyhow::{anyhow, bail, Result};
use std::path::{Component, Path, PathBuf};

/// Wire separator
pub const SEP: char = '/';

/// Convert a relative filesystem path to its wire form.
pub fn to_wire(rel: &Path) -> String {
    let mut out = String::new();
    for component in rel.components() {
        if let Component::Normal(s) = component {
            if !out.is_empty() {
                out.push(SEP);
            }
            out.push_str(&s.to_string_lossy());
        }
    }
    out
}

/// Convert a wire path back to a relative filesystem path.
pub fn from_wire(wire: &str) -> PathBuf {
    wire.split(SEP).filter(|s| !s.is_empty()).collect()
}

/// Strip the watched root from an absolute local path, yielding its wire form.
/// Returns `None` for paths outside the root.
pub fn relative_to_root(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root).ok().map(to_wire)
}

/// Join two wire paths.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent, SEP, name)
    }
}

/// Prefix a root-relative wire path with the username (client -> server).
pub fn with_user(username: &str, rel: &str) -> String {
    join(username, rel)
}

/// Remove and verify the username prefix of an incoming wire path
/// (server side). The remainder may be empty (the user's root itself).
pub fn strip_user<'a>(username: &str, wire: &'a str) -> Result<&'a str> {
    let wire = wire.trim_start_matches(SEP);
    match wire.strip_prefix(username) {
        Some("") => Ok(""),
        Some(rest) if rest.starts_with(SEP) => Ok(rest.trim_start_matches(SEP)),
        _ => bail!("path {:?} is outside the sandbox of user {:?}", wire, username),
    }
}

/// Leaf name of a wire path.
pub fn file_name(wire: &str) -> &str {
    wire.rsplit(SEP).next().unwrap_or(wire)
}

/// Extension of a file name: text after the last '.', or "" when there is none.
pub fn extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) => &name[pos + 1..],
        None => "",
    }
}

/// Normalize a path to be safely under a root directory.
/// This prevents path traversal by:
/// 1. Rejecting absolute paths, parent directory components, and root/prefix components
/// 2. Rejecting NUL bytes in path
/// 3. On Windows, rejecting ':' in path components (ADS defense)
/// 4. Canonicalizing the deepest existing ancestor to resolve symlinks
/// 5. Ensuring the result is under the (canonical) root
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let path_str = p.to_string_lossy();
    if path_str.contains('\0') {
        bail!("path contains NUL byte");
    }

    // Build safe relative path
    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let canon_root = root
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize root {:?}: {}", root, e))?;

    // Canonicalize the deepest existing ancestor, then re-append the rest.
    // symlink_metadata keeps a dangling or escaping link in the existing part.
    let joined = canon_root.join(&safe);
    let mut existing = joined.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while std::fs::symlink_metadata(&existing).is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut final_path = existing
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", existing, e))?;
    for name in tail.into_iter().rev() {
        final_path.push(name);
    }

    if !final_path.starts_with(&canon_root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }

    Ok(final_path)
}

/// Resolve a root-relative wire path inside a sandbox directory.
pub fn resolve(sandbox: &Path, rel: &str) -> Result<PathBuf> {
    normalize_under_root(sandbox, &from_wire_checked(rel)?)
}

/// Like `from_wire`, but keeps `..`/absolute markers visible so the
/// normalizer can reject them.
fn from_wire_checked(wire: &str) -> Result<PathBuf> {
    if wire.starts_with(SEP) {
        bail!("absolute wire path {:?}", wire);
    }
    Ok(PathBuf::from(wire.replace(SEP, std::path::MAIN_SEPARATOR_STR)))
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn wire_form_uses_forward_slashes() {
        let rel: PathBuf = ["dir1", "dir2", "a.txt"].iter().collect();
        assert_eq!(to_wire(&rel), "dir1/dir2/a.txt");
        assert_eq!(from_wire("dir1/dir2/a.txt"), rel);
        assert_eq!(to_wire(Path::new("")), "");
    }

    // Stripping and joining must agree on the separator, or translated
    // paths silently point somewhere else.
    #[test]
    fn strip_then_join_is_consistent() {
        let root = PathBuf::from("/home/u/ClientDir");
        let local = root.join("docs").join("report.pdf");
        let rel = relative_to_root(&root, &local).unwrap();
        assert_eq!(rel, "docs/report.pdf");

        let wire = with_user("alice", &rel);
        assert_eq!(wire, "alice/docs/report.pdf");
        assert_eq!(strip_user("alice", &wire).unwrap(), rel);
        assert_eq!(root.join(from_wire(&rel)), local);
    }

    #[test]
    fn root_itself_is_empty_relative_path() {
        let root = PathBuf::from("/data/root");
        assert_eq!(relative_to_root(&root, &root).unwrap(), "");
        assert_eq!(with_user("bob", ""), "bob");
        assert_eq!(strip_user("bob", "bob").unwrap(), "");
        assert!(relative_to_root(&root, Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn strip_user_rejects_foreign_prefix() {
        assert!(strip_user("bob", "alice/a.txt").is_err());
        // "bobby" must not be accepted as "bob" + "by"
        assert!(strip_user("bob", "bobby/a.txt").is_err());
    }

    #[test]
    fn name_and_extension() {
        assert_eq!(file_name("a/b/c.tar.gz"), "c.tar.gz");
        assert_eq!(file_name("c"), "c");
        assert_eq!(extension("c.tar.gz"), "gz");
        assert_eq!(extension("Makefile"), "");
        assert_eq!(extension(".bashrc"), "bashrc");
    }

    #[test]
    fn test_normalize_under_root_safe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let canon = root.canonicalize().unwrap();

        let result = normalize_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert!(result.starts_with(&canon));
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(root, Path::new("./subdir/./file.txt")).unwrap();
        assert!(result.ends_with("subdir/file.txt"));
    }

    #[test]
    fn test_normalize_under_root_unsafe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        assert!(normalize_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("subdir/../../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("/etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("file\0.txt")).is_err());
    }

    #[test]
    fn resolve_rejects_absolute_and_parent_wire_paths() {
        let temp_dir = TempDir::new().unwrap();
        assert!(resolve(temp_dir.path(), "/etc/passwd").is_err());
        assert!(resolve(temp_dir.path(), "a/../../x").is_err());
        let ok = resolve(temp_dir.path(), "a/b/c.txt").unwrap();
        assert!(ok.ends_with("a/b/c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        assert!(normalize_under_root(root, Path::new("link/file.txt")).is_err());
        assert!(normalize_under_root(root, Path::new("link/new/deeper.txt")).is_err());
    }

    #[test]
    fn test_normalize_existing_file_is_canonical() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let subdir = root.join("subdir");
        fs::create_dir(&subdir).unwrap();
        let file = subdir.join("file.txt");
        fs::write(&file, "test").unwrap();

        let result = normalize_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert_eq!(result, file.canonicalize().unwrap());
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");

        assert!(!file_path.parent().unwrap().exists());
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().is_dir());
        // Idempotent
        ensure_parent_exists(&file_path).unwrap();
    }
}
