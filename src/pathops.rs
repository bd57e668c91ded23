//! Path utilities shared by every component that must resolve a path against
//! an alternate filesystem root.

use std::cmp::Ordering;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use crate::error::{JailError, Result};

pub fn is_absolute(p: &str) -> bool {
    p.starts_with('/')
}

/// Orders absolute paths before relative ones, then compares path components
/// lexicographically, treating a path that is a strict prefix of another as
/// smaller (`/foo` < `/foo/bar`).
pub fn compare(a: &str, b: &str) -> Ordering {
    match (is_absolute(a), is_absolute(b)) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let mut ac = a.split('/').filter(|c| !c.is_empty());
    let mut bc = b.split('/').filter(|c| !c.is_empty());

    loop {
        match (ac.next(), bc.next()) {
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Joins `root` and `path`, collapsing duplicate slashes. Returns `path`
/// unchanged when `root` is empty, `/`, or equal to `path`.
pub fn prefix_root(root: &str, path: &str) -> String {
    if root.is_empty() || root == "/" || compare(root, path) == Ordering::Equal {
        return path.to_string();
    }

    let root = root.trim_end_matches('/');
    let path = if path.starts_with('/') { path } else {
        return path.to_string();
    };

    format!("{}{}", root, path)
}

/// Resolves `cmd` through `PATH`, optionally rooted at `rootfs`. Returns the
/// first entry for which the host-visible file is executable.
pub fn on_path(cmd: &str, rootfs: Option<&str>) -> Option<PathBuf> {
    if is_absolute(cmd) {
        let candidate = match rootfs {
            Some(root) => PathBuf::from(prefix_root(root, cmd)),
            None => PathBuf::from(cmd),
        };
        return if is_executable(&candidate) {
            Some(PathBuf::from(cmd))
        } else {
            None
        };
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }

        let rel = format!("{}/{}", dir.trim_end_matches('/'), cmd);

        let host_path = match rootfs {
            Some(root) => PathBuf::from(prefix_root(root, &rel)),
            None => PathBuf::from(&rel),
        };

        if is_executable(&host_path) {
            return Some(PathBuf::from(rel));
        }
    }

    None
}

fn is_executable(path: &Path) -> bool {
    let c = match CString::new(path.as_os_str().to_string_lossy().as_bytes()) {
        Ok(c) => c,
        Err(_) => return false,
    };

    unsafe { libc::access(c.as_ptr(), libc::X_OK) == 0 }
}

pub fn require_absolute(what: &str, path: &str) -> Result<()> {
    if !is_absolute(path) {
        return Err(JailError::usage(format!(
            "{} must be an absolute path, got: {}",
            what, path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_sorts_before_relative() {
        assert_eq!(compare("/foo", "bar"), Ordering::Less);
    }

    #[test]
    fn prefix_is_smaller() {
        assert_eq!(compare("/foo", "/foo/bar"), Ordering::Less);
        assert_eq!(compare("/foo/a", "/foo/aaa"), Ordering::Less);
    }

    #[test]
    fn equal_paths() {
        assert_eq!(compare("/foo/bar", "/foo/bar"), Ordering::Equal);
    }

    #[test]
    fn prefix_root_identity_cases() {
        assert_eq!(prefix_root("", "/a/b"), "/a/b");
        assert_eq!(prefix_root("/", "/a/b"), "/a/b");
        assert_eq!(prefix_root("/a/b", "/a/b"), "/a/b");
    }

    #[test]
    fn prefix_root_joins() {
        assert_eq!(prefix_root("/root", "/etc/hosts"), "/root/etc/hosts");
        assert_eq!(prefix_root("/root/", "/etc/hosts"), "/root/etc/hosts");
    }
}
