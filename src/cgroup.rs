//! Cgroup controller subtree creation, pid enrollment, and teardown.

use std::path::PathBuf;

use log::warn;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CgroupSpec {
    pub controller: String,
}

/// A created, enrolled cgroup tree, named `pflask.<pid>` under the
/// controller's hierarchy.
pub struct Cgroup {
    dir: PathBuf,
}

impl CgroupSpec {
    pub fn new(controller: &str) -> Self {
        Self {
            controller: controller.to_string(),
        }
    }

    fn group_name(pid: i32) -> String {
        format!("pflask.{}", pid)
    }

    /// Creates `/sys/fs/cgroup/<controller>/<name>` (tolerating `EEXIST`)
    /// and enrolls `pid` by writing it into the tree's `tasks` file.
    pub fn setup(&self, pid: i32) -> Result<Cgroup> {
        let dir = PathBuf::from("/sys/fs/cgroup")
            .join(&self.controller)
            .join(Self::group_name(pid));

        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        std::fs::write(dir.join("tasks"), format!("{}\n", pid))?;

        Ok(Cgroup { dir })
    }
}

impl Cgroup {
    /// Best-effort: failures here are logged and swallowed rather than
    /// propagated.
    pub fn clean(self) {
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            warn!("failed to remove cgroup {}: {}", self.dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_includes_pid() {
        assert_eq!(CgroupSpec::group_name(42), "pflask.42");
    }
}
