//! Mount spec grammar, the in-memory mount list, and its ordered application
//! inside the child's freshly unshared mount namespace.

use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::error::{JailError, Result};
use crate::pathops::require_absolute;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    Aufs,
    Overlay,
}

#[derive(Debug, Clone)]
pub struct Overlay {
    pub upper: String,
    pub work: String,
    pub kind: OverlayKind,
}

#[derive(Debug, Clone)]
pub enum MountKind {
    Bind { read_only: bool },
    Tmpfs { data: String },
    Overlay { spec: Overlay },
    /// Internal, non-user-specifiable entries used to build the standard set.
    Fixed {
        source: Option<&'static str>,
        /// Whether `source` is resolved against `root_dir` (the `/proc/sys`
        /// self-bind, binding the container's own fresh `/proc/sys` onto
        /// itself so it can be remounted read-only independently) or used
        /// literally as a host path (the `/sys` bind, which needs the real
        /// host sysfs, not a no-op self-bind under an as-yet-unpopulated
        /// chroot).
        source_root_relative: bool,
        typ: &'static str,
        flags: MsFlags,
        data: String,
    },
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: Option<String>,
    pub destination: String,
    pub kind: MountKind,
}

impl MountEntry {
    pub fn bind(src: &str, dst: &str, read_only: bool) -> Result<Self> {
        require_absolute("bind source", src)?;
        require_absolute("bind destination", dst)?;
        Ok(Self {
            source: Some(src.to_string()),
            destination: dst.to_string(),
            kind: MountKind::Bind { read_only },
        })
    }

    pub fn tmp(dst: &str) -> Result<Self> {
        require_absolute("tmp destination", dst)?;
        Ok(Self {
            source: None,
            destination: dst.to_string(),
            kind: MountKind::Tmpfs { data: String::new() },
        })
    }

    /// `lower` is never caller-supplied: it is always the destination
    /// resolved against the container root at apply time, so it isn't a
    /// parameter here.
    pub fn overlay(upper: &str, dst: &str, work: &str, kind: OverlayKind) -> Result<Self> {
        require_absolute("overlay upper", upper)?;
        require_absolute("overlay destination", dst)?;
        require_absolute("overlay work", work)?;

        if kind == OverlayKind::Overlay && upper == work {
            return Err(JailError::usage(
                "overlay upper and work directories must not share a path",
            ));
        }

        Ok(Self {
            source: None,
            destination: dst.to_string(),
            kind: MountKind::Overlay {
                spec: Overlay {
                    upper: upper.to_string(),
                    work: work.to_string(),
                    kind,
                },
            },
        })
    }
}

/// Parses the colon-separated grammar:
/// `bind:SRC:DST` | `bind-ro:SRC:DST` | `overlay:UPPER:DST:WORK` | `tmp:DST`.
pub fn parse(spec: &str) -> Result<MountEntry> {
    let parts: Vec<&str> = spec.split(':').collect();

    match parts.as_slice() {
        ["bind", src, dst] => MountEntry::bind(src, dst, false),
        ["bind-ro", src, dst] => MountEntry::bind(src, dst, true),
        ["overlay", upper, dst, work] => {
            MountEntry::overlay(upper, dst, work, OverlayKind::Overlay)
        }
        ["tmp", dst] => MountEntry::tmp(dst),
        _ => Err(JailError::usage(format!("unrecognized mount spec: {}", spec))),
    }
}

pub fn emit(entry: &MountEntry) -> String {
    match &entry.kind {
        MountKind::Bind { read_only: false } => {
            format!("bind:{}:{}", entry.source.as_deref().unwrap_or(""), entry.destination)
        }
        MountKind::Bind { read_only: true } => {
            format!("bind-ro:{}:{}", entry.source.as_deref().unwrap_or(""), entry.destination)
        }
        MountKind::Tmpfs { .. } => format!("tmp:{}", entry.destination),
        MountKind::Overlay { spec, .. } => {
            format!("overlay:{}:{}:{}", spec.upper, entry.destination, spec.work)
        }
        MountKind::Fixed { .. } => String::new(),
    }
}

/// Ordered, owned list of user-supplied mounts, plus the optional ephemeral
/// overlay entry that (per the apply-phase ordering) must land before the
/// standard set and before every user entry. `apply` drains the whole
/// sequence once inside the child's mount namespace.
#[derive(Default)]
pub struct MountList {
    ephemeral: Option<MountEntry>,
    entries: Vec<MountEntry>,
}

impl MountList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: MountEntry) {
        self.entries.push(entry);
    }

    fn fixed(
        source: Option<&'static str>,
        source_root_relative: bool,
        destination: &str,
        typ: &'static str,
        flags: MsFlags,
        data: &str,
    ) -> MountEntry {
        MountEntry {
            source: None,
            destination: destination.to_string(),
            kind: MountKind::Fixed {
                source,
                source_root_relative,
                typ,
                flags,
                data: data.to_string(),
            },
        }
    }

    /// Builds an ephemeral overlay layering a fresh tmpfs over `/` for the
    /// session, given a scratch directory the caller created before `clone`.
    pub fn add_ephemeral(&mut self, scratch_dir: &Path) {
        let root = scratch_dir.join("root");
        let work = scratch_dir.join("work");
        std::fs::create_dir_all(&root).ok();
        std::fs::create_dir_all(&work).ok();

        self.ephemeral = Some(MountEntry {
            source: None,
            destination: "/".to_string(),
            kind: MountKind::Overlay {
                spec: Overlay {
                    upper: root.to_string_lossy().to_string(),
                    work: work.to_string_lossy().to_string(),
                    kind: OverlayKind::Overlay,
                },
            },
        });
    }

    fn standard_set() -> Vec<MountEntry> {
        vec![
            Self::fixed(None, false, "/proc", "proc", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV, ""),
            Self::fixed(Some("/proc/sys"), true, "/proc/sys", "", MsFlags::MS_BIND, ""),
            Self::fixed(
                None,
                false,
                "/proc/sys",
                "",
                MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT,
                "",
            ),
            Self::fixed(
                Some("/sys"),
                false,
                "/sys",
                "",
                MsFlags::MS_REC | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                "",
            ),
            Self::fixed(None, false, "/dev", "tmpfs", MsFlags::MS_NOSUID, "mode=755"),
            Self::fixed(
                None,
                false,
                "/dev/pts",
                "devpts",
                MsFlags::empty(),
                "newinstance,ptmxmode=0666,mode=0620,gid=5",
            ),
            Self::fixed(None, false, "/dev/shm", "tmpfs", MsFlags::empty(), "mode=1777"),
            Self::fixed(None, false, "/run", "tmpfs", MsFlags::empty(), "mode=755"),
            Self::fixed(None, false, "/sys/fs/cgroup", "cgroup2", MsFlags::empty(), ""),
        ]
    }

    /// Applies every mount in order, resolving destinations against
    /// `root_dir`. Must run after the caller has already remounted `/` as
    /// `MS_SLAVE|MS_REC` and bind-mounted/chrooted into `root_dir` as
    /// appropriate for the remaining (user) entries.
    pub fn apply(&self, root_dir: &Path) -> Result<()> {
        if let Some(ephemeral) = &self.ephemeral {
            apply_one(root_dir, ephemeral)?;
        }

        for entry in &Self::standard_set() {
            apply_one(root_dir, entry)?;
        }

        for entry in &self.entries {
            apply_one(root_dir, entry)?;
        }

        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter()
    }
}

fn resolve(root_dir: &Path, destination: &str) -> PathBuf {
    root_dir.join(destination.trim_start_matches('/'))
}

fn ensure_destination(target: &Path, source: Option<&str>) -> Result<()> {
    if target.exists() {
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let source_is_file = source
        .map(|s| !Path::new(s).is_dir())
        .unwrap_or(false);

    if source_is_file {
        std::fs::write(target, "")?;
    } else {
        match std::fs::create_dir(target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn apply_one(root_dir: &Path, entry: &MountEntry) -> Result<()> {
    let target = resolve(root_dir, &entry.destination);

    match &entry.kind {
        MountKind::Bind { read_only } => {
            let source = entry.source.as_deref().unwrap();
            ensure_destination(&target, Some(source))?;

            mount(
                Some(source),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )?;

            if *read_only {
                mount(
                    None::<&str>,
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )?;
            }
        }
        MountKind::Tmpfs { data } => {
            ensure_destination(&target, None)?;
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::empty(),
                Some(data.as_str()),
            )?;
        }
        MountKind::Overlay { spec } => {
            ensure_destination(&target, None)?;
            std::fs::create_dir_all(&spec.upper)?;
            std::fs::create_dir_all(&spec.work)?;

            let lower = target.to_string_lossy();

            let (typ, data) = match spec.kind {
                OverlayKind::Overlay => (
                    "overlay",
                    format!(
                        "upperdir={},lowerdir={},workdir={}",
                        spec.upper, lower, spec.work
                    ),
                ),
                OverlayKind::Aufs => (
                    "aufs",
                    format!("br:{}=rw:{}=ro", spec.upper, lower),
                ),
            };

            mount(Some(typ), &target, Some(typ), MsFlags::empty(), Some(data.as_str()))?;
        }
        MountKind::Fixed { source, source_root_relative, typ, flags, data } => {
            ensure_destination(&target, None)?;
            let source_path = source.map(|s| {
                if *source_root_relative {
                    resolve(root_dir, s)
                } else {
                    PathBuf::from(s)
                }
            });
            let source_opt = source_path.as_deref();
            let typ_opt = if typ.is_empty() { None } else { Some(*typ) };
            let data_opt = if data.is_empty() { None } else { Some(data.as_str()) };
            mount(source_opt, &target, typ_opt, *flags, data_opt)?;
        }
    }

    Ok(())
}

/// Remounts `/` as `MS_SLAVE|MS_REC` so none of the following mounts
/// propagate back to the host.
pub fn isolate_propagation() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bind() {
        let e = parse("bind:/src:/dst").unwrap();
        assert_eq!(emit(&e), "bind:/src:/dst");
    }

    #[test]
    fn parse_bind_ro() {
        let e = parse("bind-ro:/src:/dst").unwrap();
        assert_eq!(emit(&e), "bind-ro:/src:/dst");
    }

    #[test]
    fn parse_tmp() {
        let e = parse("tmp:/tmp").unwrap();
        assert_eq!(emit(&e), "tmp:/tmp");
    }

    #[test]
    fn parse_overlay() {
        let e = parse("overlay:/upper:/dst:/work").unwrap();
        assert_eq!(emit(&e), "overlay:/upper:/dst:/work");
    }

    #[test]
    fn rejects_non_absolute() {
        assert!(parse("bind:src:/dst").is_err());
        assert!(parse("tmp:relative").is_err());
    }

    #[test]
    fn overlay_rejects_sharing_paths() {
        assert!(MountEntry::overlay("/a", "/dst", "/a", OverlayKind::Overlay).is_err());
    }

    #[test]
    fn standard_set_matches_spec_order() {
        let destinations: Vec<String> = MountList::standard_set()
            .iter()
            .map(|e| e.destination.clone())
            .collect();
        assert_eq!(
            destinations,
            vec![
                "/proc",
                "/proc/sys",
                "/proc/sys",
                "/sys",
                "/dev",
                "/dev/pts",
                "/dev/shm",
                "/run",
                "/sys/fs/cgroup",
            ]
        );
    }

    #[test]
    fn proc_sys_bind_is_self_referential_and_root_relative() {
        let entries = MountList::standard_set();
        let bind = &entries[1];
        match &bind.kind {
            MountKind::Fixed { source, source_root_relative, .. } => {
                assert_eq!(*source, Some("/proc/sys"));
                assert!(*source_root_relative);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn sys_bind_uses_the_literal_host_path() {
        let entries = MountList::standard_set();
        let bind = &entries[3];
        match &bind.kind {
            MountKind::Fixed { source, source_root_relative, .. } => {
                assert_eq!(*source, Some("/sys"));
                assert!(!*source_root_relative);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn ephemeral_does_not_touch_user_entries() {
        let scratch = std::env::temp_dir().join(format!("jail-mount-test-{}", std::process::id()));
        let mut list = MountList::new();
        list.push(MountEntry::tmp("/run/user").unwrap());
        list.add_ephemeral(&scratch);
        assert_eq!(list.entries.len(), 1);
        assert!(list.ephemeral.is_some());
        let _ = std::fs::remove_dir_all(&scratch);
    }
}
