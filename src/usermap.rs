//! User/group id map assembly and application, plus dropping privileges to
//! the requested in-container user.

use std::process::Command;

use nix::unistd::{setgroups, setresgid, setresuid, Gid, Uid};

use crate::error::{JailError, Result};
use crate::pathops::on_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Uid,
    Gid,
}

#[derive(Debug, Clone)]
pub struct IdMapEntry {
    pub kind: Kind,
    pub container_id: u32,
    pub host_id: u32,
    pub count: u32,
}

#[derive(Default)]
pub struct UserMap {
    uid_entries: Vec<IdMapEntry>,
    gid_entries: Vec<IdMapEntry>,
}

impl UserMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_map(&mut self, kind: Kind, container_id: u32, host_id: u32, count: u32) {
        let entry = IdMapEntry {
            kind,
            container_id,
            host_id,
            count,
        };
        match kind {
            Kind::Uid => self.uid_entries.push(entry),
            Kind::Gid => self.gid_entries.push(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.uid_entries.is_empty() && self.gid_entries.is_empty()
    }

    /// The host id the container's uid/gid 0 is mapped to, if both a uid and
    /// a gid entry for container id 0 were configured.
    pub fn root_uid_gid(&self) -> Option<(u32, u32)> {
        let uid = self.uid_entries.iter().find(|e| e.container_id == 0)?.host_id;
        let gid = self.gid_entries.iter().find(|e| e.container_id == 0)?.host_id;
        Some((uid, gid))
    }

    pub fn uid_entries(&self) -> &[IdMapEntry] {
        &self.uid_entries
    }

    pub fn gid_entries(&self) -> &[IdMapEntry] {
        &self.gid_entries
    }

    /// Writes the id maps for `pid`. Uses `newuidmap`/`newgidmap` when
    /// running unprivileged (and present on `PATH`); otherwise writes
    /// `/proc/<pid>/{uid,gid}_map` directly, which requires euid 0.
    pub fn apply(&self, pid: i32) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        if let Some(newuidmap) = on_path("newuidmap", None) {
            let newgidmap = on_path("newgidmap", None).ok_or_else(|| {
                JailError::config("found newuidmap but not newgidmap on PATH")
            })?;

            run_helper(&newuidmap, pid, &self.uid_entries)?;
            run_helper(&newgidmap, pid, &self.gid_entries)?;
            return Ok(());
        }

        if !Uid::effective().is_root() {
            return Err(JailError::config(
                "unprivileged id mapping requires the newuidmap/newgidmap helpers on PATH",
            ));
        }

        std::fs::write(format!("/proc/{}/setgroups", pid), "deny")?;
        write_map(pid, "uid_map", &self.uid_entries)?;
        write_map(pid, "gid_map", &self.gid_entries)?;

        Ok(())
    }
}

fn run_helper(bin: &std::path::Path, pid: i32, entries: &[IdMapEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut args = vec![pid.to_string()];
    for e in entries {
        args.push(e.container_id.to_string());
        args.push(e.host_id.to_string());
        args.push(e.count.to_string());
    }

    let status = Command::new(bin).args(&args).status()?;
    if !status.success() {
        return Err(JailError::config(format!(
            "{} exited with {}",
            bin.display(),
            status
        )));
    }

    Ok(())
}

/// Serializes entries to the newline format consumed by
/// `/proc/<pid>/{u,g}id_map`: one `container_id host_id count` line per
/// entry, in insertion order.
pub fn format_entries(entries: &[IdMapEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        out.push_str(&format!("{} {} {}\n", e.container_id, e.host_id, e.count));
    }
    out
}

/// Parses the same format back into entries of the given kind.
pub fn parse_entries(kind: Kind, text: &str) -> Vec<IdMapEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let container_id = parts.next()?.parse().ok()?;
            let host_id = parts.next()?.parse().ok()?;
            let count = parts.next()?.parse().ok()?;
            Some(IdMapEntry {
                kind,
                container_id,
                host_id,
                count,
            })
        })
        .collect()
}

fn write_map(pid: i32, file: &str, entries: &[IdMapEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    std::fs::write(format!("/proc/{}/{}", pid, file), format_entries(entries))?;
    Ok(())
}

pub fn get_uid_gid(user: &str) -> Result<(u32, u32)> {
    if user == "root" {
        return Ok((0, 0));
    }

    let entry = nix::unistd::User::from_name(user)
        .map_err(JailError::System)?
        .ok_or_else(|| JailError::usage(format!("unknown user: {}", user)))?;

    Ok((entry.uid.as_raw(), entry.gid.as_raw()))
}

/// Child-side: resolves `name`, switches to its uid/gid, and clears
/// ancillary groups. Must run after the id maps have been installed by the
/// parent.
pub fn setup_user(name: &str) -> Result<()> {
    let (uid, gid) = get_uid_gid(name)?;

    setresgid(Gid::from_raw(gid), Gid::from_raw(gid), Gid::from_raw(gid))?;
    setresuid(Uid::from_raw(uid), Uid::from_raw(uid), Uid::from_raw(uid))?;
    setgroups(&[])?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_proc_format() {
        let mut map = UserMap::new();
        map.add_map(Kind::Uid, 0, 1000, 1);
        map.add_map(Kind::Uid, 1, 100000, 65536);

        let text = format_entries(map.uid_entries());
        let parsed = parse_entries(Kind::Uid, &text);

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].host_id, 1000);
        assert_eq!(parsed[1].host_id, 100000);
        assert_eq!(parsed[1].count, 65536);
    }

    #[test]
    fn root_resolves_without_passwd_lookup() {
        assert_eq!(get_uid_gid("root").unwrap(), (0, 0));
    }

    #[test]
    fn root_uid_gid_needs_both_vectors_mapped() {
        let mut map = UserMap::new();
        assert_eq!(map.root_uid_gid(), None);

        map.add_map(Kind::Uid, 0, 100000, 65536);
        assert_eq!(map.root_uid_gid(), None);

        map.add_map(Kind::Gid, 0, 100000, 65536);
        assert_eq!(map.root_uid_gid(), Some((100000, 100000)));
    }
}
