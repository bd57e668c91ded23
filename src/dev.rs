//! Populates the container's `/dev` once `Mount::apply` has run, and fixes
//! up PTY master ownership when the caller is unprivileged.

use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::waitpid;
use nix::unistd::{chown, fork, getegid, symlinkat, ForkResult, Gid, Uid};

use crate::error::Result;
use crate::sync::{Seq, SyncChannel};
use crate::usermap::{Kind, UserMap};

const DEVICE_NODES: &[&str] = &["console", "tty", "full", "null", "zero", "random", "urandom"];

/// Creates `/dev/ptmx`, bind-mounts the standard device nodes in from the
/// host, and symlinks the `/proc`-backed pseudo-devices.
pub fn setup_nodes(root_dir: &Path) -> Result<()> {
    let dev_dir = root_dir.join("dev");

    let old_umask = umask(Mode::empty());
    let result = setup_nodes_inner(root_dir, &dev_dir);
    umask(old_umask);
    result
}

fn setup_nodes_inner(root_dir: &Path, dev_dir: &Path) -> Result<()> {
    symlinkat("pts/ptmx", None, &dev_dir.join("ptmx"))?;

    for name in DEVICE_NODES {
        let target = dev_dir.join(name);
        std::fs::write(&target, "")?;
        mount(
            Some(Path::new("/dev").join(name).as_path()),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
    }

    for (name, proc_target) in [
        ("core", "/proc/kcore"),
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ] {
        let _ = std::fs::remove_file(dev_dir.join(name));
        symlinkat(proc_target, None, &dev_dir.join(name))?;
    }

    let _ = root_dir;
    Ok(())
}

/// Fixes up PTY master ownership so the container's mapped root user can
/// open its controlling terminal, when that root user isn't the host euid
/// that created it.
///
/// No-op if `user_map` has no mapping for container uid/gid 0 (nothing to
/// chown to). If the caller is already root, chowns directly. If the
/// caller's own euid is already the mapped root, the master is already
/// owned correctly. Otherwise the actual `chown` has to run as uid 0
/// *inside a namespace where 0 maps to the target root uid* — the kernel
/// refuses to chown a file to an id outside the caller's own user
/// namespace's map — so a helper is forked that unshares a fresh user
/// namespace, receives the corresponding id map from the parent, drops to
/// uid 0 within it via `setup_user("root")`, and only then calls `chown`.
pub fn setup_console_owner(pty_master: &std::fs::File, user_map: &UserMap) -> Result<()> {
    let Some((root_uid, root_gid)) = user_map.root_uid_gid() else {
        return Ok(());
    };

    let path = format!("/proc/self/fd/{}", pty_master.as_raw_fd());
    let host_uid = Uid::current();
    let host_gid = getegid();

    if host_uid.is_root() {
        chown(path.as_str(), Some(Uid::from_raw(root_uid)), Some(Gid::from_raw(root_gid)))?;
        return Ok(());
    }

    if root_uid == host_uid.as_raw() {
        return Ok(());
    }

    let meta = std::fs::metadata(&path)?;
    if meta.uid() == host_uid.as_raw() {
        let _ = chown(path.as_str(), None, Some(host_gid));
    }

    let mut helper_map = UserMap::new();
    helper_map.add_map(Kind::Uid, 0, root_uid, 1);
    helper_map.add_map(Kind::Uid, host_uid.as_raw(), host_uid.as_raw(), 1);
    helper_map.add_map(Kind::Gid, 0, root_gid, 1);
    helper_map.add_map(Kind::Gid, meta.gid(), root_gid + meta.gid(), 1);
    helper_map.add_map(Kind::Gid, host_gid.as_raw(), host_gid.as_raw(), 1);

    let (mut sync_parent, mut sync_child) = SyncChannel::create()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            let result = (|| -> Result<()> {
                unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUSER)?;
                sync_child.barrier(Seq::Start, Seq::Done)?;
                sync_child.close();
                crate::usermap::setup_user("root")?;
                chown(path.as_str(), Some(Uid::from_raw(0)), Some(Gid::from_raw(meta.gid())))?;
                Ok(())
            })();
            unsafe { libc::_exit(if result.is_ok() { 0 } else { 1 }) };
        }
        ForkResult::Parent { child } => {
            drop(sync_child);
            sync_parent.wait(Seq::Start)?;
            helper_map.apply(child.as_raw())?;
            sync_parent.wake(Seq::Done)?;
            waitpid(child, None)?;
        }
    }

    Ok(())
}
