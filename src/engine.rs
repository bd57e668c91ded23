//! Argument collation, the clone-with-flags boundary, and the parent/child
//! state machine that drives everything else.

use std::ffi::CString;
use std::os::fd::{AsFd, FromRawFd, IntoRawFd};
use std::os::raw::c_void;

use nix::mount::mount;
use nix::sched::CloneFlags;
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, Id as WaitId, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, sethostname, setsid, Pid};

use crate::cgroup::{Cgroup, CgroupSpec};
use crate::cli::Args;
use crate::error::{JailError, Result};
use crate::mount::{self, MountList};
use crate::netif::NetifSpec;
use crate::pathops::require_absolute;
use crate::sync::{Seq, SyncChannel};
use crate::usermap::UserMap;
use crate::{caps, dev, machinereg, pty};

pub struct Config {
    pub mounts: MountList,
    pub netifs: Vec<NetifSpec>,
    pub user: String,
    pub user_map: UserMap,
    pub chroot: Option<String>,
    pub ephemeral: bool,
    pub chdir: Option<String>,
    pub cgroups: Vec<CgroupSpec>,
    pub caps: Vec<caps::CapAction>,
    pub detach: bool,
    pub attach: Option<i32>,
    pub setenv: Vec<(String, String)>,
    pub keepenv: bool,
    pub hostname: Option<String>,
    pub clone_flags: CloneFlags,
    pub command: Vec<String>,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self> {
        let mut mounts = MountList::new();
        for spec in &args.mounts {
            mounts.push(mount::parse(spec)?);
        }

        let netifs = args
            .netifs
            .iter()
            .map(|s| crate::netif::parse(s))
            .collect::<Result<Vec<_>>>()?;

        let mut user_map = UserMap::new();
        for spec in &args.user_maps {
            let parts: Vec<&str> = spec.split(':').collect();
            let [container_id, host_id, count] = parts.as_slice() else {
                return Err(JailError::usage(format!("malformed user-map: {}", spec)));
            };
            let container_id: u32 = container_id
                .parse()
                .map_err(|_| JailError::usage(format!("malformed user-map: {}", spec)))?;
            let host_id: u32 = host_id
                .parse()
                .map_err(|_| JailError::usage(format!("malformed user-map: {}", spec)))?;
            let count: u32 = count
                .parse()
                .map_err(|_| JailError::usage(format!("malformed user-map: {}", spec)))?;
            user_map.add_map(crate::usermap::Kind::Uid, container_id, host_id, count);
            user_map.add_map(crate::usermap::Kind::Gid, container_id, host_id, count);
        }

        if let Some(dir) = &args.chroot {
            require_absolute("--chroot", dir)?;
        }

        let cgroups = args.cgroups.iter().map(|c| CgroupSpec::new(c)).collect();
        let caps = match &args.caps {
            Some(spec) => caps::parse(spec)?,
            None => Vec::new(),
        };

        let setenv = args
            .setenv
            .iter()
            .map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| JailError::usage(format!("malformed --setenv: {}", kv)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut clone_flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWUTS;
        if !user_map.is_empty() {
            clone_flags |= CloneFlags::CLONE_NEWUSER;
        }
        if !netifs.is_empty() {
            clone_flags |= CloneFlags::CLONE_NEWNET;
        }
        if args.no_userns {
            clone_flags.remove(CloneFlags::CLONE_NEWUSER);
        }
        if args.no_mountns {
            clone_flags.remove(CloneFlags::CLONE_NEWNS);
        }
        if args.no_netns {
            clone_flags.remove(CloneFlags::CLONE_NEWNET);
        }
        if args.no_ipcns {
            clone_flags.remove(CloneFlags::CLONE_NEWIPC);
        }
        if args.no_utsns {
            clone_flags.remove(CloneFlags::CLONE_NEWUTS);
        }
        if args.no_pidns {
            clone_flags.remove(CloneFlags::CLONE_NEWPID);
        }

        Ok(Config {
            mounts,
            netifs,
            user: args.user,
            user_map,
            chroot: args.chroot,
            ephemeral: args.ephemeral,
            chdir: args.chdir,
            cgroups,
            caps,
            detach: args.detach,
            attach: args.attach,
            setenv,
            keepenv: args.keepenv,
            hostname: args.hostname,
            clone_flags,
            command: args.command,
        })
    }
}

/// Entry point. Returns the process exit code.
pub fn run(config: Config) -> Result<i32> {
    if let Some(pid) = config.attach {
        let master = pty::attach(pid)?;
        pty::process(master.as_fd())?;
        return Ok(0);
    }

    let (master, slave_path, term_attr, winsize) = pty::open_master()?;
    let master: std::fs::File = unsafe { std::fs::File::from_raw_fd(master.into_raw_fd()) };

    if config.detach {
        crate::logging::init_syslog();
        nix::unistd::daemon(false, false)?;
    }

    let (mut sync_parent, sync_child) = SyncChannel::create()?;

    let scratch_dir = if config.ephemeral {
        Some(mkdtemp_scratch()?)
    } else {
        None
    };

    let pid = spawn_child(
        &config,
        sync_child,
        &slave_path,
        &term_attr,
        &winsize,
        scratch_dir.as_deref(),
    )?;

    run_parent(config, pid, &mut sync_parent, master, scratch_dir)
}

fn mkdtemp_scratch() -> Result<std::path::PathBuf> {
    let template = CString::new("/tmp/jail-ephemeral-XXXXXX").unwrap();
    let mut buf = template.into_bytes_with_nul();
    let ptr = unsafe { libc::mkdtemp(buf.as_mut_ptr() as *mut libc::c_char) };
    if ptr.is_null() {
        return Err(JailError::System(nix::Error::last()));
    }
    buf.pop();
    Ok(std::path::PathBuf::from(String::from_utf8(buf).unwrap()))
}

struct CloneArg {
    config: *const Config,
    sync_child: Option<crate::sync::SyncChild>,
    slave_path: String,
    term_attr: nix::sys::termios::Termios,
    winsize: libc::winsize,
    scratch_dir: Option<std::path::PathBuf>,
}

extern "C" fn clone_trampoline(arg: *mut c_void) -> i32 {
    let boxed = unsafe { Box::from_raw(arg as *mut CloneArg) };
    match run_child(*boxed) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    }
}

fn spawn_child(
    config: &Config,
    sync_child: crate::sync::SyncChild,
    slave_path: &str,
    term_attr: &nix::sys::termios::Termios,
    winsize: &libc::winsize,
    scratch_dir: Option<&std::path::Path>,
) -> Result<Pid> {
    let arg = Box::new(CloneArg {
        config: config as *const Config,
        sync_child: Some(sync_child),
        slave_path: slave_path.to_string(),
        term_attr: term_attr.clone(),
        winsize: *winsize,
        scratch_dir: scratch_dir.map(|p| p.to_path_buf()),
    });
    let arg_ptr = Box::into_raw(arg) as *mut c_void;

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE].into_boxed_slice();
    let stack_top = unsafe { stack.as_mut_ptr().add(STACK_SIZE) as *mut c_void };

    let mut flags = config.clone_flags.bits() | libc::SIGCHLD;
    let mut pid = unsafe { libc::clone(clone_trampoline, stack_top, flags, arg_ptr) };

    if pid < 0 {
        let err = nix::Error::last();
        if err == nix::Error::EINVAL && config.clone_flags.contains(CloneFlags::CLONE_NEWUSER) {
            // Retry once without NEWUSER, re-boxing a fresh arg since the
            // failed clone() never ran the trampoline to consume it.
            let retry_flags = (config.clone_flags - CloneFlags::CLONE_NEWUSER).bits();
            flags = retry_flags | libc::SIGCHLD;
            pid = unsafe { libc::clone(clone_trampoline, stack_top, flags, arg_ptr) };
        }
        if pid < 0 {
            return Err(JailError::System(nix::Error::last()));
        }
    }

    std::mem::forget(stack);
    Ok(Pid::from_raw(pid))
}

fn run_child(arg: CloneArg) -> Result<()> {
    let config = unsafe { &*arg.config };
    let mut sync_child = arg.sync_child.unwrap();

    prctl::set_pdeathsig(Signal::SIGKILL)?;
    setsid()?;

    // Tells the parent the child's namespaces are up, then waits for it to
    // finish writing the id maps and moving netifs/cgroup membership in.
    sync_child.barrier(Seq::Start, Seq::Done)?;
    sync_child.close();

    pty::open_slave(&arg.slave_path, &arg.term_attr, &arg.winsize)?;

    if let Some(hostname) = &config.hostname {
        sethostname(hostname)?;
    }

    if let Some(scratch) = &arg.scratch_dir {
        mount(
            Some("tmpfs"),
            scratch,
            Some("tmpfs"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )?;
    }

    crate::mount::isolate_propagation()?;

    let mut mount_list = MountList::new();
    for entry in config.mounts.iter() {
        mount_list.push(entry.clone());
    }
    if let Some(scratch) = &arg.scratch_dir {
        mount_list.add_ephemeral(scratch);
    }

    let root_dir = config
        .chroot
        .as_deref()
        .map(std::path::Path::new)
        .unwrap_or_else(|| std::path::Path::new("/"));

    mount_list.apply(root_dir)?;

    if let Some(chroot_dir) = &config.chroot {
        dev::setup_nodes(std::path::Path::new(chroot_dir))?;
        chdir(chroot_dir.as_str())?;
        chroot(".")?;
        chdir("/")?;
    }

    if config.clone_flags.contains(CloneFlags::CLONE_NEWNET) {
        crate::netif::loopback_up()?;
    }

    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o022));

    if !config.caps.is_empty() {
        caps::apply(&config.caps)?;
    }

    if let Some(dir) = &config.chdir {
        chdir(dir.as_str())?;
    }

    // Dropping to the target user is the last privileged step: it must run
    // after every mount/chroot/cap operation that still needs root.
    crate::usermap::setup_user(&config.user)?;

    let mut envs: Vec<(String, String)> = if config.chroot.is_some() && !config.keepenv {
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());
        vec![
            ("PATH".to_string(), "/usr/sbin:/usr/bin:/sbin:/bin".to_string()),
            ("USER".to_string(), config.user.clone()),
            ("LOGNAME".to_string(), config.user.clone()),
            ("TERM".to_string(), term),
        ]
    } else {
        std::env::vars().collect()
    };
    envs.extend(config.setenv.iter().cloned());
    envs.push(("container".to_string(), "pflask".to_string()));

    let (argv, env) = build_exec_args(&config.command, &envs)?;
    nix::unistd::execve(&argv[0], &argv, &env)?;
    unreachable!("execve only returns on error, which is propagated by `?` above");
}

fn build_exec_args(
    command: &[String],
    envs: &[(String, String)],
) -> Result<(Vec<CString>, Vec<CString>)> {
    let (prog, args) = if command.is_empty() {
        ("/bin/bash".to_string(), vec!["-bash".to_string()])
    } else {
        (command[0].clone(), command[1..].to_vec())
    };

    let resolved = crate::pathops::on_path(&prog, None)
        .ok_or_else(|| JailError::usage(format!("command not found: {}", prog)))?;

    let mut argv = vec![CString::new(resolved.to_string_lossy().as_bytes())
        .map_err(|_| JailError::usage("command path contains a NUL byte"))?];
    for a in &args {
        argv.push(CString::new(a.as_str()).map_err(|_| JailError::usage("argument contains a NUL byte"))?);
    }

    let env = envs
        .iter()
        .map(|(k, v)| {
            CString::new(format!("{}={}", k, v))
                .map_err(|_| JailError::usage("environment variable contains a NUL byte"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((argv, env))
}

fn run_parent(
    config: Config,
    pid: Pid,
    sync_parent: &mut crate::sync::SyncParent,
    master: std::fs::File,
    scratch_dir: Option<std::path::PathBuf>,
) -> Result<i32> {
    sync_parent.wait(Seq::Start)?;

    if config.chroot.is_some() && config.clone_flags.contains(CloneFlags::CLONE_NEWUSER) {
        dev::setup_console_owner(&master, &config.user_map)?;
    }

    let mut live_cgroups: Vec<Cgroup> = Vec::new();
    for spec in &config.cgroups {
        live_cgroups.push(spec.setup(pid.as_raw())?);
    }

    let mut netlink = crate::netlink::NetlinkSocket::open()?;
    for netif in &config.netifs {
        netif.apply(&mut netlink, pid.as_raw())?;
    }

    machinereg::register(pid.as_raw(), config.chroot.as_deref());

    if config.clone_flags.contains(CloneFlags::CLONE_NEWUSER) {
        config.user_map.apply(pid.as_raw())?;
    }

    sync_parent.wake(Seq::Done)?;

    let pty_result = if config.detach {
        pty::serve(&master, pid.as_raw())
    } else {
        pty::process(master.as_fd())
    };

    if let Err(e) = pty_result {
        log::warn!("pty loop ended with an error: {}", e);
    }

    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);

    let status = waitid(WaitId::Pid(pid), WaitPidFlag::WEXITED)?;

    for cgroup in live_cgroups {
        cgroup.clean();
    }
    if let Some(dir) = scratch_dir {
        let _ = std::fs::remove_dir_all(dir);
    }

    Ok(exit_code_of(status))
}

fn exit_code_of(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, _, _) => 128,
        _ => 1,
    }
}
