//! Capability-spec parsing and application across the effective, permitted,
//! inheritable, and bounding sets.
//!
//! Capability syscalls: https://github.com/torvalds/linux/blob/master/include/uapi/linux/capability.h

use crate::error::{JailError, Result};

pub const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Drop,
}

#[derive(Debug, Clone)]
pub struct CapAction {
    pub action: Action,
    /// `None` represents the `-all` sentinel.
    pub cap: Option<String>,
}

/// Resolves a capability name to its bit number via the names linux defines
/// up to `CAP_LAST_CAP` (currently `CAP_CHECKPOINT_RESTORE` = 40).
fn cap_id(name: &str) -> Result<u8> {
    const NAMES: &[&str] = &[
        "chown",
        "dac_override",
        "dac_read_search",
        "fowner",
        "fsetid",
        "kill",
        "setgid",
        "setuid",
        "setpcap",
        "linux_immutable",
        "net_bind_service",
        "net_broadcast",
        "net_admin",
        "net_raw",
        "ipc_lock",
        "ipc_owner",
        "sys_module",
        "sys_rawio",
        "sys_chroot",
        "sys_ptrace",
        "sys_pacct",
        "sys_admin",
        "sys_boot",
        "sys_nice",
        "sys_resource",
        "sys_time",
        "sys_tty_config",
        "mknod",
        "lease",
        "audit_write",
        "audit_control",
        "setfcap",
        "mac_override",
        "mac_admin",
        "syslog",
        "wake_alarm",
        "block_suspend",
        "audit_read",
        "perfmon",
        "bpf",
        "checkpoint_restore",
    ];

    NAMES
        .iter()
        .position(|n| *n == name)
        .map(|p| p as u8)
        .ok_or_else(|| JailError::usage(format!("unknown capability: {}", name)))
}

/// Parses an ordered capability spec: `+all`/`all` is a no-op only valid as
/// the first token; `-all` clears all four vectors before applying the rest;
/// subsequent tokens are `[+|-]name` with implicit `+`.
pub fn parse(spec: &str) -> Result<Vec<CapAction>> {
    let mut out = Vec::new();

    for (i, token) in spec.split(',').enumerate() {
        if token.is_empty() {
            return Err(JailError::usage("empty capability token"));
        }

        let (action, name) = match token.strip_prefix('-') {
            Some(rest) => (Action::Drop, rest),
            None => (Action::Add, token.strip_prefix('+').unwrap_or(token)),
        };

        if name == "all" {
            if i != 0 {
                return Err(JailError::usage("'all' is only valid as the first token"));
            }
            if action == Action::Drop {
                out.push(CapAction { action, cap: None });
            }
            // '+all'/'all' as first token is a documented no-op.
            continue;
        }

        let _ = cap_id(name)?;
        out.push(CapAction {
            action,
            cap: Some(name.to_string()),
        });
    }

    Ok(out)
}

/// Folds the ordered spec into the combined bitmask that will be set across
/// effective, permitted, and inheritable, i.e. "all-caps-if-no-minus-all,
/// else empty, then apply the remainder".
fn fold(actions: &[CapAction]) -> u64 {
    let mut mask: u64 = if actions.first().map(|a| a.cap.is_none()) == Some(true) {
        0
    } else {
        u64::MAX
    };

    for action in actions {
        let Some(cap) = &action.cap else { continue };
        let bit = 1u64 << cap_id(cap).unwrap();
        match action.action {
            Action::Add => mask |= bit,
            Action::Drop => mask &= !bit,
        }
    }

    mask
}

/// Applies the combined effective/permitted/inheritable mask via `capset`,
/// then drops the same bits from the bounding set with `PR_CAPBSET_DROP`.
pub fn apply(actions: &[CapAction]) -> Result<()> {
    let mask = fold(actions);

    let hdr = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };

    let data = [
        CapUserData {
            effective: (mask & 0xffff_ffff) as u32,
            permitted: (mask & 0xffff_ffff) as u32,
            inheritable: (mask & 0xffff_ffff) as u32,
        },
        CapUserData {
            effective: (mask >> 32) as u32,
            permitted: (mask >> 32) as u32,
            inheritable: (mask >> 32) as u32,
        },
    ];

    let r = unsafe { libc::syscall(libc::SYS_capset, &hdr, data.as_ptr()) };
    if r != 0 {
        return Err(JailError::System(nix::Error::last()));
    }

    for bit in 0u8..=40 {
        if mask & (1u64 << bit) == 0 {
            unsafe {
                libc::prctl(libc::PR_CAPBSET_DROP, bit as libc::c_ulong, 0, 0, 0);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_usage_error() {
        assert!(parse("+net_bind_service,,+sys_chroot").is_err());
    }

    #[test]
    fn all_must_be_first() {
        assert!(parse("+net_bind_service,-all").is_err());
        assert!(parse("-all,+net_bind_service").is_ok());
    }

    #[test]
    fn fold_minus_all_starts_empty() {
        let actions = parse("-all,+net_bind_service").unwrap();
        let mask = fold(&actions);
        assert_eq!(mask, 1u64 << cap_id("net_bind_service").unwrap());
    }

    #[test]
    fn fold_without_minus_all_starts_full() {
        let actions = parse("-sys_admin").unwrap();
        let mask = fold(&actions);
        assert_eq!(mask & (1u64 << cap_id("sys_admin").unwrap()), 0);
        assert_ne!(mask & (1u64 << cap_id("chown").unwrap()), 0);
    }
}
