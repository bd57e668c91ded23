//! Master/slave pseudoterminal bridge, and the detach/attach transfer of the
//! master fd over an abstract UNIX socket.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, ptsname, unlockpt, PtyMaster};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::signal::Signal;
use nix::sys::signalfd::{SfdFlags, SigSet, SignalFd};
use nix::sys::socket::{
    accept, bind, getsockopt, listen, recvmsg, sendmsg, socket, sockopt, AddressFamily,
    ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::{close, dup2, getuid, Uid};

use crate::error::{JailError, Result};

const FD_TAG: u8 = b'f';

fn get_winsize(fd: RawFd) -> Result<libc::winsize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } < 0 {
        return Err(JailError::System(nix::Error::last()));
    }
    Ok(ws)
}

fn set_winsize(fd: RawFd, ws: &libc::winsize) -> Result<()> {
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, ws) } < 0 {
        return Err(JailError::System(nix::Error::last()));
    }
    Ok(())
}

/// Opens the master end and returns it alongside the pathname of its slave
/// and the invoking terminal's current attributes/size, captured here so the
/// slave can be seeded with them before the master side switches stdin raw.
pub fn open_master() -> Result<(PtyMaster, String, Termios, libc::winsize)> {
    let attr = tcgetattr(std::io::stdin())?;
    let ws = get_winsize(0)?;

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_CLOEXEC)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave_path = unsafe { ptsname(&master) }?;
    Ok((master, slave_path, attr, ws))
}

/// Opens the slave named by `slave_path`, installs it as fd 0/1/2, and
/// applies the termios/winsize captured by `open_master`. Runs in the
/// child, after `setsid`.
pub fn open_slave(slave_path: &str, attr: &Termios, ws: &libc::winsize) -> Result<()> {
    let slave = open(
        std::path::Path::new(slave_path),
        OFlag::O_RDWR,
        Mode::empty(),
    )?;
    for fd in 0..=2 {
        dup2(slave, fd)?;
    }
    let slave_fd = unsafe { BorrowedFd::borrow_raw(slave) };
    tcsetattr(slave_fd, SetArg::TCSANOW, attr)?;
    set_winsize(slave, ws)?;
    if slave > 2 {
        close(slave)?;
    }
    Ok(())
}

fn abstract_addr(pid: i32) -> Result<UnixAddr> {
    let name = format!("/com/github/ghedo/pflask/{}", pid);
    UnixAddr::new_abstract(name.as_bytes())
        .map_err(|e| JailError::protocol(format!("building abstract socket address: {}", e)))
}

/// Puts stdin into raw mode (no echo, no line buffering) and blocks
/// `{SIGINT, SIGTERM, SIGCHLD, SIGWINCH, SIGRTMIN+4}` so they arrive only via
/// the returned `signalfd`. Returns stdin's pre-raw attributes so the caller
/// can restore them once the session ends.
fn prepare_terminal_signals() -> Result<(SignalFd, Termios)> {
    let original = tcgetattr(std::io::stdin())?;
    let mut raw = original.clone();
    cfmakeraw(&mut raw);
    tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw)?;

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGWINCH);
    mask.add(Signal::try_from(libc::SIGRTMIN() + 4).unwrap());
    mask.thread_block()?;

    let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)?;
    Ok((signal_fd, original))
}

fn propagate_winsize(master: RawFd) -> Result<()> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::ioctl(0, libc::TIOCGWINSZ, &mut ws) };
    if r == 0 {
        unsafe { libc::ioctl(master, libc::TIOCSWINSZ, &ws) };
    }
    Ok(())
}

/// Single-threaded, level-triggered `epoll` pump bridging stdin/stdout with
/// the PTY master, until a terminating signal or EOF on either side. Stdin's
/// original termios (from before raw mode) is restored before returning, on
/// every exit path.
pub fn process(master: BorrowedFd) -> Result<()> {
    let (mut signal_fd, original_termios) = prepare_terminal_signals()?;

    let result = pump(master, &mut signal_fd);

    let _ = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &original_termios);

    result
}

fn pump(master: BorrowedFd, signal_fd: &mut SignalFd) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::empty())?;
    epoll.add(std::io::stdin(), EpollEvent::new(EpollFlags::EPOLLIN, 0))?;
    epoll.add(master, EpollEvent::new(EpollFlags::EPOLLIN, 1))?;
    epoll.add(&signal_fd, EpollEvent::new(EpollFlags::EPOLLIN, 2))?;

    let mut events = [EpollEvent::empty(); 8];
    let mut buf = [0u8; 4096];

    'outer: loop {
        let n = epoll.wait(&mut events, -1)?;
        for ev in &events[..n] {
            match ev.data() {
                0 => {
                    let n = nix::unistd::read(0, &mut buf)?;
                    if n == 0 {
                        break 'outer;
                    }
                    nix::unistd::write(master.as_raw_fd(), &buf[..n])?;
                }
                1 => {
                    let n = nix::unistd::read(master.as_raw_fd(), &mut buf)?;
                    if n == 0 {
                        break 'outer;
                    }
                    nix::unistd::write(1, &buf[..n])?;
                }
                2 => {
                    let Some(info) = signal_fd.read_signal()? else {
                        continue;
                    };
                    let sig = Signal::try_from(info.ssi_signo as i32).ok();
                    if sig == Some(Signal::SIGWINCH) {
                        propagate_winsize(master.as_raw_fd())?;
                    } else {
                        break 'outer;
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    Ok(())
}

/// Binds the abstract socket `@/com/github/ghedo/pflask/<pid>`, and on each
/// accepted connection checks the peer's euid via `SO_PEERCRED` before
/// handing over `master` through `SCM_RIGHTS`. Any other peer is dropped
/// without a reply. Terminates on the same signal set as `process`.
pub fn serve(master: &File, pid: i32) -> Result<()> {
    let (mut signal_fd, _original_termios) = prepare_terminal_signals()?;
    let addr = abstract_addr(pid)?;

    let listener = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    bind(listener.as_raw_fd(), &addr)?;
    listen(&listener, 1)?;

    let epoll = Epoll::new(EpollCreateFlags::empty())?;
    epoll.add(&listener, EpollEvent::new(EpollFlags::EPOLLIN, 0))?;
    epoll.add(&signal_fd, EpollEvent::new(EpollFlags::EPOLLIN, 1))?;

    let our_euid = getuid();
    let mut events = [EpollEvent::empty(); 4];

    loop {
        let n = epoll.wait(&mut events, -1)?;
        for ev in &events[..n] {
            match ev.data() {
                0 => {
                    let conn = accept(listener.as_raw_fd())?;
                    let conn = unsafe { OwnedFd::from_raw_fd(conn) };
                    let cred = getsockopt(&conn, sockopt::PeerCredentials)?;
                    if Uid::from_raw(cred.uid()) == our_euid {
                        send_master_fd(conn.as_raw_fd(), master)?;
                    }
                }
                1 => {
                    let Some(_) = signal_fd.read_signal()? else {
                        continue;
                    };
                    return Ok(());
                }
                _ => unreachable!(),
            }
        }
    }
}

/// Connects to the detached session named by `pid` and receives its master
/// fd, ready for `process`.
pub fn attach(pid: i32) -> Result<OwnedFd> {
    let addr = abstract_addr(pid)?;
    let conn = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    nix::sys::socket::connect(conn.as_raw_fd(), &addr)?;
    recv_master_fd(conn.as_raw_fd())
}

fn send_master_fd(conn: RawFd, master: &File) -> Result<()> {
    let data = [FD_TAG];
    let fds = [master.as_raw_fd()];
    let cmsg = ControlMessage::ScmRights(&fds);
    sendmsg::<UnixAddr>(
        conn,
        &[IoSlice::new(&data)],
        &[cmsg],
        MsgFlags::empty(),
        None,
    )?;
    close(conn)?;
    Ok(())
}

fn recv_master_fd(conn: RawFd) -> Result<OwnedFd> {
    let mut buf = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!(RawFd);

    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg = recvmsg::<UnixAddr>(
        conn,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    if msg.bytes == 0 {
        return Err(JailError::protocol("peer closed before sending the pty fd"));
    }

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    Err(JailError::protocol("no fd received while attaching"))
}
