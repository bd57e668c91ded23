//! Bidirectional sequenced barrier between parent and child across the
//! `clone()` boundary, plus the fd-passing primitive the PTY bridge reuses
//! for master-fd handoff.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

use crate::error::{JailError, Result};

/// Sequence values exchanged over the sync channel. Modeled as an enum
/// instead of raw integers per the redesign note on cross-process
/// suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seq {
    Start = 1,
    Done = 2,
}

pub struct SyncChannel;

impl SyncChannel {
    /// Creates the socket pair. `fd[0]` (parent side) is close-on-exec.
    pub fn create() -> Result<(SyncParent, SyncChild)> {
        let (fd0, fd1) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        Ok((
            SyncParent {
                socket: std::fs::File::from(fd0),
            },
            SyncChild {
                socket: std::fs::File::from(fd1),
            },
        ))
    }
}

fn write_seq(socket: &mut std::fs::File, seq: Seq) -> Result<()> {
    socket.write_all(&(seq as u32).to_ne_bytes())?;
    Ok(())
}

/// Reads a sequence number. Per the protocol, a zero-byte read (peer closed,
/// e.g. because it exec'd) is treated as success rather than failure.
fn read_seq(socket: &mut std::fs::File, expected: Seq) -> Result<()> {
    let mut buf = [0u8; 4];
    let n = read_fully_or_eof(socket, &mut buf)?;
    if n == 0 {
        return Ok(());
    }
    if n != 4 || u32::from_ne_bytes(buf) != expected as u32 {
        return Err(JailError::protocol(format!(
            "expected sync sequence {:?}, got malformed or mismatched read",
            expected
        )));
    }
    Ok(())
}

fn read_fully_or_eof(socket: &mut std::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = socket.read(&mut buf[total..])?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
    Ok(total)
}

pub struct SyncParent {
    socket: std::fs::File,
}

impl SyncParent {
    pub fn wait(&mut self, seq: Seq) -> Result<()> {
        read_seq(&mut self.socket, seq)
    }

    pub fn wake(&mut self, seq: Seq) -> Result<()> {
        write_seq(&mut self.socket, seq)
    }

    /// `wake(seq)` followed by `wait(seq+1 as the Done companion)`.
    pub fn barrier(&mut self, wake_seq: Seq, wait_seq: Seq) -> Result<()> {
        self.wake(wake_seq)?;
        self.wait(wait_seq)
    }

    pub fn send_fd(&mut self, tag: u8, file: &std::fs::File) -> Result<()> {
        send_fd(&self.socket, tag, file)
    }

    pub fn recv_fd(&mut self, tag: u8) -> Result<std::fs::File> {
        recv_fd(&self.socket, tag)
    }

    pub fn close(self) {
        drop(self)
    }
}

pub struct SyncChild {
    socket: std::fs::File,
}

impl SyncChild {
    pub fn wait(&mut self, seq: Seq) -> Result<()> {
        read_seq(&mut self.socket, seq)
    }

    pub fn wake(&mut self, seq: Seq) -> Result<()> {
        write_seq(&mut self.socket, seq)
    }

    pub fn barrier(&mut self, wake_seq: Seq, wait_seq: Seq) -> Result<()> {
        self.wake(wake_seq)?;
        self.wait(wait_seq)
    }

    pub fn send_fd(&mut self, tag: u8, file: &std::fs::File) -> Result<()> {
        send_fd(&self.socket, tag, file)
    }

    pub fn close(self) {
        drop(self)
    }
}

fn send_fd(socket: &std::fs::File, tag: u8, file: &std::fs::File) -> Result<()> {
    let data = [tag];
    let fds = [file.as_raw_fd()];
    let cmsg = ControlMessage::ScmRights(&fds);
    sendmsg::<nix::sys::socket::UnixAddr>(
        socket.as_raw_fd(),
        &[IoSlice::new(&data)],
        &[cmsg],
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}

fn recv_fd(socket: &std::fs::File, tag: u8) -> Result<std::fs::File> {
    let mut buf = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!(RawFd);

    let (bytes, fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<nix::sys::socket::UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                fd = fds.into_iter().next();
                break;
            }
        }
        (msg.bytes, fd)
    };

    if bytes == 0 {
        return Err(JailError::protocol("peer hung up before sending fd"));
    }
    if buf[0] != tag {
        return Err(JailError::protocol("unexpected tag while waiting for fd"));
    }

    match fd {
        Some(fd) => Ok(unsafe { std::fs::File::from_raw_fd(fd) }),
        None => Err(JailError::protocol("no fd received in ancillary data")),
    }
}
