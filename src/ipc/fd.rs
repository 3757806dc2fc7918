//! Descriptor passing over Unix sockets (`SCM_RIGHTS`).
//!
//! Every transfer carries a single NUL byte so the receiver can tell a real
//! message from EOF.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

const MARKER: [u8; 1] = [0];

/// Send `fd` across `socket`. The caller keeps its own copy of the descriptor.
pub fn send_fd(socket: &impl AsRawFd, fd: BorrowedFd<'_>) -> io::Result<()> {
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&MARKER)];

    loop {
        match sendmsg::<UnixAddr>(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Receive one descriptor from `socket`.
///
/// Returns `Ok(None)` when the peer has closed its end. Extra descriptors in
/// the same message are closed.
pub fn recv_fd(socket: &impl AsRawFd) -> io::Result<Option<OwnedFd>> {
    let mut marker = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    loop {
        let mut iov = [IoSliceMut::new(&mut marker)];
        let msg = match recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            recv_flags(),
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        };

        if msg.bytes == 0 {
            return Ok(None);
        }

        let mut received: Option<OwnedFd> = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    // SAFETY: the kernel just installed `raw` in our table and
                    // nothing else owns it yet.
                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                    if received.is_none() {
                        received = Some(owned);
                    }
                }
            }
        }

        return match received {
            Some(fd) => Ok(Some(fd)),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message carried no descriptor",
            )),
        };
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}
