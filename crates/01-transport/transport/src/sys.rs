//! Socket syscalls shared by both backends.
//!
//! Every call here is non-blocking and retries `EINTR` itself, so callers only
//! ever see would-block, peer loss, or something fatal.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    getsockopt, recvmsg, sendmsg, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockType,
};
use smallvec::SmallVec;

use crate::config::MAX_DESCRIPTORS_PER_FRAME;
use crate::{TransportError, TransportResult};

/// Descriptors received with (or queued for) a single frame.
pub(crate) type Descriptors = SmallVec<[OwnedFd; 1]>;

/// Kernel cap on descriptors in one `SCM_RIGHTS` message.
const SCM_MAX_FD: usize = 253;

const SEND_FLAGS: MsgFlags = MsgFlags::MSG_DONTWAIT.union(MsgFlags::MSG_NOSIGNAL);
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_DONTWAIT.union(MsgFlags::MSG_CMSG_CLOEXEC);

/// Sends `iov` with `fds` attached as `SCM_RIGHTS`.
pub(crate) fn send_with_rights(
    fd: BorrowedFd<'_>,
    iov: &[IoSlice<'_>],
    fds: &[BorrowedFd<'_>],
) -> Result<usize, Errno> {
    let raw: SmallVec<[RawFd; 4]> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };
    loop {
        match sendmsg::<()>(fd.as_raw_fd(), iov, cmsgs, SEND_FLAGS, None) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Outcome of a single `recvmsg`.
pub(crate) struct Received {
    pub(crate) len: usize,
    pub(crate) fds: Descriptors,
    /// Payload did not fit, or more descriptors arrived than a frame may carry.
    pub(crate) truncated: bool,
}

/// Receives one message into `buf`, adopting any passed descriptors.
///
/// The control buffer holds the kernel maximum, so every descriptor the kernel
/// installs ends up owned here and is closed when the caller drops it.
pub(crate) fn recv_with_rights(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<Received, Errno> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; SCM_MAX_FD]);
    loop {
        let mut iov = [IoSliceMut::new(&mut *buf)];
        let msg = match recvmsg::<()>(fd.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), RECV_FLAGS)
        {
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
            Ok(msg) => msg,
        };

        let mut fds = Descriptors::new();
        let mut truncated = msg.flags.contains(MsgFlags::MSG_TRUNC);
        match msg.cmsgs() {
            Ok(cmsgs) => {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(raw) = cmsg {
                        // SAFETY: SCM_RIGHTS installs fresh descriptors in this
                        // process and nothing else holds them yet.
                        fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                    }
                }
            }
            // MSG_CTRUNC cannot happen for SCM_RIGHTS with this buffer.
            Err(_) => truncated = true,
        }
        if fds.len() > MAX_DESCRIPTORS_PER_FRAME {
            truncated = true;
        }
        return Ok(Received {
            len: msg.bytes,
            fds,
            truncated,
        });
    }
}

/// Reports the socket type behind `fd`, failing with `ENOTSOCK` for anything else.
pub(crate) fn socket_type(fd: BorrowedFd<'_>) -> Result<SockType, Errno> {
    getsockopt(&fd, sockopt::SockType)
}

/// Polls a single descriptor once. An empty set means the timeout elapsed.
pub(crate) fn poll_once(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout: PollTimeout,
) -> Result<PollFlags, Errno> {
    let mut fds = [PollFd::new(fd, events)];
    if poll(&mut fds, timeout)? == 0 {
        return Ok(PollFlags::empty());
    }
    Ok(fds[0].revents().unwrap_or_else(PollFlags::empty))
}

/// Converts a duration to a poll timeout, saturating at the largest supported value.
pub(crate) fn poll_timeout(duration: Duration) -> PollTimeout {
    let millis = u16::try_from(duration.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(millis)
}

/// Duplicates a descriptor with close-on-exec set.
pub(crate) fn duplicate(fd: BorrowedFd<'_>) -> TransportResult<OwnedFd> {
    fd.try_clone_to_owned()
        .map_err(|err| TransportError::os_io("dup", err))
}
