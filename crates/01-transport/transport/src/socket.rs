//! Connected stream-socket backend.
//!
//! The connection itself makes both sides addressable, so there is no
//! capability exchange. Descriptors ride as `SCM_RIGHTS` on the first byte of
//! the frame that carries them, which is why a descriptor-bearing frame needs
//! at least one byte of payload.

use std::io::IoSlice;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::backend::{RecvStatus, SendStatus};
use crate::sys;
use crate::transport::ReadResult;
use crate::{TransportError, TransportResult};

/// Creates a connected, non-blocking stream socket pair suitable for
/// [`PeerCapability::Socket`](crate::PeerCapability::Socket).
pub fn pair() -> TransportResult<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|err| TransportError::os("socketpair", err))
}

pub(crate) struct SocketEndpoint {
    fd: OwnedFd,
    scratch: Vec<u8>,
}

impl SocketEndpoint {
    pub(crate) fn new(fd: OwnedFd, read_chunk_size: usize) -> TransportResult<Self> {
        match sys::socket_type(fd.as_fd()) {
            Ok(SockType::Stream) => {}
            Ok(_) => {
                return Err(TransportError::InvalidCapability(
                    "socket is not a stream socket",
                ))
            }
            Err(Errno::ENOTSOCK) => {
                return Err(TransportError::InvalidCapability(
                    "descriptor is not a socket",
                ))
            }
            Err(err) => return Err(TransportError::os("getsockopt", err)),
        }
        Ok(Self {
            fd,
            scratch: vec![0u8; read_chunk_size],
        })
    }

    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }

    pub(crate) fn send(&self, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> TransportResult<SendStatus> {
        if bytes.is_empty() {
            if fds.is_empty() {
                return Ok(SendStatus::Sent(0));
            }
            return Err(TransportError::EmptyFrameWithDescriptors);
        }
        let iov = [IoSlice::new(bytes)];
        match sys::send_with_rights(self.fd.as_fd(), &iov, fds) {
            Ok(written) => Ok(SendStatus::Sent(written)),
            Err(Errno::EAGAIN) => Ok(SendStatus::WouldBlock),
            Err(Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN) => {
                Err(TransportError::PeerClosed)
            }
            Err(err) => Err(TransportError::os("sendmsg", err)),
        }
    }

    pub(crate) fn recv_into(&mut self, out: &mut ReadResult) -> TransportResult<RecvStatus> {
        match sys::recv_with_rights(self.fd.as_fd(), &mut self.scratch) {
            Ok(received) if received.len == 0 && received.fds.is_empty() => {
                Ok(RecvStatus::Shutdown)
            }
            Ok(received) if received.truncated => Err(TransportError::Protocol(
                "descriptor control data truncated",
            )),
            Ok(received) => {
                out.bytes.extend_from_slice(&self.scratch[..received.len]);
                out.fds.extend(received.fds);
                Ok(RecvStatus::Received)
            }
            Err(Errno::EAGAIN) => Ok(RecvStatus::WouldBlock),
            Err(Errno::ECONNRESET) => Ok(RecvStatus::Shutdown),
            Err(err) => Err(TransportError::os("recvmsg", err)),
        }
    }
}
