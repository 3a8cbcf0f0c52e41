//! The two OS paths behind one contract.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::config::TransportConfig;
use crate::port::{PortEndpoint, ReceiveRight, SendRight};
use crate::send_queue::Progress;
use crate::socket::SocketEndpoint;
use crate::sys;
use crate::transport::ReadResult;
use crate::TransportResult;

/// Capability naming the peer a transport should connect to.
#[derive(Debug)]
pub enum PeerCapability {
    /// A connected stream socket; the peer holds the other end.
    Socket(OwnedFd),
    /// A send right to the peer's port.
    Port(SendRight),
}

/// Raw endpoint extracted by `release_for_transfer`, ready to be handed to
/// another owner and re-wrapped with `Transport::adopt`.
#[derive(Debug)]
pub enum EndpointHandle {
    Socket(OwnedFd),
    Port {
        receive: ReceiveRight,
        peer: Option<SendRight>,
    },
}

/// Which OS path a transport runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Socket,
    Port,
}

pub(crate) enum SendStatus {
    Sent(usize),
    WouldBlock,
}

pub(crate) enum RecvStatus {
    Received,
    WouldBlock,
    Shutdown,
}

pub(crate) enum Backend {
    Socket(SocketEndpoint),
    Port(PortEndpoint),
}

impl Backend {
    pub(crate) fn from_handle(
        handle: EndpointHandle,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        match handle {
            EndpointHandle::Socket(fd) => Ok(Backend::Socket(SocketEndpoint::new(
                fd,
                config.read_chunk_size,
            )?)),
            EndpointHandle::Port { receive, peer } => {
                Ok(Backend::Port(PortEndpoint::new(receive, peer)))
            }
        }
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            Backend::Socket(_) => BackendKind::Socket,
            Backend::Port(_) => BackendKind::Port,
        }
    }

    pub(crate) fn receive_fd(&self) -> BorrowedFd<'_> {
        match self {
            Backend::Socket(socket) => socket.fd(),
            Backend::Port(port) => port.receive_right().as_fd(),
        }
    }

    /// Descriptor that reports writability, if the peer is known yet.
    pub(crate) fn send_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            Backend::Socket(socket) => Some(socket.fd()),
            Backend::Port(port) => port.peer().map(AsFd::as_fd),
        }
    }

    pub(crate) fn send_fd_is_receive_fd(&self) -> bool {
        matches!(self, Backend::Socket(_))
    }

    /// Stream sockets can only carry `SCM_RIGHTS` alongside at least one byte.
    pub(crate) fn needs_payload_for_descriptors(&self) -> bool {
        matches!(self, Backend::Socket(_))
    }

    pub(crate) fn send(&self, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> TransportResult<SendStatus> {
        match self {
            Backend::Socket(socket) => socket.send(bytes, fds),
            Backend::Port(port) => port.send(bytes, fds),
        }
    }

    pub(crate) fn recv_into(&mut self, out: &mut ReadResult) -> TransportResult<RecvStatus> {
        match self {
            Backend::Socket(socket) => socket.recv_into(out),
            Backend::Port(port) => port.recv_into(out),
        }
    }

    /// Writes as much of the frame as the OS accepts, resuming from
    /// `progress`. Descriptors go out with the first successful write.
    /// Returns true once the whole frame is on the wire.
    pub(crate) fn push(
        &self,
        bytes: &[u8],
        fds: &[BorrowedFd<'_>],
        progress: &mut Progress,
    ) -> TransportResult<bool> {
        loop {
            let rest = &bytes[progress.offset..];
            let attach: &[BorrowedFd<'_>] = if progress.descriptors_sent { &[] } else { fds };
            if rest.is_empty() && attach.is_empty() {
                return Ok(true);
            }
            match self.send(rest, attach)? {
                SendStatus::WouldBlock => return Ok(false),
                SendStatus::Sent(0) if !rest.is_empty() => return Ok(false),
                SendStatus::Sent(written) => {
                    progress.offset += written;
                    progress.descriptors_sent = true;
                }
            }
        }
    }

    /// Mints an independent capability addressing this endpoint.
    pub(crate) fn clone_capability(&self) -> TransportResult<PeerCapability> {
        match self {
            Backend::Socket(socket) => sys::duplicate(socket.fd()).map(PeerCapability::Socket),
            Backend::Port(port) => port
                .receive_right()
                .make_send_right()
                .map(PeerCapability::Port),
        }
    }

    pub(crate) fn say_goodbye(&self) {
        if let Backend::Port(port) = self {
            port.send_goodbye();
        }
    }

    pub(crate) fn into_handle(self) -> EndpointHandle {
        match self {
            Backend::Socket(socket) => EndpointHandle::Socket(socket.into_fd()),
            Backend::Port(port) => {
                let (receive, peer) = port.into_parts();
                EndpointHandle::Port { receive, peer }
            }
        }
    }
}
