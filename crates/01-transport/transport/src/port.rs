//! Capability-port backend.
//!
//! A port is a seqpacket socket pair. The receive right keeps one end for
//! reading and a second "minting" end; every send right is a duplicate of the
//! minting end, so anything written through a send right lands in the receive
//! end's queue. Rights cross process boundaries as `SCM_RIGHTS` attachments.

use std::io::IoSlice;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{PollFlags, PollTimeout};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::backend::{RecvStatus, SendStatus};
use crate::handshake::CapabilityExchange;
use crate::sys;
use crate::transport::ReadResult;
use crate::wire::{
    Disposition, MessageHeader, MessageId, HEADER_LEN, PORT_MESSAGE_MAX, PORT_MESSAGE_PAYLOAD_MAX,
};
use crate::{HandshakeError, TransportError, TransportResult};

/// Right to enqueue messages on a port's receive end.
#[derive(Debug)]
pub struct SendRight(OwnedFd);

impl SendRight {
    /// Adopts `fd` as a send right after checking that it is a port endpoint.
    pub fn from_fd(fd: OwnedFd) -> TransportResult<Self> {
        check_port_fd(fd.as_fd())?;
        Ok(Self(fd))
    }

    pub fn into_fd(self) -> OwnedFd {
        self.0
    }

    /// Produces an independent send right to the same port.
    pub fn try_clone(&self) -> TransportResult<Self> {
        sys::duplicate(self.0.as_fd()).map(Self)
    }
}

impl AsFd for SendRight {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Exclusive right to read a port, together with the means to mint send rights to it.
#[derive(Debug)]
pub struct ReceiveRight {
    receive: OwnedFd,
    mint: OwnedFd,
}

impl ReceiveRight {
    /// Allocates a fresh port.
    pub fn create() -> TransportResult<Self> {
        let (receive, mint) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|err| TransportError::os("socketpair", err))?;
        Ok(Self { receive, mint })
    }

    /// Reassembles a receive right from the descriptors produced by [`ReceiveRight::into_fds`].
    pub fn from_fds(receive: OwnedFd, mint: OwnedFd) -> TransportResult<Self> {
        check_port_fd(receive.as_fd())?;
        check_port_fd(mint.as_fd())?;
        Ok(Self { receive, mint })
    }

    /// Splits the right into its receive end and minting end.
    pub fn into_fds(self) -> (OwnedFd, OwnedFd) {
        (self.receive, self.mint)
    }

    /// Mints a new send right to this port.
    pub fn make_send_right(&self) -> TransportResult<SendRight> {
        sys::duplicate(self.mint.as_fd()).map(SendRight)
    }
}

impl AsFd for ReceiveRight {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.receive.as_fd()
    }
}

fn check_port_fd(fd: BorrowedFd<'_>) -> TransportResult<()> {
    match sys::socket_type(fd) {
        Ok(SockType::SeqPacket) => Ok(()),
        Ok(_) => Err(TransportError::InvalidCapability(
            "descriptor is not a seqpacket socket",
        )),
        Err(Errno::ENOTSOCK) => Err(TransportError::InvalidCapability(
            "descriptor is not a socket",
        )),
        Err(err) => Err(TransportError::os("getsockopt", err)),
    }
}

/// Local side of a port channel: our receive right and, once known, the peer's send right.
pub(crate) struct PortEndpoint {
    receive: ReceiveRight,
    peer: Option<SendRight>,
    scratch: Box<[u8]>,
}

impl PortEndpoint {
    pub(crate) fn new(receive: ReceiveRight, peer: Option<SendRight>) -> Self {
        Self {
            receive,
            peer,
            scratch: vec![0u8; PORT_MESSAGE_MAX].into_boxed_slice(),
        }
    }

    pub(crate) fn receive_right(&self) -> &ReceiveRight {
        &self.receive
    }

    pub(crate) fn peer(&self) -> Option<&SendRight> {
        self.peer.as_ref()
    }

    pub(crate) fn adopt_peer(&mut self, peer: SendRight) {
        self.peer = Some(peer);
    }

    pub(crate) fn into_parts(self) -> (ReceiveRight, Option<SendRight>) {
        (self.receive, self.peer)
    }

    /// Sends at most one datagram worth of `bytes`, attaching `fds` to it.
    pub(crate) fn send(&self, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> TransportResult<SendStatus> {
        let peer = self.peer.as_ref().ok_or(TransportError::NotOpen)?;
        let chunk = &bytes[..bytes.len().min(PORT_MESSAGE_PAYLOAD_MAX)];
        let header = MessageHeader::data(chunk.len(), fds.len()).encode();
        let iov = [IoSlice::new(&header), IoSlice::new(chunk)];
        match sys::send_with_rights(peer.as_fd(), &iov, fds) {
            Ok(written) if written == HEADER_LEN + chunk.len() => Ok(SendStatus::Sent(chunk.len())),
            Ok(_) => Err(TransportError::Protocol("short datagram write")),
            Err(Errno::EAGAIN) => Ok(SendStatus::WouldBlock),
            Err(Errno::EPIPE | Errno::ECONNRESET | Errno::ECONNREFUSED) => {
                Err(TransportError::PeerClosed)
            }
            Err(err) => Err(TransportError::os("sendmsg", err)),
        }
    }

    /// Reads one datagram and appends its payload and descriptors to `out`.
    ///
    /// An empty queue reads as shutdown once the peer's receive end is gone:
    /// our own minting end keeps the port alive, so EOF never shows up here.
    pub(crate) fn recv_into(&mut self, out: &mut ReadResult) -> TransportResult<RecvStatus> {
        let received = match sys::recv_with_rights(self.receive.as_fd(), &mut self.scratch) {
            Ok(received) => received,
            Err(Errno::EAGAIN) if self.peer_hung_up()? => return Ok(RecvStatus::Shutdown),
            Err(Errno::EAGAIN) => return Ok(RecvStatus::WouldBlock),
            Err(Errno::ECONNRESET) => return Ok(RecvStatus::Shutdown),
            Err(err) => return Err(TransportError::os("recvmsg", err)),
        };
        if received.len == 0 && received.fds.is_empty() {
            return Ok(RecvStatus::Shutdown);
        }
        if received.truncated {
            return Err(TransportError::Protocol("port message truncated"));
        }

        let header = MessageHeader::decode(&self.scratch[..received.len])?;
        if header.payload_len as usize != received.len - HEADER_LEN {
            return Err(TransportError::Protocol("payload length mismatch"));
        }
        if header.descriptor_count as usize != received.fds.len() {
            return Err(TransportError::Protocol("descriptor count mismatch"));
        }

        match header.id {
            MessageId::DATA => {
                let attached = !received.fds.is_empty();
                match Disposition::from_u8(header.disposition) {
                    Some(Disposition::None) if !attached => {}
                    Some(Disposition::CopyDescriptor) if attached => {}
                    _ => {
                        return Err(TransportError::Protocol(
                            "data disposition disagrees with its attachments",
                        ))
                    }
                }
                out.bytes
                    .extend_from_slice(&self.scratch[HEADER_LEN..received.len]);
                out.fds.extend(received.fds);
                Ok(RecvStatus::Received)
            }
            MessageId::GOODBYE => Ok(RecvStatus::Shutdown),
            id if id.is_reserved() => Err(TransportError::Protocol(
                "introduction received after the handshake",
            )),
            _ => Err(TransportError::Protocol("unknown port message id")),
        }
    }

    /// True once the port our send right addresses has lost its receive end.
    pub(crate) fn peer_hung_up(&self) -> TransportResult<bool> {
        let Some(peer) = self.peer.as_ref() else {
            return Ok(false);
        };
        let revents = loop {
            match sys::poll_once(peer.as_fd(), PollFlags::POLLRDHUP, PollTimeout::ZERO) {
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(TransportError::os("poll", err)),
                Ok(revents) => break revents,
            }
        };
        Ok(revents.intersects(PollFlags::POLLHUP | PollFlags::POLLRDHUP))
    }

    /// Reads the next message as a handshake candidate. `None` means nothing
    /// was queued yet.
    pub(crate) fn receive_introduction(&mut self) -> TransportResult<Option<CapabilityExchange>> {
        let received = match sys::recv_with_rights(self.receive.as_fd(), &mut self.scratch) {
            Ok(received) => received,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(Errno::ECONNRESET) => return Err(HandshakeError::PeerVanished.into()),
            Err(err) => return Err(TransportError::os("recvmsg", err)),
        };
        if received.len == 0 && received.fds.is_empty() {
            return Err(HandshakeError::PeerVanished.into());
        }
        if received.truncated {
            return Err(HandshakeError::Malformed("introduction truncated").into());
        }
        let header = MessageHeader::decode(&self.scratch[..received.len])
            .map_err(|_| HandshakeError::Malformed("bad introduction header"))?;
        Ok(Some(CapabilityExchange::new(
            header,
            received.len - HEADER_LEN,
            received.fds,
        )))
    }

    /// Best-effort shutdown notice; the peer may already be gone.
    pub(crate) fn send_goodbye(&self) {
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        let header = MessageHeader::goodbye().encode();
        if let Err(err) = sys::send_with_rights(peer.as_fd(), &[IoSlice::new(&header)], &[]) {
            tracing::trace!("goodbye not delivered: {err}");
        }
    }
}
