//! One-shot capability exchange for the port backend.
//!
//! The initiator mints a send right to its own receive end and moves it to the
//! peer inside a single INTRODUCTION message. The responder accepts exactly one
//! such message before any application data and adopts the attachment as its
//! peer. Stream sockets skip all of this: the connection already addresses both
//! sides.

use std::io::IoSlice;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::PollFlags;
use tracing::debug;

use crate::port::{PortEndpoint, SendRight};
use crate::sys::{self, Descriptors};
use crate::wire::{Disposition, MessageHeader, MessageId};
use crate::{HandshakeError, TransportError, TransportResult};

/// Whether the responder has adopted its peer yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeProgress {
    Pending,
    Complete,
}

/// A received handshake candidate, not yet trusted.
pub(crate) struct CapabilityExchange {
    header: MessageHeader,
    payload_len: usize,
    attachments: Descriptors,
}

impl CapabilityExchange {
    pub(crate) fn new(header: MessageHeader, payload_len: usize, attachments: Descriptors) -> Self {
        Self {
            header,
            payload_len,
            attachments,
        }
    }

    /// Checks identifier, attachment count, disposition and kind, in that
    /// order. Rejected attachments are closed on drop.
    pub(crate) fn validate(self) -> Result<SendRight, HandshakeError> {
        if self.header.id != MessageId::INTRODUCTION {
            return Err(HandshakeError::UnexpectedMessageId {
                found: self.header.id.0,
                expected: MessageId::INTRODUCTION.0,
            });
        }
        if self.attachments.len() != 1 {
            return Err(HandshakeError::WrongAttachmentCount(self.attachments.len()));
        }
        if self.header.disposition != Disposition::MoveSend as u8 {
            return Err(HandshakeError::WrongDisposition(self.header.disposition));
        }
        if self.header.descriptor_count != 1 {
            return Err(HandshakeError::Malformed("declared attachment count disagrees"));
        }
        if self.payload_len != 0 || self.header.payload_len != 0 {
            return Err(HandshakeError::Malformed("introduction carries a payload"));
        }
        let fd = self
            .attachments
            .into_iter()
            .next()
            .ok_or(HandshakeError::WrongAttachmentCount(0))?;
        SendRight::from_fd(fd).map_err(|_| HandshakeError::WrongAttachmentKind)
    }
}

/// Sends our introduction to the peer, waiting at most `timeout` for room.
pub(crate) fn initiate(endpoint: &PortEndpoint, timeout: Duration) -> TransportResult<()> {
    let peer = endpoint
        .peer()
        .ok_or(TransportError::InvalidCapability("initiator has no peer"))?;
    let own = endpoint.receive_right().make_send_right()?;
    let header = MessageHeader::introduction().encode();
    let iov = [IoSlice::new(&header)];
    let deadline = Instant::now() + timeout;

    loop {
        match sys::send_with_rights(peer.as_fd(), &iov, &[own.as_fd()]) {
            Ok(_) => {
                // Moved: the peer now holds the only copy.
                drop(own);
                debug!("introduction sent");
                return Ok(());
            }
            Err(Errno::EAGAIN) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(HandshakeError::Timeout(timeout).into());
                }
                match sys::poll_once(peer.as_fd(), PollFlags::POLLOUT, sys::poll_timeout(remaining)) {
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(err) => return Err(HandshakeError::Send(err).into()),
                }
            }
            Err(err) => return Err(HandshakeError::Send(err).into()),
        }
    }
}

/// Consumes the next queued message as the peer's introduction, if any.
pub(crate) fn respond(endpoint: &mut PortEndpoint) -> TransportResult<HandshakeProgress> {
    let Some(exchange) = endpoint.receive_introduction()? else {
        return Ok(HandshakeProgress::Pending);
    };
    let peer = exchange.validate()?;
    endpoint.adopt_peer(peer);
    debug!("introduction accepted");
    Ok(HandshakeProgress::Complete)
}
