//! Error surface for the transport.
//!
//! Errors fall into two groups. Fatal conditions (handshake failures, protocol
//! violations, unexpected OS errors) mean no usable channel exists and the
//! owner must tear it down. The rest (backpressure, peer closure, calls made in
//! the wrong lifecycle state) are reported to the caller, who picks a policy.

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

use crate::wire::WireError;

/// Convenience result alias for fallible transport operations.
pub type TransportResult<T, E = TransportError> = Result<T, E>;

/// Reasons the one-shot capability exchange can fail.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("introduction send timed out after {0:?}")]
    Timeout(Duration),

    #[error("introduction send failed: {0}")]
    Send(Errno),

    #[error("unexpected message id {found:#x} (expected {expected:#x})")]
    UnexpectedMessageId { found: u32, expected: u32 },

    #[error("introduction carried {0} attachments (expected exactly one)")]
    WrongAttachmentCount(usize),

    #[error("introduction attachment has disposition {0} (expected move-send)")]
    WrongDisposition(u8),

    #[error("introduction attachment is not a port send right")]
    WrongAttachmentKind,

    #[error("malformed introduction: {0}")]
    Malformed(&'static str),

    #[error("peer vanished before completing the handshake")]
    PeerVanished,
}

/// Errors surfaced by [`Transport`](crate::Transport) operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("send queue full ({capacity} frames pending)")]
    Backpressure { capacity: usize },

    #[error("frame carries {count} descriptors (limit {limit})")]
    TooManyDescriptors { count: usize, limit: usize },

    #[error("stream frames must carry at least one byte alongside descriptors")]
    EmptyFrameWithDescriptors,

    #[error("{count} frames still queued; flush before releasing the endpoint")]
    PendingFrames { count: usize },

    #[error("transport is still handshaking")]
    NotOpen,

    #[error("transport is closed")]
    Closed,

    #[error("transport endpoint was released for transfer")]
    Released,

    #[error("peer closed the channel")]
    PeerClosed,

    #[error("capability is not usable for this backend: {0}")]
    InvalidCapability(&'static str),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("malformed port message: {0}")]
    Wire(#[from] WireError),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub(crate) fn os(op: &'static str, errno: Errno) -> Self {
        TransportError::Os {
            op,
            source: io::Error::from(errno),
        }
    }

    pub(crate) fn os_io(op: &'static str, source: io::Error) -> Self {
        TransportError::Os { op, source }
    }

    /// Returns true when the channel can no longer be used and the owner must
    /// tear it down rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Handshake(_)
                | TransportError::Wire(_)
                | TransportError::Protocol(_)
                | TransportError::Os { .. }
        )
    }

    /// Returns true when the call was made in a lifecycle state that forbids it.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            TransportError::NotOpen | TransportError::Closed | TransportError::Released
        )
    }
}
