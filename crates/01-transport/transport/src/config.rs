//! Tunables for a single transport instance.

use std::time::Duration;

use crate::{TransportError, TransportResult};

/// Frames a transport may hold back while the OS path would block.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 32;
/// Upper bound on the initiator's introduction send.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);
/// Hard per-frame descriptor limit shared by both backends (below `SCM_MAX_FD`).
pub const MAX_DESCRIPTORS_PER_FRAME: usize = 64;
/// Receive buffer used by the stream-socket backend for each `recvmsg`.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Configuration applied when a transport is constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum number of frames waiting in the send queue.
    pub send_queue_capacity: usize,
    /// How long the initiator may wait for room to send its introduction.
    pub handshake_timeout: Duration,
    /// Descriptors accepted per `transfer` call, at most [`MAX_DESCRIPTORS_PER_FRAME`].
    pub max_descriptors_per_frame: usize,
    /// Bytes requested per receive syscall on stream sockets.
    pub read_chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_descriptors_per_frame: MAX_DESCRIPTORS_PER_FRAME,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl TransportConfig {
    /// Checks the configuration for values the transport cannot honour.
    pub fn validate(&self) -> TransportResult<()> {
        if self.send_queue_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "send queue capacity must be non-zero",
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "handshake timeout must be non-zero",
            ));
        }
        if self.max_descriptors_per_frame > MAX_DESCRIPTORS_PER_FRAME {
            return Err(TransportError::InvalidConfig(
                "descriptor limit exceeds the backend maximum",
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(TransportError::InvalidConfig(
                "read chunk size must be non-zero",
            ));
        }
        Ok(())
    }
}
