//! On-the-wire layout of capability-port messages.
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | magic (u32 le)                | id (u32 le)                   |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | disp  | rsvd  | descriptors   | payload_len (u32 le)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | payload ... (at most PORT_MESSAGE_PAYLOAD_MAX bytes)          |
//! ```
//!
//! Each message is one seqpacket datagram. Attached descriptors travel as
//! `SCM_RIGHTS` control data and must match `descriptors` exactly.

use thiserror::Error;

/// Size of the fixed header preceding every payload.
pub const HEADER_LEN: usize = 16;
/// Identifies datagrams produced by this transport.
pub const PORT_MAGIC: u32 = 0x5452_4E50;
/// Largest payload carried by a single datagram; bigger frames are chunked.
pub const PORT_MESSAGE_PAYLOAD_MAX: usize = 32 * 1024;
/// Largest datagram a port endpoint ever reads.
pub const PORT_MESSAGE_MAX: usize = HEADER_LEN + PORT_MESSAGE_PAYLOAD_MAX;

/// Message identifier carried in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub u32);

impl MessageId {
    /// Application payload chunk.
    pub const DATA: MessageId = MessageId(1);
    /// Handshake-only message carrying the sender's send right.
    pub const INTRODUCTION: MessageId = MessageId(0x5EF7_A5C0);
    /// Orderly shutdown notice sent by `close`.
    pub const GOODBYE: MessageId = MessageId(0x5EF7_A5C1);

    /// Returns true for identifiers the transport keeps for itself.
    pub fn is_reserved(self) -> bool {
        self == Self::INTRODUCTION || self == Self::GOODBYE
    }
}

/// How the attached descriptors are handed over.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// No attachments.
    None = 0,
    /// Exclusive transfer of a send right; the sender keeps no copy.
    MoveSend = 1,
    /// Application descriptors; the sender keeps its own copies.
    CopyDescriptor = 2,
}

impl Disposition {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Disposition::None),
            1 => Some(Disposition::MoveSend),
            2 => Some(Disposition::CopyDescriptor),
            _ => None,
        }
    }
}

/// Decoding failures for the fixed header.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the header")]
    Truncated(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("declared payload of {0} bytes exceeds the datagram limit")]
    Oversized(u32),
}

/// Fixed header preceding every port message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    pub disposition: u8,
    pub descriptor_count: u16,
    pub payload_len: u32,
}

impl MessageHeader {
    /// Header for an application chunk.
    pub fn data(payload_len: usize, descriptor_count: usize) -> Self {
        debug_assert!(payload_len <= PORT_MESSAGE_PAYLOAD_MAX);
        let disposition = if descriptor_count == 0 {
            Disposition::None
        } else {
            Disposition::CopyDescriptor
        };
        Self {
            id: MessageId::DATA,
            disposition: disposition as u8,
            descriptor_count: descriptor_count as u16,
            payload_len: payload_len as u32,
        }
    }

    /// Header for the handshake message: one moved send right, no payload.
    pub fn introduction() -> Self {
        Self {
            id: MessageId::INTRODUCTION,
            disposition: Disposition::MoveSend as u8,
            descriptor_count: 1,
            payload_len: 0,
        }
    }

    pub fn goodbye() -> Self {
        Self {
            id: MessageId::GOODBYE,
            disposition: Disposition::None as u8,
            descriptor_count: 0,
            payload_len: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&PORT_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.id.0.to_le_bytes());
        out[8] = self.disposition;
        out[10..12].copy_from_slice(&self.descriptor_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated(bytes.len()));
        }
        let magic = read_u32(&bytes[0..4]);
        if magic != PORT_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let payload_len = read_u32(&bytes[12..16]);
        if payload_len as usize > PORT_MESSAGE_PAYLOAD_MAX {
            return Err(WireError::Oversized(payload_len));
        }
        Ok(Self {
            id: MessageId(read_u32(&bytes[4..8])),
            disposition: bytes[8],
            descriptor_count: u16::from_le_bytes([bytes[10], bytes[11]]),
            payload_len,
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
