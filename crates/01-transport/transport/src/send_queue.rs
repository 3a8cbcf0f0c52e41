//! Bounded FIFO of frames waiting for the OS to accept them.

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use smallvec::SmallVec;

use crate::backend::Backend;
use crate::sys::{self, Descriptors};
use crate::TransportResult;

/// How far a frame has made it onto the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) offset: usize,
    pub(crate) descriptors_sent: bool,
}

/// Result of one attempt to move a frame forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pushed {
    pub(crate) complete: bool,
    pub(crate) bytes: usize,
    pub(crate) descriptors: usize,
}

impl Progress {
    pub(crate) fn advance(
        &mut self,
        backend: &Backend,
        bytes: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> TransportResult<Pushed> {
        let start = *self;
        let complete = backend.push(bytes, fds, self)?;
        let descriptors = if self.descriptors_sent && !start.descriptors_sent {
            fds.len()
        } else {
            0
        };
        Ok(Pushed {
            complete,
            bytes: self.offset - start.offset,
            descriptors,
        })
    }
}

/// A frame held back because the OS path would block.
///
/// Descriptors are duplicated at enqueue time so the caller keeps ownership of
/// its originals.
pub(crate) struct OutgoingFrame {
    bytes: Vec<u8>,
    fds: Descriptors,
    progress: Progress,
}

impl OutgoingFrame {
    /// Queues whatever part of a frame is still unsent.
    pub(crate) fn pending(
        remaining: &[u8],
        descriptors_sent: bool,
        fds: &[BorrowedFd<'_>],
    ) -> TransportResult<Self> {
        let mut owned = Descriptors::new();
        if !descriptors_sent {
            for fd in fds {
                owned.push(sys::duplicate(*fd)?);
            }
        }
        Ok(Self {
            bytes: remaining.to_vec(),
            fds: owned,
            progress: Progress {
                offset: 0,
                descriptors_sent,
            },
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn push_to(&mut self, backend: &Backend) -> TransportResult<Pushed> {
        let borrowed: SmallVec<[BorrowedFd<'_>; 4]> =
            self.fds.iter().map(OwnedFd::as_fd).collect();
        let pushed = self.progress.advance(backend, &self.bytes, &borrowed)?;
        if pushed.descriptors > 0 {
            drop(borrowed);
            self.fds.clear();
        }
        Ok(pushed)
    }
}

/// Fixed-capacity FIFO. A full queue hands the rejected item back.
#[derive(Debug)]
pub(crate) struct SendQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> SendQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}
