//! Boundary to the event loop that drives readiness callbacks.
//!
//! The transport never runs a loop of its own. It registers one descriptor per
//! instance and expects the loop to invoke the callback on its own turn
//! whenever that descriptor reports the requested interest.

use std::os::fd::RawFd;

/// Identifies a registration handed out by an [`EventLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

/// Readiness a registration waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Callback invoked by the loop when a registration fires.
pub type EventCallback = Box<dyn FnMut()>;

/// Minimal contract the transport needs from an event loop.
///
/// Implementations must tolerate `set_enabled` and `unregister` being called
/// from inside a running callback, including for the callback's own
/// registration.
pub trait EventLoop {
    /// Starts watching `fd`. The descriptor stays owned by the caller and must
    /// remain open until [`EventLoop::unregister`] returns.
    fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: EventCallback,
    ) -> nix::Result<RegistrationId>;

    /// Pauses or resumes delivery for a registration without dropping it.
    fn set_enabled(&self, id: RegistrationId, enabled: bool);

    /// Drops a registration. Unknown ids are ignored.
    fn unregister(&self, id: RegistrationId);
}
