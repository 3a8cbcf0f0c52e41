//! Per-transport readiness source.
//!
//! Each transport owns a private epoll instance holding its receive descriptor
//! and, on ports with a known peer, the peer's send right (hang-up always,
//! writability while frames are queued). Only the epoll
//! descriptor itself is registered with the external loop, so the loop sees
//! exactly one registration per transport and the transport can tell which
//! side woke it.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::trace;

use crate::backend::Backend;
use crate::event::{EventCallback, EventLoop, Interest, RegistrationId};
use crate::{TransportError, TransportResult};

pub(crate) const RECEIVE_TOKEN: u64 = 1;
pub(crate) const SEND_TOKEN: u64 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// The peer's receive end is gone.
    pub(crate) hangup: bool,
}

impl Readiness {
    pub(crate) fn is_spurious(&self) -> bool {
        !self.readable && !self.writable && !self.hangup
    }
}

/// Whether the peer's send right sits in the epoll set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerWatch {
    Unwatched,
    Watched,
    /// Hang-up seen and the descriptor removed so it stops firing.
    HungUp,
}

pub(crate) struct Notifier {
    epoll: Epoll,
    event_loop: Rc<dyn EventLoop>,
    registration: RegistrationId,
    write_armed: bool,
    peer: PeerWatch,
}

impl Notifier {
    pub(crate) fn install(
        event_loop: Rc<dyn EventLoop>,
        receive: BorrowedFd<'_>,
        callback: EventCallback,
    ) -> TransportResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|err| TransportError::os("epoll_create1", err))?;
        epoll
            .add(receive, EpollEvent::new(EpollFlags::EPOLLIN, RECEIVE_TOKEN))
            .map_err(|err| TransportError::os("epoll_ctl", err))?;
        let registration = event_loop
            .register(epoll.0.as_raw_fd(), Interest::Readable, callback)
            .map_err(|err| TransportError::os("register", err))?;
        trace!(registration = registration.0, "readiness registered");
        Ok(Self {
            epoll,
            event_loop,
            registration,
            write_armed: false,
            peer: PeerWatch::Unwatched,
        })
    }

    /// Collects pending readiness without blocking.
    pub(crate) fn poll(&self) -> TransportResult<Readiness> {
        let mut events = [EpollEvent::empty(); 2];
        let count = loop {
            match self.epoll.wait(&mut events, EpollTimeout::ZERO) {
                Err(Errno::EINTR) => continue,
                other => break other.map_err(|err| TransportError::os("epoll_wait", err))?,
            }
        };

        let mut readiness = Readiness::default();
        for event in &events[..count] {
            let flags = event.events();
            match event.data() {
                RECEIVE_TOKEN => {
                    readiness.readable |= flags.intersects(
                        EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                    );
                    readiness.writable |= flags.contains(EpollFlags::EPOLLOUT);
                }
                SEND_TOKEN => {
                    readiness.writable |= flags.contains(EpollFlags::EPOLLOUT);
                    readiness.hangup |= flags.intersects(
                        EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLERR,
                    );
                }
                _ => {
                    return Err(TransportError::Protocol(
                        "readiness event from an unknown source",
                    ))
                }
            }
        }
        Ok(readiness)
    }

    pub(crate) fn write_armed(&self) -> bool {
        self.write_armed
    }

    /// Starts watching the peer's send right for hang-up. No-op for stream
    /// sockets, before the peer is known, or once it is already watched.
    pub(crate) fn watch_peer(&mut self, backend: &Backend) -> TransportResult<()> {
        if self.peer != PeerWatch::Unwatched || backend.send_fd_is_receive_fd() {
            return Ok(());
        }
        let Some(send) = backend.send_fd() else {
            return Ok(());
        };
        self.epoll
            .add(send, EpollEvent::new(self.peer_flags(), SEND_TOKEN))
            .map_err(|err| TransportError::os("epoll_ctl", err))?;
        self.peer = PeerWatch::Watched;
        trace!("peer send right watched");
        Ok(())
    }

    /// Drops the peer's send right from the set after a hang-up.
    pub(crate) fn forget_peer(&mut self, backend: &Backend) -> TransportResult<()> {
        if self.peer == PeerWatch::Watched {
            if let Some(send) = backend.send_fd() {
                self.epoll
                    .delete(send)
                    .map_err(|err| TransportError::os("epoll_ctl", err))?;
            }
        }
        self.peer = PeerWatch::HungUp;
        self.write_armed = false;
        Ok(())
    }

    fn peer_flags(&self) -> EpollFlags {
        if self.write_armed {
            EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLOUT
        } else {
            EpollFlags::EPOLLRDHUP
        }
    }

    /// Arms or disarms writability reporting for the backend's send side.
    pub(crate) fn set_write_interest(
        &mut self,
        backend: &Backend,
        enabled: bool,
    ) -> TransportResult<()> {
        if self.write_armed == enabled {
            return Ok(());
        }
        if backend.send_fd_is_receive_fd() {
            let flags = if enabled {
                EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT
            } else {
                EpollFlags::EPOLLIN
            };
            let mut event = EpollEvent::new(flags, RECEIVE_TOKEN);
            self.epoll
                .modify(backend.receive_fd(), &mut event)
                .map_err(|err| TransportError::os("epoll_ctl", err))?;
            self.write_armed = enabled;
        } else {
            match self.peer {
                PeerWatch::HungUp if enabled => return Err(TransportError::PeerClosed),
                PeerWatch::HungUp => self.write_armed = false,
                PeerWatch::Unwatched => {
                    backend.send_fd().ok_or(TransportError::NotOpen)?;
                    self.write_armed = enabled;
                    self.watch_peer(backend)?;
                }
                PeerWatch::Watched => {
                    let send = backend.send_fd().ok_or(TransportError::NotOpen)?;
                    self.write_armed = enabled;
                    let mut event = EpollEvent::new(self.peer_flags(), SEND_TOKEN);
                    self.epoll
                        .modify(send, &mut event)
                        .map_err(|err| TransportError::os("epoll_ctl", err))?;
                }
            }
        }
        trace!(enabled, "write interest updated");
        Ok(())
    }

    /// Drops the loop registration. The epoll instance closes with `self`.
    pub(crate) fn remove(self) {
        self.event_loop.set_enabled(self.registration, false);
        self.event_loop.unregister(self.registration);
        trace!(registration = self.registration.0, "readiness unregistered");
    }
}
