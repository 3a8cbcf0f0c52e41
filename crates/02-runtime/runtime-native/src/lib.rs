#![deny(missing_docs)]
//! Native single-threaded event loop that drives transport readiness.
//!
//! Registrations live in a slot table; each [`NativeEventLoop::turn`] polls all
//! enabled descriptors once with `poll(2)` and runs the callbacks of those that
//! are ready. Callbacks run with no internal borrow held, so they may register,
//! unregister, or close transports (including their own registration).

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::trace;
use transport::{EventCallback, EventLoop, Interest, RegistrationId};

/// Longest single wait inside [`NativeEventLoop::run_until`].
const RUN_UNTIL_SLICE: Duration = Duration::from_millis(10);

type SharedCallback = Rc<RefCell<EventCallback>>;

struct Entry {
    id: RegistrationId,
    fd: RawFd,
    interest: Interest,
    enabled: bool,
    callback: SharedCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

impl Registry {
    fn find(&self, id: RegistrationId) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.id == id)
    }
}

/// poll(2)-backed loop implementing [`EventLoop`] for one thread.
#[derive(Default)]
pub struct NativeEventLoop {
    registry: RefCell<Registry>,
}

impl NativeEventLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty loop behind an `Rc`, the form transports expect.
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::new())
    }

    /// Number of live registrations, enabled or not.
    pub fn len(&self) -> usize {
        self.registry.borrow().entries.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `timeout` (forever for `None`) and runs every ready
    /// callback once. Returns how many callbacks ran.
    pub fn turn(&self, timeout: Option<Duration>) -> nix::Result<usize> {
        let snapshot: Vec<(RegistrationId, RawFd, PollFlags, SharedCallback)> = self
            .registry
            .borrow()
            .entries
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| {
                (
                    entry.id,
                    entry.fd,
                    poll_flags(entry.interest),
                    Rc::clone(&entry.callback),
                )
            })
            .collect();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(duration) => {
                PollTimeout::from(u16::try_from(duration.as_millis()).unwrap_or(u16::MAX))
            }
        };
        let ready: Vec<usize> = {
            let mut fds: Vec<PollFd<'_>> = snapshot
                .iter()
                .map(|(_, fd, flags, _)| {
                    // SAFETY: registered descriptors must stay open until they are
                    // unregistered, and nothing unregisters while this block runs.
                    let fd = unsafe { BorrowedFd::borrow_raw(*fd) };
                    PollFd::new(fd, *flags)
                })
                .collect();
            loop {
                match poll(&mut fds, timeout) {
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(err),
                    Ok(_) => break,
                }
            }
            fds.iter()
                .enumerate()
                .filter(|(_, fd)| fd.revents().is_some_and(|revents| !revents.is_empty()))
                .map(|(index, _)| index)
                .collect()
        };

        let mut fired = 0;
        for index in ready {
            let (id, _, _, callback) = &snapshot[index];
            // An earlier callback this turn may have dropped or paused it.
            if !self.is_enabled(*id) {
                continue;
            }
            if let Ok(mut callback) = callback.try_borrow_mut() {
                (*callback)();
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Turns the loop until `done` returns true or `timeout` elapses.
    /// Returns whether `done` was satisfied.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> nix::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if self.is_empty() {
                std::thread::sleep(remaining.min(RUN_UNTIL_SLICE));
                continue;
            }
            self.turn(Some(remaining.min(RUN_UNTIL_SLICE)))?;
        }
    }

    fn is_enabled(&self, id: RegistrationId) -> bool {
        self.registry
            .borrow()
            .find(id)
            .is_some_and(|entry| entry.enabled)
    }
}

impl EventLoop for NativeEventLoop {
    fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: EventCallback,
    ) -> nix::Result<RegistrationId> {
        if fd < 0 {
            return Err(Errno::EBADF);
        }
        let mut registry = self.registry.borrow_mut();
        registry.next_id += 1;
        let id = RegistrationId(registry.next_id);
        registry.entries.push(Entry {
            id,
            fd,
            interest,
            enabled: true,
            callback: Rc::new(RefCell::new(callback)),
        });
        trace!(id = id.0, fd, ?interest, "registered");
        Ok(id)
    }

    fn set_enabled(&self, id: RegistrationId, enabled: bool) {
        let mut registry = self.registry.borrow_mut();
        if let Some(entry) = registry.entries.iter_mut().find(|entry| entry.id == id) {
            entry.enabled = enabled;
        }
    }

    fn unregister(&self, id: RegistrationId) {
        let removed = {
            let mut registry = self.registry.borrow_mut();
            let index = registry.entries.iter().position(|entry| entry.id == id);
            index.map(|index| registry.entries.remove(index))
        };
        if removed.is_some() {
            trace!(id = id.0, "unregistered");
        }
        // The callback may own captures with their own Drop logic; release it
        // only after the registry borrow is gone.
        drop(removed);
    }
}

fn poll_flags(interest: Interest) -> PollFlags {
    match interest {
        Interest::Readable => PollFlags::POLLIN,
        Interest::Writable => PollFlags::POLLOUT,
    }
}
