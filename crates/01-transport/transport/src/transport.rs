//! The public transport: lifecycle, read hooks, and the codec-facing
//! transfer/drain contract over either backend.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::poll::{PollFlags, PollTimeout};
use tracing::{debug, error, trace, warn};

use crate::backend::{Backend, BackendKind, EndpointHandle, PeerCapability, RecvStatus};
use crate::config::TransportConfig;
use crate::event::{EventCallback, EventLoop};
use crate::handshake::{self, HandshakeProgress};
use crate::notifier::Notifier;
use crate::port::{PortEndpoint, ReceiveRight};
use crate::send_queue::{OutgoingFrame, Progress, SendQueue};
use crate::socket::SocketEndpoint;
use crate::stats::TransportStats;
use crate::sys;
use crate::{TransportError, TransportResult};

/// Invoked on the loop's turn whenever an Open transport has data to read.
pub type ReadHook = Box<dyn FnMut(&Transport)>;
/// Receives fatal errors, raised while dispatching readiness or returned from a
/// direct call, after the transport has been closed.
pub type FatalHook = Box<dyn FnMut(&TransportError)>;

/// Lifecycle of a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    /// Waiting for the capability exchange; no application data flows.
    Handshaking,
    Open,
    /// Closed explicitly, on drop, after a fatal error, or by release.
    Closed,
}

/// Bytes and descriptors collected by one drain, in arrival order.
#[derive(Debug, Default)]
pub struct ReadResult {
    pub bytes: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl ReadResult {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.fds.is_empty()
    }
}

enum Action {
    Idle,
    Deliver,
}

struct Core {
    state: TransportState,
    released: bool,
    backend: Option<Backend>,
    notifier: Option<Notifier>,
    queue: SendQueue<OutgoingFrame>,
    config: TransportConfig,
    stats: TransportStats,
}

struct Shared {
    core: RefCell<Core>,
    read_hook: RefCell<Option<ReadHook>>,
    hook_epoch: Cell<u64>,
    fatal_hook: RefCell<Option<FatalHook>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.core.get_mut().shutdown() {
            debug!("transport dropped");
        }
    }
}

/// One endpoint of a duplex channel, driven by a single-threaded event loop.
pub struct Transport {
    shared: Rc<Shared>,
}

impl Transport {
    /// Connects to a peer. Socket transports are Open immediately; port
    /// transports send their introduction first and fail if it cannot be
    /// delivered within the handshake timeout.
    pub fn connect(
        event_loop: Rc<dyn EventLoop>,
        peer: PeerCapability,
        config: TransportConfig,
    ) -> TransportResult<Self> {
        config.validate()?;
        match peer {
            PeerCapability::Socket(fd) => {
                let backend = Backend::Socket(SocketEndpoint::new(fd, config.read_chunk_size)?);
                Self::install(event_loop, backend, TransportState::Open, config)
            }
            PeerCapability::Port(peer) => {
                let endpoint = PortEndpoint::new(ReceiveRight::create()?, Some(peer));
                let transport = Self::install(
                    event_loop,
                    Backend::Port(endpoint),
                    TransportState::Handshaking,
                    config,
                )?;
                transport.initiate_handshake()?;
                Ok(transport)
            }
        }
    }

    /// Creates a port transport that waits for a peer's introduction. Hand
    /// `clone_for_transfer()` to whoever should connect.
    pub fn listen(event_loop: Rc<dyn EventLoop>, config: TransportConfig) -> TransportResult<Self> {
        config.validate()?;
        let endpoint = PortEndpoint::new(ReceiveRight::create()?, None);
        Self::install(
            event_loop,
            Backend::Port(endpoint),
            TransportState::Handshaking,
            config,
        )
    }

    /// Wraps a handle produced by [`Transport::release_for_transfer`]. A port
    /// handle without a peer resumes listening.
    pub fn adopt(
        event_loop: Rc<dyn EventLoop>,
        handle: EndpointHandle,
        config: TransportConfig,
    ) -> TransportResult<Self> {
        config.validate()?;
        let state = match &handle {
            EndpointHandle::Port { peer: None, .. } => TransportState::Handshaking,
            _ => TransportState::Open,
        };
        let backend = Backend::from_handle(handle, &config)?;
        Self::install(event_loop, backend, state, config)
    }

    fn install(
        event_loop: Rc<dyn EventLoop>,
        backend: Backend,
        state: TransportState,
        config: TransportConfig,
    ) -> TransportResult<Self> {
        let kind = backend.kind();
        let shared = Rc::new(Shared {
            core: RefCell::new(Core {
                state,
                released: false,
                backend: None,
                notifier: None,
                queue: SendQueue::new(config.send_queue_capacity),
                config,
                stats: TransportStats::default(),
            }),
            read_hook: RefCell::new(None),
            hook_epoch: Cell::new(0),
            fatal_hook: RefCell::new(None),
        });

        let weak = Rc::downgrade(&shared);
        let callback: EventCallback = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                Transport { shared }.dispatch();
            }
        });
        let mut notifier = Notifier::install(event_loop, backend.receive_fd(), callback)?;
        if let Err(err) = notifier.watch_peer(&backend) {
            notifier.remove();
            return Err(err);
        }
        {
            let mut core = shared.core.borrow_mut();
            core.backend = Some(backend);
            core.notifier = Some(notifier);
        }
        debug!(?kind, ?state, "transport installed");
        Ok(Transport { shared })
    }

    fn initiate_handshake(&self) -> TransportResult<()> {
        let mut core = self.shared.core.borrow_mut();
        let timeout = core.config.handshake_timeout;
        let Some(Backend::Port(endpoint)) = core.backend.as_ref() else {
            return Err(TransportError::Protocol(
                "handshake requested on a backend without capability exchange",
            ));
        };
        handshake::initiate(endpoint, timeout)?;
        core.state = TransportState::Open;
        debug!("port transport open (initiator)");
        Ok(())
    }

    /// Replaces the read hook. `None` clears it. A hook replaced or cleared
    /// while it is running is not reinstated afterwards.
    pub fn set_read_hook(&self, hook: Option<ReadHook>) -> TransportResult<()> {
        if self.shared.core.borrow().released {
            return Err(TransportError::Released);
        }
        self.shared.hook_epoch.set(self.shared.hook_epoch.get() + 1);
        let previous = self.shared.read_hook.replace(hook);
        drop(previous);
        Ok(())
    }

    pub fn set_fatal_hook(&self, hook: Option<FatalHook>) -> TransportResult<()> {
        if self.shared.core.borrow().released {
            return Err(TransportError::Released);
        }
        let previous = self.shared.fatal_hook.replace(hook);
        drop(previous);
        Ok(())
    }

    /// True once the handshake has completed and until the transport closes.
    pub fn is_open(&self) -> bool {
        let core = self.shared.core.borrow();
        core.state == TransportState::Open && core.notifier.is_some()
    }

    pub fn state(&self) -> TransportState {
        self.shared.core.borrow().state
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.shared.core.borrow().backend.as_ref().map(Backend::kind)
    }

    /// Unregisters readiness and releases the endpoint. Further calls are no-ops.
    pub fn close(&self) {
        let closed = self.shared.core.borrow_mut().shutdown();
        self.clear_read_hook();
        if closed {
            debug!("transport closed");
        }
    }

    /// Blocks until the receive side is readable. On a listening transport,
    /// returns once the introduction has been consumed and the transport is Open.
    pub fn wait_until_readable(&self) -> TransportResult<()> {
        let result = self.shared.core.borrow_mut().wait_readable();
        self.escalate(result)
    }

    /// Sends a frame, queueing whatever the OS will not take right now.
    ///
    /// Queued frames always go out before newer ones. Fails with
    /// [`TransportError::Backpressure`] when the queue is already full.
    pub fn transfer(&self, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> TransportResult<()> {
        let result = self.shared.core.borrow_mut().transfer(bytes, fds);
        self.escalate(result)
    }

    /// Reads everything currently available without blocking. If the peer
    /// shut the channel down, `on_shutdown` runs after the data read so far
    /// has been collected.
    pub fn drain_available<F: FnOnce()>(&self, on_shutdown: F) -> TransportResult<ReadResult> {
        let drained = {
            let mut core = self.shared.core.borrow_mut();
            core.ensure_open().and_then(|()| core.drain())
        };
        let (result, shutdown) = self.escalate(drained)?;
        if shutdown {
            debug!("peer requested shutdown");
            on_shutdown();
        }
        Ok(result)
    }

    /// Extracts the endpoint for another owner and closes this transport for
    /// good. Fails while frames are still queued.
    pub fn release_for_transfer(&self) -> TransportResult<EndpointHandle> {
        let handle = self.shared.core.borrow_mut().release()?;
        self.clear_read_hook();
        debug!("endpoint released for transfer");
        Ok(handle)
    }

    /// Produces an independent capability addressing this endpoint. The
    /// transport itself is unaffected.
    pub fn clone_for_transfer(&self) -> TransportResult<PeerCapability> {
        let core = self.shared.core.borrow();
        core.ensure_live()?;
        core.backend
            .as_ref()
            .ok_or(TransportError::Closed)?
            .clone_capability()
    }

    /// Pushes queued frames to the OS without waiting for writability.
    pub fn flush(&self) -> TransportResult<()> {
        let result = {
            let mut core = self.shared.core.borrow_mut();
            core.ensure_open().and_then(|()| core.flush_queue())
        };
        self.escalate(result)
    }

    pub fn queued_frames(&self) -> usize {
        self.shared.core.borrow().queue.len()
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.core.borrow().stats
    }

    fn dispatch(&self) {
        let action = match self.shared.core.try_borrow_mut() {
            Ok(mut core) => core.on_readiness(),
            // Re-entered from inside a transport call; level-triggered readiness
            // brings us back on the next turn.
            Err(_) => return,
        };
        match action {
            Ok(Action::Idle) => {}
            Ok(Action::Deliver) => self.run_read_hook(),
            Err(err) => self.fail(&err),
        }
    }

    fn run_read_hook(&self) {
        let epoch = self.shared.hook_epoch.get();
        let taken = self.shared.read_hook.borrow_mut().take();
        let Some(mut hook) = taken else {
            return;
        };
        hook(self);
        if self.shared.hook_epoch.get() == epoch {
            *self.shared.read_hook.borrow_mut() = Some(hook);
        }
    }

    /// Closes the transport and reports to the fatal hook when a direct call
    /// hit a fatal error. The error is still returned to the caller.
    fn escalate<T>(&self, result: TransportResult<T>) -> TransportResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.fail(err);
            }
        }
        result
    }

    fn fail(&self, err: &TransportError) {
        error!("transport failed: {err}");
        self.close();
        let taken = self.shared.fatal_hook.borrow_mut().take();
        if let Some(mut hook) = taken {
            hook(err);
            let mut slot = self.shared.fatal_hook.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn clear_read_hook(&self) {
        self.shared.hook_epoch.set(self.shared.hook_epoch.get() + 1);
        let previous = self.shared.read_hook.borrow_mut().take();
        drop(previous);
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Transport");
        if let Ok(core) = self.shared.core.try_borrow() {
            s.field("state", &core.state)
                .field("backend", &core.backend.as_ref().map(Backend::kind))
                .field("queued", &core.queue.len())
                .field("released", &core.released);
        }
        s.finish_non_exhaustive()
    }
}

impl Core {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.released {
            return Err(TransportError::Released);
        }
        match self.state {
            TransportState::Open => Ok(()),
            TransportState::Handshaking => Err(TransportError::NotOpen),
            TransportState::Closed => Err(TransportError::Closed),
        }
    }

    /// Open or still handshaking.
    fn ensure_live(&self) -> TransportResult<()> {
        if self.released {
            return Err(TransportError::Released);
        }
        match self.state {
            TransportState::Closed => Err(TransportError::Closed),
            _ => Ok(()),
        }
    }

    fn on_readiness(&mut self) -> TransportResult<Action> {
        let Some(notifier) = self.notifier.as_ref() else {
            return Ok(Action::Idle);
        };
        let readiness = notifier.poll()?;
        if readiness.is_spurious() {
            warn!("spurious readiness wakeup");
            return Ok(Action::Idle);
        }
        if readiness.hangup {
            self.on_peer_hangup()?;
        } else if readiness.writable {
            self.flush_on_writable()?;
        }
        match self.state {
            TransportState::Handshaking if readiness.readable => {
                self.respond()?;
                Ok(Action::Idle)
            }
            TransportState::Open if readiness.readable || readiness.hangup => Ok(Action::Deliver),
            _ => Ok(Action::Idle),
        }
    }

    /// The peer's receive end is gone: stop watching it and drop anything
    /// still queued for it. The read hook then drains into a shutdown.
    fn on_peer_hangup(&mut self) -> TransportResult<()> {
        if let (Some(notifier), Some(backend)) = (self.notifier.as_mut(), self.backend.as_ref()) {
            notifier.forget_peer(backend)?;
        }
        if !self.queue.is_empty() {
            warn!(dropped = self.queue.len(), "peer vanished with frames queued");
            self.queue.clear();
        }
        debug!("peer hung up");
        Ok(())
    }

    fn wait_readable(&mut self) -> TransportResult<()> {
        self.ensure_live()?;
        loop {
            let backend = self.backend.as_ref().ok_or(TransportError::Closed)?;
            let revents = loop {
                match sys::poll_once(backend.receive_fd(), PollFlags::POLLIN, PollTimeout::NONE) {
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(TransportError::os("poll", err)),
                    Ok(revents) if revents.is_empty() => continue,
                    Ok(revents) => break revents,
                }
            };
            if revents.contains(PollFlags::POLLNVAL) {
                return Err(TransportError::os("poll", Errno::EBADF));
            }
            if self.state != TransportState::Handshaking {
                return Ok(());
            }
            if self.respond()? == HandshakeProgress::Complete {
                return Ok(());
            }
        }
    }

    fn respond(&mut self) -> TransportResult<HandshakeProgress> {
        let Some(Backend::Port(endpoint)) = self.backend.as_mut() else {
            return Err(TransportError::Protocol(
                "handshake requested on a backend without capability exchange",
            ));
        };
        let progress = handshake::respond(endpoint)?;
        if progress == HandshakeProgress::Complete {
            self.state = TransportState::Open;
            if let (Some(notifier), Some(backend)) =
                (self.notifier.as_mut(), self.backend.as_ref())
            {
                notifier.watch_peer(backend)?;
            }
            debug!("port transport open (responder)");
        }
        Ok(progress)
    }

    fn transfer(&mut self, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> TransportResult<()> {
        self.ensure_open()?;
        let limit = self.config.max_descriptors_per_frame;
        if fds.len() > limit {
            return Err(TransportError::TooManyDescriptors {
                count: fds.len(),
                limit,
            });
        }
        let needs_payload = self
            .backend
            .as_ref()
            .ok_or(TransportError::Closed)?
            .needs_payload_for_descriptors();
        if bytes.is_empty() {
            if fds.is_empty() {
                return Ok(());
            }
            if needs_payload {
                return Err(TransportError::EmptyFrameWithDescriptors);
            }
        }

        self.flush_queue()?;
        if !self.queue.is_empty() {
            if self.queue.is_full() {
                self.stats.backpressure_rejections += 1;
                return Err(TransportError::Backpressure {
                    capacity: self.queue.capacity(),
                });
            }
            let frame = OutgoingFrame::pending(bytes, false, fds)?;
            return self.enqueue(frame);
        }

        let backend = self.backend.as_ref().ok_or(TransportError::Closed)?;
        let mut progress = Progress::default();
        let pushed = progress.advance(backend, bytes, fds)?;
        self.stats.record_push(&pushed);
        if pushed.complete {
            trace!(len = bytes.len(), fds = fds.len(), "frame sent");
            return Ok(());
        }
        let frame = OutgoingFrame::pending(&bytes[progress.offset..], progress.descriptors_sent, fds)?;
        self.enqueue(frame)
    }

    fn enqueue(&mut self, frame: OutgoingFrame) -> TransportResult<()> {
        let len = frame.len();
        if self.queue.push(frame).is_err() {
            self.stats.backpressure_rejections += 1;
            return Err(TransportError::Backpressure {
                capacity: self.queue.capacity(),
            });
        }
        self.stats.frames_queued += 1;
        trace!(len, depth = self.queue.len(), "frame queued");
        self.update_write_interest()
    }

    /// Sends queued frames in order until the OS pushes back.
    fn flush_queue(&mut self) -> TransportResult<()> {
        let backend = self.backend.as_ref().ok_or(TransportError::Closed)?;
        while let Some(frame) = self.queue.front_mut() {
            let pushed = frame.push_to(backend)?;
            self.stats.record_push(&pushed);
            if !pushed.complete {
                break;
            }
            self.queue.pop_front();
            trace!(depth = self.queue.len(), "queued frame flushed");
        }
        self.update_write_interest()
    }

    fn flush_on_writable(&mut self) -> TransportResult<()> {
        match self.flush_queue() {
            Err(TransportError::PeerClosed) => {
                warn!(dropped = self.queue.len(), "peer closed with frames queued");
                self.queue.clear();
                self.update_write_interest()
            }
            other => other,
        }
    }

    fn update_write_interest(&mut self) -> TransportResult<()> {
        let wanted = !self.queue.is_empty();
        match (self.notifier.as_mut(), self.backend.as_ref()) {
            (Some(notifier), Some(backend)) if notifier.write_armed() != wanted => {
                notifier.set_write_interest(backend, wanted)
            }
            _ => Ok(()),
        }
    }

    fn drain(&mut self) -> TransportResult<(ReadResult, bool)> {
        let backend = self.backend.as_mut().ok_or(TransportError::Closed)?;
        let mut out = ReadResult::default();
        let shutdown = loop {
            match backend.recv_into(&mut out)? {
                RecvStatus::Received => continue,
                RecvStatus::WouldBlock => break false,
                RecvStatus::Shutdown => break true,
            }
        };
        if !out.is_empty() {
            self.stats.record_read(out.bytes.len(), out.fds.len());
            trace!(bytes = out.bytes.len(), fds = out.fds.len(), shutdown, "drained");
        }
        Ok((out, shutdown))
    }

    fn release(&mut self) -> TransportResult<EndpointHandle> {
        self.ensure_open()?;
        self.flush_queue()?;
        if !self.queue.is_empty() {
            return Err(TransportError::PendingFrames {
                count: self.queue.len(),
            });
        }
        if let Some(notifier) = self.notifier.take() {
            notifier.remove();
        }
        self.released = true;
        self.state = TransportState::Closed;
        let backend = self.backend.take().ok_or(TransportError::Closed)?;
        Ok(backend.into_handle())
    }

    /// Tears everything down once. Returns false if already closed.
    fn shutdown(&mut self) -> bool {
        if self.state == TransportState::Closed {
            return false;
        }
        let was_open = self.state == TransportState::Open;
        if let Some(notifier) = self.notifier.take() {
            notifier.remove();
        }
        self.state = TransportState::Closed;

        if was_open && !self.queue.is_empty() {
            if let Err(err) = self.flush_queue() {
                trace!("final flush failed: {err}");
            }
        }
        if !self.queue.is_empty() {
            warn!(dropped = self.queue.len(), "closing with undelivered frames");
            self.queue.clear();
        }
        if let Some(backend) = self.backend.take() {
            if was_open {
                backend.say_goodbye();
            }
        }
        true
    }
}
