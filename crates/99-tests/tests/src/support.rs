#![cfg(test)]
//! Shared fixtures: paired transports on one event loop and collection helpers.

use std::cell::RefCell;
use std::fs::File;
use std::io::IoSlice;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use runtime_native::NativeEventLoop;
use tracing_subscriber::EnvFilter;
use transport::{
    socket, BackendKind, PeerCapability, ReadResult, SendRight, Transport, TransportConfig,
    TransportError,
};

/// Generous ceiling for anything the loop should finish almost immediately.
pub const SETTLE: Duration = Duration::from_secs(5);
const TURN: Duration = Duration::from_millis(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Pair {
    pub event_loop: Rc<NativeEventLoop>,
    /// Connect-mode side.
    pub near: Transport,
    /// Listen-mode side for ports; the other socket end otherwise.
    pub far: Transport,
}

pub fn pair(kind: BackendKind, config: TransportConfig) -> Result<Pair> {
    init_tracing();
    match kind {
        BackendKind::Socket => socket_pair(config),
        BackendKind::Port => port_pair(config),
    }
}

pub fn socket_pair(config: TransportConfig) -> Result<Pair> {
    let event_loop = NativeEventLoop::shared();
    let (a, b) = socket::pair()?;
    let near = Transport::connect(event_loop.clone(), PeerCapability::Socket(a), config.clone())?;
    let far = Transport::connect(event_loop.clone(), PeerCapability::Socket(b), config)?;
    Ok(Pair {
        event_loop,
        near,
        far,
    })
}

pub fn port_pair(config: TransportConfig) -> Result<Pair> {
    let event_loop = NativeEventLoop::shared();
    let far = Transport::listen(event_loop.clone(), config.clone())?;
    let capability = far.clone_for_transfer()?;
    ensure!(
        matches!(capability, PeerCapability::Port(_)),
        "listener minted a non-port capability"
    );
    let near = Transport::connect(event_loop.clone(), capability, config)?;
    let opened = event_loop.run_until(SETTLE, || far.is_open())?;
    ensure!(opened, "listener never completed the handshake");
    Ok(Pair {
        event_loop,
        near,
        far,
    })
}

/// Drains `receiver` while turning the loop until `done` holds for everything
/// collected so far.
pub fn collect(
    event_loop: &NativeEventLoop,
    receiver: &Transport,
    mut done: impl FnMut(&ReadResult) -> bool,
) -> Result<ReadResult> {
    let mut collected = ReadResult::default();
    let deadline = Instant::now() + SETTLE;
    loop {
        let chunk = receiver.drain_available(|| {})?;
        collected.bytes.extend(chunk.bytes);
        collected.fds.extend(chunk.fds);
        if done(&collected) {
            return Ok(collected);
        }
        if Instant::now() >= deadline {
            bail!(
                "timed out after collecting {} bytes and {} descriptors",
                collected.bytes.len(),
                collected.fds.len()
            );
        }
        event_loop.turn(Some(TURN))?;
    }
}

/// Transfers `frame` until it lands in the send queue instead of the OS.
/// Returns how many frames were accepted, the queued one included.
pub fn fill_until_queued(sender: &Transport, mut frame: impl FnMut(u32) -> Vec<u8>) -> Result<u32> {
    for seq in 0..100_000u32 {
        sender.transfer(&frame(seq), &[])?;
        if sender.queued_frames() > 0 {
            return Ok(seq + 1);
        }
    }
    bail!("the OS never pushed back")
}

/// Underlying OS identity of a descriptor.
pub fn identity(fd: BorrowedFd<'_>) -> Result<(u64, u64)> {
    let file = File::from(fd.try_clone_to_owned().context("dup for fstat")?);
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

/// Records fatal errors a transport reports.
pub fn capture_fatal(transport: &Transport) -> Result<Rc<RefCell<Vec<String>>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    transport.set_fatal_hook(Some(Box::new(move |err: &TransportError| {
        assert!(err.is_fatal(), "non-fatal error routed to the fatal hook: {err}");
        sink.borrow_mut().push(format!("{err:?}"));
    })))?;
    Ok(seen)
}

/// A fresh send right addressing a port transport.
pub fn port_right(transport: &Transport) -> Result<SendRight> {
    match transport.clone_for_transfer()? {
        PeerCapability::Port(right) => Ok(right),
        other => bail!("expected a port capability, got {other:?}"),
    }
}

/// Writes one hand-built datagram straight to a port, bypassing any transport.
pub fn send_datagram(right: &SendRight, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> Result<()> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage<'_>] = if raw.is_empty() { &[] } else { &rights };
    sendmsg::<()>(
        right.as_fd().as_raw_fd(),
        &[IoSlice::new(bytes)],
        cmsgs,
        MsgFlags::MSG_DONTWAIT,
        None,
    )?;
    Ok(())
}
