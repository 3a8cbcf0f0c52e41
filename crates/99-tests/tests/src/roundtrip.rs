#![cfg(test)]
//! Byte and descriptor round-trips across frame sizes.

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use anyhow::Result;
use transport::wire::PORT_MESSAGE_PAYLOAD_MAX;
use transport::{BackendKind, TransportConfig};

use crate::support;

const LARGE: usize = 100 * 1024;

fn roundtrip(kind: BackendKind, size: usize, fd_count: usize) -> Result<()> {
    let pair = support::pair(kind, TransportConfig::default())?;
    let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
    let originals = (0..fd_count)
        .map(|_| UnixStream::pair())
        .collect::<std::io::Result<Vec<_>>>()?;
    let borrowed: Vec<BorrowedFd<'_>> = originals.iter().map(|(ours, _)| ours.as_fd()).collect();
    let expected = borrowed
        .iter()
        .map(|fd| support::identity(*fd))
        .collect::<Result<Vec<_>>>()?;

    pair.near.transfer(&payload, &borrowed)?;
    let got = support::collect(&pair.event_loop, &pair.far, |r| {
        r.bytes.len() >= size && r.fds.len() >= fd_count
    })?;

    assert_eq!(got.bytes.len(), size, "{kind:?}/{size}");
    assert!(got.bytes == payload, "{kind:?}/{size}: payload differs");
    let identities = got
        .fds
        .iter()
        .map(|fd| support::identity(fd.as_fd()))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(identities, expected, "{kind:?}/{size}");

    let sent = pair.near.stats();
    let received = pair.far.stats();
    assert_eq!(sent.bytes_sent, size as u64);
    assert_eq!(sent.descriptors_sent, fd_count as u64);
    assert_eq!(received.bytes_received, size as u64);
    assert_eq!(received.descriptors_received, fd_count as u64);
    Ok(())
}

#[test]
fn socket_roundtrips() -> Result<()> {
    roundtrip(BackendKind::Socket, 0, 0)?;
    roundtrip(BackendKind::Socket, 1, 1)?;
    roundtrip(BackendKind::Socket, LARGE, 2)
}

#[test]
fn port_roundtrips() -> Result<()> {
    assert!(LARGE > 3 * PORT_MESSAGE_PAYLOAD_MAX);
    roundtrip(BackendKind::Port, 0, 0)?;
    roundtrip(BackendKind::Port, 0, 1)?;
    roundtrip(BackendKind::Port, 1, 1)?;
    roundtrip(BackendKind::Port, LARGE, 2)
}

#[test]
fn received_descriptor_is_the_same_socket() -> Result<()> {
    use std::io::{Read, Write};

    let pair = support::pair(BackendKind::Port, TransportConfig::default())?;
    let (ours, mut theirs) = UnixStream::pair()?;
    pair.near.transfer(b"fd", &[ours.as_fd()])?;
    drop(ours);

    let mut got = support::collect(&pair.event_loop, &pair.far, |r| !r.fds.is_empty())?;
    let mut passed = UnixStream::from(got.fds.remove(0));
    passed.write_all(b"through the passed end")?;
    let mut buf = [0u8; 22];
    theirs.read_exact(&mut buf)?;
    assert_eq!(&buf, b"through the passed end");
    Ok(())
}
