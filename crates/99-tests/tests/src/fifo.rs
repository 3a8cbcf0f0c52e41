#![cfg(test)]
//! Send-queue ordering and the backpressure bound on both backends.

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use anyhow::Result;
use transport::config::DEFAULT_SEND_QUEUE_CAPACITY;
use transport::{BackendKind, TransportConfig, TransportError};
use transport_scenarios::{decode_frames, frame_payload};

use crate::support;

const FRAME_LEN: usize = 16 * 1024;

fn frame(seq: u32) -> Vec<u8> {
    frame_payload(seq, FRAME_LEN)
}

fn bound_and_order(kind: BackendKind) -> Result<()> {
    let pair = support::pair(kind, TransportConfig::default())?;
    let mut accepted = support::fill_until_queued(&pair.near, frame)?;
    while pair.near.queued_frames() < DEFAULT_SEND_QUEUE_CAPACITY {
        pair.near.transfer(&frame(accepted), &[])?;
        accepted += 1;
    }
    assert_eq!(pair.near.queued_frames(), DEFAULT_SEND_QUEUE_CAPACITY);

    match pair.near.transfer(&frame(accepted), &[]) {
        Err(TransportError::Backpressure { capacity }) => {
            assert_eq!(capacity, DEFAULT_SEND_QUEUE_CAPACITY)
        }
        other => panic!("{kind:?}: 33rd queued frame should be refused, got {other:?}"),
    }
    assert_eq!(pair.near.queued_frames(), DEFAULT_SEND_QUEUE_CAPACITY);
    let stats = pair.near.stats();
    assert_eq!(stats.backpressure_rejections, 1);
    assert_eq!(stats.frames_queued, DEFAULT_SEND_QUEUE_CAPACITY as u64);

    let expected_len = accepted as usize * FRAME_LEN;
    let got = support::collect(&pair.event_loop, &pair.far, |r| {
        r.bytes.len() >= expected_len
    })?;
    let seqs = decode_frames(&got.bytes).map_err(anyhow::Error::msg)?;
    assert_eq!(seqs, (0..accepted).collect::<Vec<_>>());
    assert_eq!(pair.near.queued_frames(), 0);
    assert_eq!(pair.near.stats().frames_sent, accepted as u64);
    Ok(())
}

#[test]
fn socket_queue_is_bounded_and_ordered() -> Result<()> {
    bound_and_order(BackendKind::Socket)
}

#[test]
fn port_queue_is_bounded_and_ordered() -> Result<()> {
    bound_and_order(BackendKind::Port)
}

#[test]
fn queued_descriptors_stay_with_their_frames() -> Result<()> {
    for kind in [BackendKind::Socket, BackendKind::Port] {
        let pair = support::pair(kind, TransportConfig::default())?;
        let mut accepted = support::fill_until_queued(&pair.near, frame)?;

        let originals = (0..3)
            .map(|_| UnixStream::pair())
            .collect::<std::io::Result<Vec<_>>>()?;
        let mut expected = Vec::new();
        for (ours, _theirs) in &originals {
            let fd: BorrowedFd<'_> = ours.as_fd();
            expected.push(support::identity(fd)?);
            pair.near.transfer(&frame(accepted), &[fd])?;
            accepted += 1;
        }
        assert!(pair.near.queued_frames() >= 4);
        // The caller keeps its originals; the queue holds duplicates.
        drop(originals);

        let expected_len = accepted as usize * FRAME_LEN;
        let got = support::collect(&pair.event_loop, &pair.far, |r| {
            r.bytes.len() >= expected_len && r.fds.len() >= 3
        })?;
        let seqs = decode_frames(&got.bytes).map_err(anyhow::Error::msg)?;
        assert_eq!(seqs, (0..accepted).collect::<Vec<_>>());
        let identities = got
            .fds
            .iter()
            .map(|fd| support::identity(fd.as_fd()))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(identities, expected, "{kind:?}");
    }
    Ok(())
}
