#![cfg(test)]
//! Scenario drivers pushing traffic through event-driven transport pairs.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use parking_lot::Mutex;
use transport::config::DEFAULT_SEND_QUEUE_CAPACITY;
use transport::{BackendKind, Transport, TransportConfig};
use transport_scenarios::{
    decode_frames, verify_backpressure, verify_burst, verify_flood, DrainReport, ScenarioConfig,
    ScenarioDriver, ScenarioStats, FRAME_HEADER_LEN,
};

use crate::support::{self, SETTLE};

fn run(kind: BackendKind, config: ScenarioConfig) -> Result<(Vec<u32>, ScenarioStats)> {
    let pair = support::pair(kind, TransportConfig::default())?;
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    pair.far.set_read_hook(Some(Box::new(move |transport: &Transport| {
        if let Ok(chunk) = transport.drain_available(|| {}) {
            sink.borrow_mut().extend(chunk.bytes);
        }
    })))?;

    let stats = Arc::new(Mutex::new(ScenarioStats::default()));
    let mut driver = ScenarioDriver::new(config, Arc::clone(&stats));
    let expected_len =
        config.kind.total_frames() as usize * config.payload_len.max(FRAME_HEADER_LEN);
    let deadline = Instant::now() + SETTLE * 4;

    while received.borrow().len() < expected_len {
        ensure!(
            Instant::now() < deadline,
            "{kind:?}: stalled at {} of {expected_len} bytes",
            received.borrow().len()
        );
        if !driver.is_complete() {
            driver.step(&pair.near)?;
        }
        pair.event_loop.turn(Some(Duration::from_millis(5)))?;
    }

    let frames = decode_frames(&received.borrow()).map_err(anyhow::Error::msg)?;
    let stats = *stats.lock();
    Ok((frames, stats))
}

#[test]
fn flood_frames() -> Result<()> {
    for kind in [BackendKind::Socket, BackendKind::Port] {
        let (frames, stats) = run(kind, ScenarioConfig::flood(2_000))?;
        let drain = DrainReport {
            frames: &frames,
            max_queue_depth: None,
        };
        verify_flood(&drain, &stats, 2_000).map_err(anyhow::Error::msg)?;
    }
    Ok(())
}

#[test]
fn burst_frames() -> Result<()> {
    for kind in [BackendKind::Socket, BackendKind::Port] {
        let config = ScenarioConfig::burst(20, 50).with_payload_len(256);
        let (frames, stats) = run(kind, config)?;
        let drain = DrainReport {
            frames: &frames,
            max_queue_depth: Some(stats.max_queue_depth as usize),
        };
        verify_burst(&drain, &stats, 1_000, DEFAULT_SEND_QUEUE_CAPACITY)
            .map_err(anyhow::Error::msg)?;
    }
    Ok(())
}

#[test]
fn backpressure_frames() -> Result<()> {
    for kind in [BackendKind::Socket, BackendKind::Port] {
        let config = ScenarioConfig::backpressure(300).with_payload_len(16 * 1024);
        let (frames, stats) = run(kind, config)?;
        let drain = DrainReport {
            frames: &frames,
            max_queue_depth: Some(stats.max_queue_depth as usize),
        };
        verify_backpressure(&drain, &stats, 300).map_err(anyhow::Error::msg)?;
        assert!(stats.max_queue_depth as usize <= DEFAULT_SEND_QUEUE_CAPACITY);
    }
    Ok(())
}
