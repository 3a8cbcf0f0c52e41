#![cfg(test)]
//! Capabilities and released endpoints crossing an ownership boundary. A
//! worker thread with its own event loop stands in for the other process.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use runtime_native::NativeEventLoop;
use transport::{EndpointHandle, PeerCapability, Transport, TransportConfig};

use crate::support::{self, SETTLE};

#[test]
fn cloned_capability_connects_from_another_thread() -> Result<()> {
    support::init_tracing();
    let (tx, rx) = bounded::<PeerCapability>(1);
    let replies = Arc::new(Mutex::new(Vec::<String>::new()));

    let worker = thread::spawn({
        let replies = Arc::clone(&replies);
        move || -> Result<()> {
            let event_loop = NativeEventLoop::shared();
            let capability = rx.recv()?;
            let transport =
                Transport::connect(event_loop.clone(), capability, TransportConfig::default())?;
            transport.transfer(b"hello from worker", &[])?;
            let reply = support::collect(&event_loop, &transport, |r| r.bytes.len() >= 5)?;
            replies.lock().push(String::from_utf8(reply.bytes)?);
            Ok(())
        }
    });

    let event_loop = NativeEventLoop::shared();
    let listener = Transport::listen(event_loop.clone(), TransportConfig::default())?;
    tx.send(listener.clone_for_transfer()?)?;
    assert!(event_loop.run_until(SETTLE, || listener.is_open())?);
    let got = support::collect(&event_loop, &listener, |r| r.bytes.len() >= 17)?;
    assert_eq!(got.bytes, b"hello from worker");
    listener.transfer(b"reply", &[])?;

    worker.join().expect("worker panicked")?;
    assert_eq!(*replies.lock(), vec!["reply".to_string()]);
    Ok(())
}

#[test]
fn released_endpoint_moves_to_another_thread() -> Result<()> {
    let pair = support::port_pair(TransportConfig::default())?;
    let (tx, rx) = bounded::<EndpointHandle>(1);
    let done = Arc::new(Mutex::new(false));

    let worker = thread::spawn({
        let done = Arc::clone(&done);
        move || -> Result<()> {
            let event_loop = NativeEventLoop::shared();
            let handle = rx.recv()?;
            let adopted = Transport::adopt(event_loop.clone(), handle, TransportConfig::default())?;
            adopted.transfer(b"adopted", &[])?;
            let ack = support::collect(&event_loop, &adopted, |r| r.bytes.len() >= 3)?;
            anyhow::ensure!(ack.bytes == b"ack", "unexpected ack {:?}", ack.bytes);
            *done.lock() = true;
            Ok(())
        }
    });

    pair.near.transfer(b"before ", &[])?;
    tx.send(pair.near.release_for_transfer()?)?;

    let got = support::collect(&pair.event_loop, &pair.far, |r| r.bytes.len() >= 14)?;
    assert_eq!(got.bytes, b"before adopted");
    pair.far.transfer(b"ack", &[])?;

    worker.join().expect("worker panicked")?;
    assert!(*done.lock());
    Ok(())
}
