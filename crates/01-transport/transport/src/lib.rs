//! Duplex inter-process transport over Unix descriptors.
//!
//! A [`Transport`] owns one end of a channel and exposes the contract a message
//! codec builds on: [`Transport::transfer`] to send bytes plus descriptors and
//! [`Transport::drain_available`] to collect whatever has arrived. Two backends
//! sit behind it:
//! * stream sockets – connected `AF_UNIX` byte streams, open on construction.
//! * capability ports – seqpacket-based ports addressed by send rights, which
//!   exchange rights in a one-shot handshake before any data flows.
//!
//! Readiness is delivered by an external [`EventLoop`]; the transport never
//! blocks except in [`Transport::wait_until_readable`] and the bounded
//! initiator handshake.

mod backend;
pub mod config;
mod error;
pub mod event;
mod handshake;
mod notifier;
pub mod port;
mod send_queue;
pub mod socket;
mod stats;
mod sys;
mod transport;
pub mod wire;

pub use backend::{BackendKind, EndpointHandle, PeerCapability};
pub use config::TransportConfig;
pub use error::{HandshakeError, TransportError, TransportResult};
pub use event::{EventCallback, EventLoop, Interest, RegistrationId};
pub use port::{ReceiveRight, SendRight};
pub use stats::TransportStats;
pub use transport::{FatalHook, ReadHook, ReadResult, Transport, TransportState};
