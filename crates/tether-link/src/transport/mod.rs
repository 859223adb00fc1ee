//! Transport adapters for the client-server channel.
//!
//! Two adapters implement one contract:
//!
//! - [`SocketTransport`]: persistent duplex TCP with newline-delimited
//!   JSON envelopes; lowest latency, server can push at any time
//! - [`PollingTransport`]: HTTP POST per envelope with inbound messages
//!   piggybacked on responses; strictly poorer latency but no
//!   persistent-connection failure mode
//!
//! The controller treats both uniformly through [`Transport`] and decides
//! which one is active; adapters never reconnect on their own.
//!
//! ## Inbound Delivery
//!
//! `open` installs an unbounded channel sender. The socket adapter's read
//! loop pushes every inbound envelope through it and drops it on EOF or a
//! read error, so the controller observes the disconnect as a closed
//! channel. The polling adapter holds the sender to keep the channel
//! alive but returns inbound envelopes directly from `send` and `poll`.

mod polling;
mod socket;

pub use polling::PollingTransport;
pub use socket::SocketTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::{Envelope, Result};

/// Bidirectional message channel to the server.
///
/// Implementations are owned by the controller actor; `&mut self`
/// methods are never called concurrently.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection.
    ///
    /// `inbound` is the push channel for server-initiated envelopes. A
    /// fresh sender is installed on every open; senders from a previous
    /// open must not outlive it.
    async fn open(&mut self, inbound: mpsc::UnboundedSender<Envelope>) -> Result<()>;

    /// Sends one envelope.
    ///
    /// Delivery is fire-and-forget: a returned `Ok` means the transport
    /// accepted the envelope, not that the peer processed it. The returned
    /// envelopes are inbound messages piggybacked on the exchange, always
    /// empty for the socket adapter.
    async fn send(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>>;

    /// Drains pending inbound envelopes without sending.
    ///
    /// Push transports have nothing to drain; the default is a no-op.
    async fn poll(&mut self) -> Result<Vec<Envelope>> {
        Ok(Vec::new())
    }

    /// Returns true while the connection is usable.
    fn is_open(&self) -> bool;

    /// Tears the connection down. Idempotent.
    async fn close(&mut self);
}
