use std::net::SocketAddr;

use async_trait::async_trait;
use http::{HeaderMap, Uri};
use tokio::time::Instant;

use crate::packet::Packet;

/// Errors surfaced by a transport. Temporary failures are retried by the
/// session with a fresh deadline; everything else closes the session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("temporary transport failure: {0}")]
    Temporary(String),

    #[error("transport closed")]
    Closed,

    #[error("transport deadline exceeded")]
    DeadlineExceeded,

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, TransportError::Temporary(_))
    }
}

/// Pause/resume capability of a transport. A paused polling transport
/// flushes a `NOOP` to its pending request and buffers everything else,
/// which is what allows the upgrade flow to drain it safely.
pub trait Pauser: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Contract between a byte transport and the [`Session`](crate::Session)
/// driving it. One instance frames packets over one client connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The transport name advertised in the open packet ("polling",
    /// "websocket", ...).
    fn name(&self) -> &'static str;

    /// Read the next packet from the client. Blocks until a packet is
    /// framed, the deadline set by [`set_read_deadline`](Self::set_read_deadline)
    /// elapses, or the connection fails.
    async fn read_packet(&self) -> Result<Packet, TransportError>;

    /// Write one packet to the client.
    async fn write_packet(&self, packet: Packet) -> Result<(), TransportError>;

    fn set_read_deadline(&self, deadline: Instant);
    fn set_write_deadline(&self, deadline: Instant);

    fn url(&self) -> Uri;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn remote_header(&self) -> HeaderMap;

    async fn close(&self);

    /// Upgrade participation. Transports that cannot pause return `None`
    /// and upgrades away from them are aborted.
    fn pauser(&self) -> Option<&dyn Pauser> {
        None
    }
}
