use crate::event::EventError;
use crate::parser::ParseError;

/// Reason reported through `on_disconnect` when a connection goes away
/// without a protocol-level `DISCONNECT`.
pub const CLIENT_DISCONNECT_MSG: &str = "client disconnected";

/// Error type for the socket.io layer. Errors raised while serving a
/// connection flow through its error queue to the `on_error` callback of
/// the namespace they belong to.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error parsing packet: {0}")]
    Parse(#[from] ParseError),

    #[error("error encoding packet: {0}")]
    Encode(serde_json::Error),

    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("failed to connect to the namespace")]
    FailedNamespaceConnect,

    #[error("connect handler rejected the connection: {0}")]
    ConnectRejected(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("cluster adapter error: {0}")]
    Adapter(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("engine error: {0}")]
    Engine(#[from] engineio_server::Error),
}

impl Error {
    pub(crate) fn adapter<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Adapter(Box::new(err))
    }
}
