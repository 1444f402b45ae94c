use crate::transport::TransportError;

/// Error type for the engine layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error serializing json packet: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("error decoding base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid packet type `{0}`")]
    InvalidPacketType(char),

    #[error("empty packet")]
    EmptyPacket,

    /// The session is closed; reads report this after a `CLOSE` packet or
    /// a fatal transport failure.
    #[error("session closed")]
    Closed,

    #[error("engine closed")]
    EngineClosed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
