use base64::prelude::BASE64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::EngineIoConfig;
use crate::errors::Error;
use crate::sid::Sid;

/// An Engine.IO v4 packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Initiates a session; carries the session parameters.
    Open(OpenPacket),
    /// Closes the session.
    Close,
    /// Liveness probe. Sent by the server; the client answers with [`Packet::Pong`].
    Ping,
    /// Liveness answer.
    Pong,
    /// The `2probe` ping sent by a client on a fresh transport to start an upgrade.
    PingProbe,
    /// The `3probe` answer to a [`Packet::PingProbe`].
    PongProbe,
    /// An application payload.
    Message(String),
    /// Commits a transport upgrade after a successful probe exchange.
    Upgrade,
    /// Filler packet used to flush a pending polling request.
    Noop,
    /// A binary application payload. Sent as a binary frame over
    /// websocket and as `b` + base64 over polling.
    Binary(Bytes),
}

impl Packet {
    /// Serialize to the string form of the protocol.
    pub fn encode(self) -> Result<String, Error> {
        let encoded = match self {
            Packet::Open(open) => format!("0{}", serde_json::to_string(&open)?),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::PingProbe => "2probe".to_string(),
            Packet::PongProbe => "3probe".to_string(),
            Packet::Message(msg) => format!("4{msg}"),
            Packet::Upgrade => "5".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Binary(data) => format!("b{}", BASE64_STANDARD.encode(data)),
        };
        Ok(encoded)
    }

    /// Parse the string form of the protocol.
    pub fn decode(value: &str) -> Result<Self, Error> {
        let mut chars = value.chars();
        let index = chars.next().ok_or(Error::EmptyPacket)?;
        let rest = chars.as_str();
        let is_probe = rest == "probe";
        let packet = match index {
            '0' => Packet::Open(serde_json::from_str(rest)?),
            '1' => Packet::Close,
            '2' if is_probe => Packet::PingProbe,
            '2' => Packet::Ping,
            '3' if is_probe => Packet::PongProbe,
            '3' => Packet::Pong,
            '4' => Packet::Message(rest.to_string()),
            '5' => Packet::Upgrade,
            '6' => Packet::Noop,
            'b' => Packet::Binary(BASE64_STANDARD.decode(rest)?.into()),
            other => return Err(Error::InvalidPacketType(other)),
        };
        Ok(packet)
    }
}

/// The payload of an [`Packet::Open`] packet: the session id and the
/// liveness/upgrade parameters the client must honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: Sid,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

impl OpenPacket {
    /// Build the open packet for a new session. Sessions starting on
    /// polling are always offered the websocket upgrade.
    pub fn new(sid: Sid, transport: &str, config: &EngineIoConfig) -> Self {
        let upgrades = if transport == "polling" {
            vec!["websocket".to_string()]
        } else {
            vec![]
        };
        OpenPacket {
            sid,
            upgrades,
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            max_payload: config.max_payload,
        }
    }
}
