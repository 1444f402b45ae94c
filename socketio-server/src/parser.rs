//! Socket.IO packet grammar, carried inside engine `MESSAGE` frames:
//!
//! ```text
//! <type>[<# of binary attachments>-][/<namespace>,][<packet id>][JSON payload]
//! ```
//!
//! Binary attachments ride as separate engine binary frames and are not
//! materialized here; binary-typed packets decode and dispatch on their
//! JSON part.

use serde_json::Value;

/// The canonical root namespace.
pub const ROOT_NAMESPACE: &str = "/";
/// The empty string aliases the root namespace on the wire.
pub const ALIAS_ROOT_NAMESPACE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
    BinaryEvent,
    BinaryAck,
}

impl PacketType {
    fn index(self) -> char {
        match self {
            PacketType::Connect => '0',
            PacketType::Disconnect => '1',
            PacketType::Event => '2',
            PacketType::Ack => '3',
            PacketType::Error => '4',
            PacketType::BinaryEvent => '5',
            PacketType::BinaryAck => '6',
        }
    }

    fn from_index(index: u8) -> Option<Self> {
        match index {
            b'0' => Some(PacketType::Connect),
            b'1' => Some(PacketType::Disconnect),
            b'2' => Some(PacketType::Event),
            b'3' => Some(PacketType::Ack),
            b'4' => Some(PacketType::Error),
            b'5' => Some(PacketType::BinaryEvent),
            b'6' => Some(PacketType::BinaryAck),
            _ => None,
        }
    }

    pub fn is_event(self) -> bool {
        matches!(self, PacketType::Event | PacketType::BinaryEvent)
    }

    pub fn is_ack(self) -> bool {
        matches!(self, PacketType::Ack | PacketType::BinaryAck)
    }

    fn has_attachments(self) -> bool {
        matches!(self, PacketType::BinaryEvent | PacketType::BinaryAck)
    }
}

/// Logical header of a socket.io packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub typ: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    /// Set on outbound events that expect an `ACK` back, and on inbound
    /// events that carried a packet id.
    pub need_ack: bool,
}

impl Header {
    pub fn new(typ: PacketType, nsp: impl Into<String>) -> Self {
        Self {
            typ,
            nsp: nsp.into(),
            id: None,
            need_ack: false,
        }
    }
}

/// Decoded body of an inbound packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Auth payload; `Null` when the client sent none.
    Connect(Value),
    Disconnect {
        reason: String,
        details: Option<Value>,
    },
    Event {
        name: String,
        args: Vec<Value>,
    },
    Ack(Vec<Value>),
    /// An inbound protocol error object. Servers never expect these.
    Error(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub body: Body,
}

/// Outbound payload attached to a header: either a bare data value
/// (CONNECT acknowledgement, ERROR object) or an argument list
/// (EVENT/ACK arrays).
#[derive(Debug, Clone)]
pub enum PayloadData {
    Args(Vec<Value>),
    Data(Value),
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty packet")]
    Empty,
    #[error("invalid packet type `{0}`")]
    InvalidType(char),
    #[error("invalid packet id")]
    InvalidId,
    #[error("invalid attachment count")]
    InvalidAttachments,
    #[error("missing event name")]
    MissingEventName,
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode one packet from the payload of an engine `MESSAGE` frame.
pub fn decode(raw: &str) -> Result<Packet, ParseError> {
    let bytes = raw.as_bytes();
    let first = *bytes.first().ok_or(ParseError::Empty)?;
    let typ = PacketType::from_index(first).ok_or(ParseError::InvalidType(first as char))?;
    let mut i = 1;

    // attachment count, present only on binary packets
    if typ.has_attachments() {
        let start = i;
        while bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
            i += 1;
        }
        if i == start || bytes.get(i) != Some(&b'-') {
            return Err(ParseError::InvalidAttachments);
        }
        i += 1;
    }

    let nsp = if bytes.get(i) == Some(&b'/') {
        let start = i;
        while i < bytes.len() && bytes[i] != b',' {
            i += 1;
        }
        let nsp = raw[start..i].to_string();
        if i < bytes.len() {
            i += 1; // trailing comma
        }
        nsp
    } else {
        ROOT_NAMESPACE.to_string()
    };

    let id_start = i;
    while bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
        i += 1;
    }
    let id = if i > id_start {
        Some(raw[id_start..i].parse().map_err(|_| ParseError::InvalidId)?)
    } else {
        None
    };

    let payload = &raw[i..];
    let body = decode_body(typ, payload)?;
    let need_ack = id.is_some() && typ.is_event();
    Ok(Packet {
        header: Header {
            typ,
            nsp,
            id,
            need_ack,
        },
        body,
    })
}

fn decode_body(typ: PacketType, payload: &str) -> Result<Body, ParseError> {
    let body = match typ {
        PacketType::Connect => Body::Connect(parse_optional(payload)?),
        PacketType::Disconnect => {
            let (reason, details) = match parse_optional(payload)? {
                Value::Array(mut items) => {
                    let details = if items.len() > 1 { items.pop() } else { None };
                    let reason = items
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    (reason, details)
                }
                Value::String(reason) => (reason, None),
                _ => (String::new(), None),
            };
            Body::Disconnect { reason, details }
        }
        PacketType::Event | PacketType::BinaryEvent => {
            let Value::Array(mut items) = parse_optional(payload)? else {
                return Err(ParseError::MissingEventName);
            };
            if items.is_empty() || !items[0].is_string() {
                return Err(ParseError::MissingEventName);
            }
            let name = items.remove(0);
            Body::Event {
                name: name.as_str().unwrap_or_default().to_string(),
                args: items,
            }
        }
        PacketType::Ack | PacketType::BinaryAck => match parse_optional(payload)? {
            Value::Array(items) => Body::Ack(items),
            Value::Null => Body::Ack(vec![]),
            other => Body::Ack(vec![other]),
        },
        PacketType::Error => Body::Error(parse_optional(payload)?),
    };
    Ok(body)
}

fn parse_optional(payload: &str) -> Result<Value, serde_json::Error> {
    if payload.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_str(payload)
    }
}

/// Encode one outbound packet into the payload of an engine `MESSAGE`
/// frame.
pub fn encode(header: &Header, data: &PayloadData) -> Result<String, serde_json::Error> {
    let mut out = String::with_capacity(16);
    out.push(header.typ.index());
    if header.nsp != ROOT_NAMESPACE && !header.nsp.is_empty() {
        if !header.nsp.starts_with('/') {
            out.push('/');
        }
        out.push_str(&header.nsp);
        out.push(',');
    }
    if let Some(id) = header.id {
        out.push_str(&id.to_string());
    }
    match data {
        PayloadData::Args(args) => out.push_str(&serde_json::to_string(args)?),
        PayloadData::Data(value) => out.push_str(&serde_json::to_string(value)?),
        PayloadData::None => {}
    }
    Ok(out)
}
