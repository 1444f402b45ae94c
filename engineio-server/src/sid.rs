use std::fmt;
use std::str::FromStr;

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

/// A session identifier: 16 random bytes, rendered as a 22 character
/// URL-safe base64 string on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid([u8; 16]);

/// Length of the textual form.
const ENCODED_LEN: usize = 22;

impl Sid {
    /// Generate a new random session id.
    pub fn new() -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Sid(raw)
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64_URL_SAFE_NO_PAD.encode(self.0))
    }
}

// Debug mirrors Display so ids read the same in logs and wire dumps.
impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SidParseError {
    #[error("invalid session id length")]
    InvalidLength,
    #[error("invalid base64 session id")]
    InvalidEncoding,
}

impl FromStr for Sid {
    type Err = SidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENCODED_LEN {
            return Err(SidParseError::InvalidLength);
        }
        let decoded = BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| SidParseError::InvalidEncoding)?;
        let raw: [u8; 16] = decoded
            .try_into()
            .map_err(|_| SidParseError::InvalidLength)?;
        Ok(Sid(raw))
    }
}

impl serde::Serialize for Sid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Sid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let id = Sid::new();
        let parsed = Sid::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), ENCODED_LEN);
    }

    #[test]
    fn unique() {
        assert_ne!(Sid::new(), Sid::new());
    }

    #[test]
    fn parse_invalid() {
        assert!(matches!(
            Sid::from_str("too-short"),
            Err(SidParseError::InvalidLength)
        ));
        assert!(matches!(
            Sid::from_str("!!!!!!!!!!!!!!!!!!!!!!"),
            Err(SidParseError::InvalidEncoding)
        ));
    }

    #[test]
    fn serde_roundtrip() {
        let id = Sid::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: Sid = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
