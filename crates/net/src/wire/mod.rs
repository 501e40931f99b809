//! The line-framed textual protocol shared by every socket in the fabric:
//! sensor ↔ server and server ↔ server alike.
//!
//! A frame is `"<code> <payload>\n"`. The space after the code is always
//! written, even for an empty payload, so a reader can tell "code with empty
//! payload" apart from a truncated frame.
mod stream;

pub use stream::LineDecoder;

use thiserror::Error;

/// Maximum frame size, payload included, per the wire contract.
pub const MAX_MESSAGE_LEN: usize = 500;

/// Numeric message codes. Names match the protocol table; values are the
/// wire-level constants, not Rust discriminants, since peers on both sides
/// of the fabric must agree on the literal integers.
pub mod code {
    pub const REQ_CONNPEER: u16 = 20;
    pub const RES_CONNPEER: u16 = 21;
    pub const REQ_DISCPEER: u16 = 22;
    pub const REQ_CONNSEN: u16 = 23;
    pub const RES_CONNSEN: u16 = 24;
    pub const REQ_DISCSEN: u16 = 25;
    pub const REQ_CHECKALERT: u16 = 36;
    pub const RES_CHECKALERT: u16 = 37;
    pub const REQ_SENSLOC: u16 = 38;
    pub const RES_SENSLOC: u16 = 39;
    pub const REQ_SENSSTATUS: u16 = 40;
    pub const RES_SENSSTATUS: u16 = 41;
    pub const REQ_LOCLIST: u16 = 42;
    pub const RES_LOCLIST: u16 = 43;
    pub const OK: u16 = 0;
    pub const ERROR: u16 = 255;
}

/// `OK` payloads.
pub mod ok {
    pub const DISCONNECT: &str = "01";
    pub const CREATE: &str = "02";
    pub const UPDATE: &str = "03";
}

/// `ERROR` payloads.
pub mod err {
    pub const PEER_LIMIT_EXCEEDED: &str = "01";
    pub const PEER_NOT_FOUND: &str = "02";
    pub const INVALID_PAYLOAD: &str = "03";
    pub const SENSOR_ID_ALREADY_EXISTS: &str = "04";
    pub const INVALID_CODE: &str = "05";
    pub const SENSOR_LIMIT_EXCEEDED: &str = "09";
    pub const SENSOR_NOT_FOUND: &str = "10";
}

/// A single protocol message: a numeric code plus an opaque payload string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub payload: String,
}

impl Message {
    pub fn new(code: u16, payload: impl Into<String>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// A message whose payload is empty, e.g. `REQ_CONNPEER`.
    pub fn code_only(code: u16) -> Self {
        Self::new(code, "")
    }

    pub fn ok(payload: &str) -> Self {
        Self::new(code::OK, payload)
    }

    pub fn error(payload: &str) -> Self {
        Self::new(code::ERROR, payload)
    }

    /// Serialize to the wire form, including the trailing newline.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = format!("{} {}", self.code, self.payload);
        line.push('\n');
        line.into_bytes()
    }

    /// Parse a single line (no trailing newline) into a message.
    ///
    /// Splits on the first whitespace character: everything before is the
    /// code, everything after is the payload, verbatim to end of line. A
    /// line with no whitespace is a code-only message with an empty payload.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        if line.len() > MAX_MESSAGE_LEN {
            return Err(WireError::TooLong(line.len()));
        }

        let (code_str, payload) = match line.find(char::is_whitespace) {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (line, ""),
        };

        let code = code_str
            .parse::<u16>()
            .map_err(|_| WireError::InvalidCode(code_str.to_string()))?;

        Ok(Self {
            code,
            payload: payload.to_string(),
        })
    }
}

/// Failure to frame or parse a wire message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message exceeds {MAX_MESSAGE_LEN} bytes: {0}")]
    TooLong(usize),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("could not parse message code from `{0}`")]
    InvalidCode(String),
}
