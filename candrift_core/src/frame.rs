use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum payload length of a classic CAN data frame.
pub const MAX_PAYLOAD_LEN: usize = 8;
/// Highest arbitration ID representable with an 11-bit identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Highest arbitration ID representable with a 29-bit identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Errors raised while constructing or parsing a [`Frame`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The arbitration ID does not fit the requested addressing width.
    #[error("Arbitration ID 0x{id:X} exceeds the {width} addressing range")]
    IdOutOfRange { id: u32, width: IdWidth },

    /// More than [`MAX_PAYLOAD_LEN`] payload bytes were supplied.
    #[error("Payload of {0} bytes exceeds the 8 byte CAN limit")]
    PayloadTooLong(usize),

    /// A cansend directive could not be parsed.
    #[error("Invalid frame directive '{input}': {reason}")]
    Parse { input: String, reason: String },
}

impl FrameError {
    fn parse(input: &str, reason: impl Into<String>) -> Self {
        FrameError::Parse {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Addressing width of an arbitration ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdWidth {
    /// 11-bit identifier (CAN 2.0A).
    #[default]
    Standard,
    /// 29-bit identifier (CAN 2.0B).
    Extended,
}

impl IdWidth {
    pub fn max_id(self) -> u32 {
        match self {
            IdWidth::Standard => STANDARD_ID_MAX,
            IdWidth::Extended => EXTENDED_ID_MAX,
        }
    }

    /// The narrowest width able to carry `id`.
    pub fn for_id(id: u32) -> Self {
        if id <= STANDARD_ID_MAX {
            IdWidth::Standard
        } else {
            IdWidth::Extended
        }
    }
}

impl fmt::Display for IdWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdWidth::Standard => write!(f, "11-bit"),
            IdWidth::Extended => write!(f, "29-bit"),
        }
    }
}

/// A classic CAN data frame.
///
/// Frames are validated on construction and immutable afterwards: the
/// arbitration ID always fits its [`IdWidth`] and the payload never holds
/// more than eight bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    arbitration_id: u32,
    width: IdWidth,
    payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame, picking the narrowest addressing width that fits `id`.
    pub fn new(id: u32, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        Self::with_width(id, IdWidth::for_id(id), payload)
    }

    /// Builds a frame with an explicit addressing width.
    pub fn with_width(
        id: u32,
        width: IdWidth,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, FrameError> {
        if id > width.max_id() {
            return Err(FrameError::IdOutOfRange { id, width });
        }
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            arbitration_id: id,
            width,
            payload,
        })
    }

    pub fn id(&self) -> u32 {
        self.arbitration_id
    }

    pub fn width(&self) -> IdWidth {
        self.width
    }

    pub fn is_extended(&self) -> bool {
        self.width == IdWidth::Extended
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Data length code, i.e. the number of payload bytes.
    pub fn dlc(&self) -> usize {
        self.payload.len()
    }

    /// Arbitration ID rendered as `0x7DF` (or `0x18DAF110` when extended).
    pub fn id_hex(&self) -> String {
        match self.width {
            IdWidth::Standard => format!("0x{:03X}", self.arbitration_id),
            IdWidth::Extended => format!("0x{:08X}", self.arbitration_id),
        }
    }

    /// Payload rendered as space separated hex bytes, e.g. `02 01 00`.
    pub fn payload_hex(&self) -> String {
        self.payload
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parses a cansend directive such as `0x7DF#02 01 00`, `7DF#020100`
    /// or `0x123#0xFF 0xFF`.
    pub fn parse_directive(input: &str) -> Result<Self, FrameError> {
        let line = input.trim();
        let (id_part, payload_part) = line
            .split_once('#')
            .ok_or_else(|| FrameError::parse(line, "missing '#' separator"))?;

        let id_digits = strip_hex_prefix(id_part.trim());
        if id_digits.is_empty() {
            return Err(FrameError::parse(line, "empty arbitration ID"));
        }
        let id = u32::from_str_radix(id_digits, 16)
            .map_err(|e| FrameError::parse(line, format!("bad arbitration ID: {e}")))?;
        let width = if id_digits.len() > 3 || id > STANDARD_ID_MAX {
            IdWidth::Extended
        } else {
            IdWidth::Standard
        };

        let payload = parse_payload(payload_part.trim()).map_err(|r| FrameError::parse(line, r))?;
        Self::with_width(id, width, payload)
    }
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_payload(text: &str) -> Result<Vec<u8>, String> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let tokens: Vec<&str> = text.split_whitespace().collect();
    let tokenized = tokens.len() > 1 || text.starts_with("0x") || text.starts_with("0X");
    if tokenized {
        return tokens
            .iter()
            .map(|tok| {
                u8::from_str_radix(strip_hex_prefix(tok), 16)
                    .map_err(|e| format!("bad payload byte '{tok}': {e}"))
            })
            .collect();
    }

    let digits: Vec<char> = text.chars().filter(|c| *c != '.').collect();
    if digits.len() % 2 != 0 {
        return Err("payload has an odd number of hex digits".to_string());
    }
    digits
        .chunks(2)
        .map(|pair| {
            let s: String = pair.iter().collect();
            u8::from_str_radix(&s, 16).map_err(|e| format!("bad payload byte '{s}': {e}"))
        })
        .collect()
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id_hex(), self.payload_hex())
    }
}

impl FromStr for Frame {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Frame::parse_directive(s)
    }
}

impl Serialize for Frame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Frame::parse_directive(&text).map_err(serde::de::Error::custom)
    }
}
