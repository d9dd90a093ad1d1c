use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode call: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
}

/// Result of decoding a byte buffer: the complete calls it held, how many
/// bytes were used, and the frames that could not be parsed. Bytes past
/// `consumed` belong to an incomplete frame and must be kept for later.
#[derive(Debug)]
pub struct Decoded<T> {
    pub calls: Vec<T>,
    pub consumed: usize,
    pub errors: Vec<CodecError>,
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            consumed: 0,
            errors: Vec::new(),
        }
    }
}

pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, call: &T) -> Result<Vec<u8>, CodecError>;
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Decoded<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl Codec for JsonLinesCodec {
    fn encode<T: Serialize>(&self, call: &T) -> Result<Vec<u8>, CodecError> {
        let mut bytes = serde_json::to_vec(call).map_err(CodecError::Encode)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Decoded<T> {
        let mut decoded = Decoded::default();
        while let Some(offset) = buf[decoded.consumed..].iter().position(|&b| b == b'\n') {
            let line = &buf[decoded.consumed..decoded.consumed + offset];
            decoded.consumed += offset + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(call) => decoded.calls.push(call),
                Err(err) => decoded.errors.push(CodecError::Malformed(err)),
            }
        }
        decoded
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixedCodec {
    max_frame: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl Codec for LengthPrefixedCodec {
    fn encode<T: Serialize>(&self, call: &T) -> Result<Vec<u8>, CodecError> {
        let body = serde_json::to_vec(call).map_err(CodecError::Encode)?;
        if body.len() > self.max_frame {
            return Err(CodecError::Oversized {
                len: body.len(),
                max: self.max_frame,
            });
        }
        let mut bytes = Vec::with_capacity(body.len() + 4);
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Decoded<T> {
        let mut decoded = Decoded::default();
        loop {
            let rest = &buf[decoded.consumed..];
            if rest.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > self.max_frame {
                // no way to resynchronise after a bogus length
                decoded.consumed = buf.len();
                decoded.errors.push(CodecError::Oversized {
                    len,
                    max: self.max_frame,
                });
                break;
            }
            if rest.len() < 4 + len {
                break;
            }
            match serde_json::from_slice(&rest[4..4 + len]) {
                Ok(call) => decoded.calls.push(call),
                Err(err) => decoded.errors.push(CodecError::Malformed(err)),
            }
            decoded.consumed += 4 + len;
        }
        decoded
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    #[default]
    JsonLines,
    LengthPrefixed,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::JsonLines => "json-lines",
            WireFormat::LengthPrefixed => "length-prefixed",
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "json-lines" => Ok(WireFormat::JsonLines),
            "length-prefixed" => Ok(WireFormat::LengthPrefixed),
            other => Err(format!(
                "unknown wire format '{other}' (expected json-lines or length-prefixed)"
            )),
        }
    }
}

impl Codec for WireFormat {
    fn encode<T: Serialize>(&self, call: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            WireFormat::JsonLines => JsonLinesCodec.encode(call),
            WireFormat::LengthPrefixed => LengthPrefixedCodec::default().encode(call),
        }
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Decoded<T> {
        match self {
            WireFormat::JsonLines => JsonLinesCodec.decode(buf),
            WireFormat::LengthPrefixed => LengthPrefixedCodec::default().decode(buf),
        }
    }
}
