use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::utils::SettingsError;

/// Byte-to-text decoding applied to every payload of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
    /// UTF-16 honouring a leading byte order mark, little-endian without one.
    Utf16,
    Utf16Le,
    Utf16Be,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid {encoding} sequence at byte {offset}")]
    Invalid { encoding: Encoding, offset: usize },

    #[error("odd payload length {0} for a UTF-16 encoding")]
    OddLength(usize),
}

impl Encoding {
    /// Decodes `payload`. Malformed input is an error, never replaced.
    pub fn decode(self, payload: &[u8]) -> Result<String, DecodeError> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(payload)
                .map(str::to_owned)
                .map_err(|e| DecodeError::Invalid {
                    encoding: self,
                    offset: e.valid_up_to(),
                }),
            Encoding::Ascii => match payload.iter().position(|b| !b.is_ascii()) {
                Some(offset) => Err(DecodeError::Invalid {
                    encoding: self,
                    offset,
                }),
                None => Ok(payload.iter().map(|&b| b as char).collect()),
            },
            Encoding::Latin1 => Ok(payload.iter().map(|&b| b as char).collect()),
            Encoding::Utf16 => match payload {
                [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes, self, 2),
                [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes, self, 2),
                _ => decode_utf16(payload, u16::from_le_bytes, self, 0),
            },
            Encoding::Utf16Le => decode_utf16(payload, u16::from_le_bytes, self, 0),
            Encoding::Utf16Be => decode_utf16(payload, u16::from_be_bytes, self, 0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin-1",
            Encoding::Utf16 => "utf-16",
            Encoding::Utf16Le => "utf-16-le",
            Encoding::Utf16Be => "utf-16-be",
        }
    }
}

fn decode_utf16(
    bytes: &[u8],
    unit: fn([u8; 2]) -> u16,
    encoding: Encoding,
    base: usize,
) -> Result<String, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len() + base));
    }

    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    let mut text = String::with_capacity(bytes.len() / 2);
    let mut offset = base;
    for decoded in char::decode_utf16(units) {
        match decoded {
            Ok(c) => {
                text.push(c);
                offset += c.len_utf16() * 2;
            }
            Err(_) => return Err(DecodeError::Invalid { encoding, offset }),
        }
    }
    Ok(text)
}

impl FromStr for Encoding {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            "utf-16" | "utf16" => Ok(Encoding::Utf16),
            "utf-16-le" | "utf-16le" | "utf16le" => Ok(Encoding::Utf16Le),
            "utf-16-be" | "utf-16be" | "utf16be" => Ok(Encoding::Utf16Be),
            _ => Err(SettingsError::UnknownEncoding(s.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
