use serde::Deserialize;

use crate::utils::SettingsError;

/// A rotation threshold as written in the configuration: either a plain
/// byte count or a string such as `"10M"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawSize {
    Bytes(u64),
    Text(String),
}

impl RawSize {
    /// Resolves the size to a byte count.
    ///
    /// Suffixes are decimal and case-insensitive: `K` = 1000, `M` = 1000000,
    /// `G` = 1000000000. A numeric string without a suffix is taken as-is.
    pub fn to_bytes(&self) -> Result<u64, SettingsError> {
        match self {
            RawSize::Bytes(n) => Ok(*n),
            RawSize::Text(text) => parse_size(text),
        }
    }
}

impl From<u64> for RawSize {
    fn from(n: u64) -> Self {
        RawSize::Bytes(n)
    }
}

/// Parses a size string like `"2K"`, `"10M"`, `"1g"` or `"4096"`.
pub fn parse_size(text: &str) -> Result<u64, SettingsError> {
    let invalid = || SettingsError::InvalidSize(text.to_string());
    let trimmed = text.trim();

    let Some(last) = trimmed.chars().last() else {
        return Err(invalid());
    };

    if last.is_ascii_digit() {
        return trimmed.parse::<u64>().map_err(|_| invalid());
    }

    let multiplier: u64 = match last.to_ascii_uppercase() {
        'K' => 1_000,
        'M' => 1_000_000,
        'G' => 1_000_000_000,
        _ => return Err(invalid()),
    };

    let number = trimmed[..trimmed.len() - last.len_utf8()]
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid())?;

    number.checked_mul(multiplier).ok_or_else(invalid)
}
