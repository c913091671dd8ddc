use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Encoding of binary column values in JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryEncodingMode {
    /// A string of hexadecimal digits (the default).
    Hex,
    /// A base64-encoded string.
    B64,
    /// A JSON array of byte values 0..=255.
    Array,
}

impl BinaryEncodingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryEncodingMode::Hex => "hex",
            BinaryEncodingMode::B64 => "b64",
            BinaryEncodingMode::Array => "array",
        }
    }
}

impl Default for BinaryEncodingMode {
    fn default() -> Self {
        BinaryEncodingMode::Hex
    }
}

impl fmt::Display for BinaryEncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BinaryEncodingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "hex" => Ok(BinaryEncodingMode::Hex),
            "b64" => Ok(BinaryEncodingMode::B64),
            "array" => Ok(BinaryEncodingMode::Array),
            _ => Err(Error::InvalidArgument(format!(
                "invalid binary encoding '{s}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip_is_the_identity() {
        for mode in [
            BinaryEncodingMode::Hex,
            BinaryEncodingMode::B64,
            BinaryEncodingMode::Array,
        ] {
            assert_eq!(mode.to_string().parse::<BinaryEncodingMode>().unwrap(), mode);
        }
        assert!("HEX".parse::<BinaryEncodingMode>().is_err());
        assert!("base64".parse::<BinaryEncodingMode>().is_err());
    }
}
