//! # EUI-64 / MAC Hex Helpers
//!
//! Devices are identified by a 64-bit EUI and gateways by a 64-bit MAC.
//! Internally both are `u64`; on the wire and in persisted JSON they are
//! 16-character hex strings.

use crate::error::SimulatorError;

/// Formats a 64-bit identifier as a lowercase 16-character hex string.
pub fn format_eui(eui: u64) -> String {
    hex::encode(eui.to_be_bytes())
}

/// Parses a 16-character hex string (case-insensitive, optional `-`/`:`
/// separators) into a 64-bit identifier.
pub fn parse_eui(text: &str) -> Result<u64, SimulatorError> {
    let cleaned: String = text.chars().filter(|c| *c != '-' && *c != ':').collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| SimulatorError::Validation(format!("invalid EUI {text:?}: {e}")))?;
    if bytes.len() != 8 {
        return Err(SimulatorError::Validation(format!(
            "invalid EUI {text:?}: expected 8 bytes, got {}",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(buf))
}

/// Serde adapter storing a `u64` identifier as a hex string.
pub mod hex_u64 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_eui(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_eui(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let eui = 0x0011_2233_4455_6677;
        assert_eq!(format_eui(eui), "0011223344556677");
        assert_eq!(parse_eui("0011223344556677").unwrap(), eui);
        assert_eq!(parse_eui("00-11-22-33-44-55-66-77").unwrap(), eui);
        assert_eq!(parse_eui("00:11:22:33:44:55:66:77").unwrap(), eui);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_eui("0011").is_err());
        assert!(parse_eui("not hex").is_err());
    }
}
