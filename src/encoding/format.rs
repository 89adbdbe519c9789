//! Human-readable rendering of bucket keys for log messages.

use itertools::Itertools as _;

use super::keycode::{PackKey, TombKey};
use super::Key;

/// Formats encoded keys and values.
pub trait Formatter {
    /// Formats a key.
    fn key(key: &[u8]) -> String;

    /// Formats a key/value pair, where the value may not exist.
    fn key_maybe_value(key: &[u8], value: Option<&[u8]>) -> String {
        let fmtkey = Self::key(key);
        let fmtvalue = value.map_or("None".to_string(), |v| format!("{} bytes", v.len()));
        format!("{fmtkey} -> {fmtvalue}")
    }
}

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

impl Formatter for Raw {
    fn key(key: &[u8]) -> String {
        Self::bytes(key)
    }
}

/// Formats data and stats bucket keys, falling back to raw bytes.
pub struct Packs;

impl Formatter for Packs {
    fn key(key: &[u8]) -> String {
        match PackKey::decode(key) {
            Ok(k) => format!("pack({}, {}, col={})", k.key, k.row_id, k.column),
            Err(_) => Raw::key(key),
        }
    }
}

/// Formats tomb bucket keys, falling back to raw bytes.
pub struct Tombs;

impl Formatter for Tombs {
    fn key(key: &[u8]) -> String {
        match TombKey::decode(key) {
            Ok(k) => format!("tomb(epoch={}, {}, {})", k.epoch, k.key, k.row_id),
            Err(_) => Raw::key(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_formatting() {
        let key = PackKey::new(5, 1, 1).encode();
        assert_eq!(Packs::key(&key), "pack(5, 1, col=1)");
        assert_eq!(Packs::key_maybe_value(&key, None), "pack(5, 1, col=1) -> None");
        assert_eq!(Packs::key(b"\xff"), "\"\\xff\"");
    }
}
