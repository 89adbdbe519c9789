//! Byte encodings of bucket keys and values.

pub mod bincode;
pub mod format;
pub mod keycode;

use crate::error::Result;

/// A bucket key whose encoding sorts bytewise like its decoded form.
///
/// Merges and readers position cursors by encoded key, so the data, stats
/// and tomb buckets all rely on this order.
pub trait Key {
    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// A bucket value. No ordering is required.
pub trait Value {
    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;
}
