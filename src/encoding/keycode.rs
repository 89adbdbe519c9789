//! Order-preserving key encodings for the index buckets.
//!
//! Unsigned integers are written as a length byte (0..=8) followed by the
//! significant big-endian bytes. A larger value never has fewer bytes than
//! a smaller one, so concatenated sequences compare bytewise in numeric
//! order.
//!
//! This is not the LEB128 varint layout. LEB128 keys would not sort
//! numerically, and pack seeks position cursors on raw key bytes. Keys
//! written as LEB128 cannot be read by this codec.

use super::Key;
use crate::error::{Error, Result};

/// Column holding the index keys of a pack.
pub const KEY_COLUMN: u64 = 0;
/// Column holding the row ids of a pack.
pub const ROWID_COLUMN: u64 = 1;

const SIGN_BIT: u64 = 1 << 63;

/// Appends the order-preserving varint form of `v` to `buf`.
pub fn put_uvar(buf: &mut Vec<u8>, v: u64) {
    let n = 8 - (v.leading_zeros() / 8) as usize;
    buf.push(n as u8);
    buf.extend_from_slice(&v.to_be_bytes()[8 - n..]);
}

/// Reads one varint from the front of `bytes`, returning the value and the
/// number of bytes consumed.
pub fn read_uvar(bytes: &[u8]) -> Result<(u64, usize)> {
    let Some(&n) = bytes.first() else {
        return Err(Error::Decode("uvar", "empty input".into()));
    };
    let n = n as usize;
    if n > 8 {
        return Err(Error::Decode("uvar", format!("invalid length {n}")));
    }
    if bytes.len() < 1 + n {
        return Err(Error::Decode("uvar", "truncated input".into()));
    }
    let mut buf = [0u8; 8];
    buf[8 - n..].copy_from_slice(&bytes[1..1 + n]);
    let v = u64::from_be_bytes(buf);
    // reject non-canonical encodings with leading zero bytes
    if n > 0 && bytes[1] == 0 {
        return Err(Error::Decode("uvar", "non-canonical encoding".into()));
    }
    Ok((v, 1 + n))
}

fn read_triple(what: &'static str, bytes: &[u8]) -> Result<(u64, u64, u64)> {
    let (a, n1) = read_uvar(bytes)?;
    let (b, n2) = read_uvar(&bytes[n1..])?;
    let (c, n3) = read_uvar(&bytes[n1 + n2..])?;
    if n1 + n2 + n3 != bytes.len() {
        return Err(Error::Decode(what, "trailing bytes".into()));
    }
    Ok((a, b, c))
}

/// Physical key of one pack column: (first index key, first row id, column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackKey {
    pub key: u64,
    pub row_id: u64,
    pub column: u64,
}

impl PackKey {
    pub fn new(key: u64, row_id: u64, column: u64) -> Self {
        Self {
            key,
            row_id,
            column,
        }
    }

    /// Key of the first column of the pack starting at (key, row_id).
    pub fn first(key: u64, row_id: u64) -> Self {
        Self::new(key, row_id, KEY_COLUMN)
    }
}

impl Key for PackKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(27);
        put_uvar(&mut buf, self.key);
        put_uvar(&mut buf, self.row_id);
        put_uvar(&mut buf, self.column);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (key, row_id, column) = read_triple("pack key", bytes)?;
        Ok(Self::new(key, row_id, column))
    }
}

/// Physical key of a persisted tombstone. Sorting by epoch first lets
/// garbage collection stop at the first record that is still needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TombKey {
    pub epoch: u64,
    pub key: u64,
    pub row_id: u64,
}

impl Key for TombKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(27);
        put_uvar(&mut buf, self.epoch);
        put_uvar(&mut buf, self.key);
        put_uvar(&mut buf, self.row_id);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (epoch, key, row_id) = read_triple("tomb key", bytes)?;
        Ok(Self {
            epoch,
            key,
            row_id,
        })
    }
}

/// Encodes the smallest tomb key of an epoch, used to seek GC scans.
pub fn encode_epoch_prefix(epoch: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    put_uvar(&mut buf, epoch);
    buf
}

/// Maps a signed integer onto u64 preserving order.
pub fn order_i64(i: i64) -> u64 {
    // Flip the sign bit so negative numbers sort before positive
    (i as u64) ^ SIGN_BIT
}

pub fn unorder_i64(u: u64) -> i64 {
    (u ^ SIGN_BIT) as i64
}

/// Maps a float onto u64 preserving IEEE 754 total order.
pub fn order_f64(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & SIGN_BIT != 0 {
        // Negative: flip all bits
        !bits
    } else {
        bits | SIGN_BIT
    }
}

pub fn unorder_f64(u: u64) -> f64 {
    let bits = if u & SIGN_BIT != 0 { u & !SIGN_BIT } else { !u };
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(0, &[0x00]; "zero")]
    #[test_case(1, &[0x01, 0x01]; "one")]
    #[test_case(255, &[0x01, 0xff]; "one byte max")]
    #[test_case(256, &[0x02, 0x01, 0x00]; "two bytes")]
    #[test_case(u64::MAX, &[0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]; "max")]
    fn test_uvar_layout(v: u64, expected: &[u8]) {
        let mut buf = Vec::new();
        put_uvar(&mut buf, v);
        assert_eq!(buf, expected);
        assert_eq!(read_uvar(&buf).unwrap(), (v, expected.len()));
    }

    #[test]
    fn test_pack_key_roundtrip() {
        let key = PackKey::new(42, 7, ROWID_COLUMN);
        let decoded = PackKey::decode(&key.encode()).unwrap();
        assert_eq!(key, decoded);
        assert_eq!(PackKey::first(42, 7).column, KEY_COLUMN);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(PackKey::decode(&[]).is_err());
        assert!(PackKey::decode(&[0x09]).is_err());
        assert!(PackKey::decode(&[0x02, 0x01]).is_err());
        assert!(PackKey::decode(&[0x01, 0x00, 0x00, 0x00]).is_err());

        let mut bytes = PackKey::new(1, 2, 0).encode();
        bytes.push(0);
        assert!(PackKey::decode(&bytes).is_err());
    }

    #[test]
    fn test_column_keys_are_adjacent() {
        // both columns of a pack sort before the next pack's first key
        let a0 = PackKey::new(10, 5, KEY_COLUMN).encode();
        let a1 = PackKey::new(10, 5, ROWID_COLUMN).encode();
        let b0 = PackKey::new(10, 6, KEY_COLUMN).encode();
        assert!(a0 < a1);
        assert!(a1 < b0);
    }

    #[test]
    fn test_tomb_key_sorts_by_epoch() {
        let early = TombKey {
            epoch: 1,
            key: u64::MAX,
            row_id: 9,
        };
        let late = TombKey {
            epoch: 2,
            key: 0,
            row_id: 0,
        };
        assert!(early.encode() < late.encode());
        assert!(encode_epoch_prefix(2) <= late.encode());
        assert!(encode_epoch_prefix(2) > early.encode());
        assert_eq!(TombKey::decode(&late.encode()).unwrap(), late);
    }

    #[test]
    fn test_signed_and_float_order() {
        let ints = [i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        for w in ints.windows(2) {
            assert!(order_i64(w[0]) < order_i64(w[1]));
        }
        for i in ints {
            assert_eq!(unorder_i64(order_i64(i)), i);
        }

        let floats = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1.0e-9, 3.25, f64::INFINITY];
        for w in floats.windows(2) {
            assert!(order_f64(w[0]) < order_f64(w[1]));
        }
        for f in floats {
            assert_eq!(unorder_f64(order_f64(f)).to_bits(), f.to_bits());
        }
    }

    proptest! {
        #[test]
        fn prop_pack_key_byte_order_matches_numeric(
            a in any::<(u64, u64)>(),
            b in any::<(u64, u64)>(),
            ca in 0u64..2,
            cb in 0u64..2,
        ) {
            let ka = PackKey::new(a.0, a.1, ca);
            let kb = PackKey::new(b.0, b.1, cb);
            prop_assert_eq!(ka.encode().cmp(&kb.encode()), ka.cmp(&kb));
        }

        #[test]
        fn prop_uvar_roundtrip(v in any::<u64>()) {
            let mut buf = Vec::new();
            put_uvar(&mut buf, v);
            prop_assert_eq!(read_uvar(&buf).unwrap(), (v, buf.len()));
        }
    }
}
