//! Typed column blocks and their storage encoding.
//!
//! A stored block is one header byte naming the type followed by the raw
//! little-endian values. Bytes values carry a u32 length prefix.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    U64 = 1,
    I64 = 2,
    U32 = 3,
    I32 = 4,
    U16 = 5,
    I16 = 6,
    U8 = 7,
    I8 = 8,
    F64 = 9,
    F32 = 10,
    Bool = 11,
    Bytes = 12,
}

impl TryFrom<u8> for BlockType {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        Ok(match b {
            1 => BlockType::U64,
            2 => BlockType::I64,
            3 => BlockType::U32,
            4 => BlockType::I32,
            5 => BlockType::U16,
            6 => BlockType::I16,
            7 => BlockType::U8,
            8 => BlockType::I8,
            9 => BlockType::F64,
            10 => BlockType::F32,
            11 => BlockType::Bool,
            12 => BlockType::Bytes,
            _ => return Err(Error::Decode("block header", format!("unknown type {b}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    U64(Vec<u64>),
    I64(Vec<i64>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    F64(Vec<f64>),
    F32(Vec<f32>),
    Bool(Vec<bool>),
    Bytes(Vec<Vec<u8>>),
}

macro_rules! each_block {
    ($block:expr, $v:ident => $body:expr) => {
        match $block {
            Block::U64($v) => $body,
            Block::I64($v) => $body,
            Block::U32($v) => $body,
            Block::I32($v) => $body,
            Block::U16($v) => $body,
            Block::I16($v) => $body,
            Block::U8($v) => $body,
            Block::I8($v) => $body,
            Block::F64($v) => $body,
            Block::F32($v) => $body,
            Block::Bool($v) => $body,
            Block::Bytes($v) => $body,
        }
    };
}

macro_rules! map_block {
    ($block:expr, $v:ident => $body:expr) => {
        match $block {
            Block::U64($v) => Block::U64($body),
            Block::I64($v) => Block::I64($body),
            Block::U32($v) => Block::U32($body),
            Block::I32($v) => Block::I32($body),
            Block::U16($v) => Block::U16($body),
            Block::I16($v) => Block::I16($body),
            Block::U8($v) => Block::U8($body),
            Block::I8($v) => Block::I8($body),
            Block::F64($v) => Block::F64($body),
            Block::F32($v) => Block::F32($body),
            Block::Bool($v) => Block::Bool($body),
            Block::Bytes($v) => Block::Bytes($body),
        }
    };
}

impl Block {
    pub fn new(typ: BlockType, capacity: usize) -> Self {
        match typ {
            BlockType::U64 => Block::U64(Vec::with_capacity(capacity)),
            BlockType::I64 => Block::I64(Vec::with_capacity(capacity)),
            BlockType::U32 => Block::U32(Vec::with_capacity(capacity)),
            BlockType::I32 => Block::I32(Vec::with_capacity(capacity)),
            BlockType::U16 => Block::U16(Vec::with_capacity(capacity)),
            BlockType::I16 => Block::I16(Vec::with_capacity(capacity)),
            BlockType::U8 => Block::U8(Vec::with_capacity(capacity)),
            BlockType::I8 => Block::I8(Vec::with_capacity(capacity)),
            BlockType::F64 => Block::F64(Vec::with_capacity(capacity)),
            BlockType::F32 => Block::F32(Vec::with_capacity(capacity)),
            BlockType::Bool => Block::Bool(Vec::with_capacity(capacity)),
            BlockType::Bytes => Block::Bytes(Vec::with_capacity(capacity)),
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Block::U64(_) => BlockType::U64,
            Block::I64(_) => BlockType::I64,
            Block::U32(_) => BlockType::U32,
            Block::I32(_) => BlockType::I32,
            Block::U16(_) => BlockType::U16,
            Block::I16(_) => BlockType::I16,
            Block::U8(_) => BlockType::U8,
            Block::I8(_) => BlockType::I8,
            Block::F64(_) => BlockType::F64,
            Block::F32(_) => BlockType::F32,
            Block::Bool(_) => BlockType::Bool,
            Block::Bytes(_) => BlockType::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        each_block!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        each_block!(self, v => v.clear())
    }

    /// Splits the block at `at`, returning the values `[at, len)`.
    pub fn split_off(&mut self, at: usize) -> Block {
        map_block!(self, v => v.split_off(at))
    }

    /// Removes `n` values starting at `start`.
    pub fn delete_range(&mut self, start: usize, n: usize) {
        each_block!(self, v => {
            let end = (start + n).min(v.len());
            v.drain(start.min(end)..end);
        })
    }

    /// Appends values `[start, end)` of `other`, which must have the same type.
    pub fn append_range(&mut self, other: &Block, start: usize, end: usize) -> Result<()> {
        match (self, other) {
            (Block::U64(a), Block::U64(b)) => a.extend_from_slice(&b[start..end]),
            (Block::I64(a), Block::I64(b)) => a.extend_from_slice(&b[start..end]),
            (Block::U32(a), Block::U32(b)) => a.extend_from_slice(&b[start..end]),
            (Block::I32(a), Block::I32(b)) => a.extend_from_slice(&b[start..end]),
            (Block::U16(a), Block::U16(b)) => a.extend_from_slice(&b[start..end]),
            (Block::I16(a), Block::I16(b)) => a.extend_from_slice(&b[start..end]),
            (Block::U8(a), Block::U8(b)) => a.extend_from_slice(&b[start..end]),
            (Block::I8(a), Block::I8(b)) => a.extend_from_slice(&b[start..end]),
            (Block::F64(a), Block::F64(b)) => a.extend_from_slice(&b[start..end]),
            (Block::F32(a), Block::F32(b)) => a.extend_from_slice(&b[start..end]),
            (Block::Bool(a), Block::Bool(b)) => a.extend_from_slice(&b[start..end]),
            (Block::Bytes(a), Block::Bytes(b)) => a.extend_from_slice(&b[start..end]),
            (a, b) => {
                return Err(Error::Contract(format!(
                    "cannot append {:?} block to {:?} block",
                    b.block_type(),
                    a.block_type()
                )))
            }
        }
        Ok(())
    }

    pub fn as_u64s(&self) -> Option<&[u64]> {
        match self {
            Block::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64s_mut(&mut self) -> Option<&mut Vec<u64>> {
        match self {
            Block::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Approximate in-memory size in bytes.
    pub fn heap_size(&self) -> usize {
        match self {
            Block::Bytes(v) => v.iter().map(|b| b.len() + 4).sum(),
            Block::Bool(v) => v.len(),
            other => other.len() * other.value_width(),
        }
    }

    fn value_width(&self) -> usize {
        match self {
            Block::U64(_) | Block::I64(_) | Block::F64(_) => 8,
            Block::U32(_) | Block::I32(_) | Block::F32(_) => 4,
            Block::U16(_) | Block::I16(_) => 2,
            Block::U8(_) | Block::I8(_) | Block::Bool(_) => 1,
            Block::Bytes(_) => 0,
        }
    }

    /// Appends the little-endian wire encoding of the value at `row`.
    pub fn write_wire(&self, row: usize, buf: &mut Vec<u8>) -> Result<()> {
        if row >= self.len() {
            return Err(Error::Contract(format!(
                "row {row} out of range for block of {} values",
                self.len()
            )));
        }
        match self {
            Block::U64(v) => buf.write_u64::<LittleEndian>(v[row])?,
            Block::I64(v) => buf.write_i64::<LittleEndian>(v[row])?,
            Block::U32(v) => buf.write_u32::<LittleEndian>(v[row])?,
            Block::I32(v) => buf.write_i32::<LittleEndian>(v[row])?,
            Block::U16(v) => buf.write_u16::<LittleEndian>(v[row])?,
            Block::I16(v) => buf.write_i16::<LittleEndian>(v[row])?,
            Block::U8(v) => buf.push(v[row]),
            Block::I8(v) => buf.write_i8(v[row])?,
            Block::F64(v) => buf.write_f64::<LittleEndian>(v[row])?,
            Block::F32(v) => buf.write_f32::<LittleEndian>(v[row])?,
            Block::Bool(v) => buf.push(v[row] as u8),
            Block::Bytes(v) => {
                buf.write_u32::<LittleEndian>(v[row].len() as u32)?;
                buf.extend_from_slice(&v[row]);
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + self.heap_size());
        buf.push(self.block_type() as u8);
        for row in 0..self.len() {
            self.write_wire(row, &mut buf)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Block> {
        let Some((&header, body)) = bytes.split_first() else {
            return Err(Error::Decode("block", "empty input".into()));
        };
        let typ = BlockType::try_from(header)?;
        let mut block = Block::new(typ, 0);
        let width = block.value_width();
        if width > 0 && body.len() % width != 0 {
            return Err(Error::Decode(
                "block",
                format!("{} bytes is not a multiple of {width}", body.len()),
            ));
        }
        let n = if width > 0 { body.len() / width } else { 0 };
        let mut r = Cursor::new(body);
        match &mut block {
            Block::U64(v) => {
                v.resize(n, 0);
                r.read_u64_into::<LittleEndian>(v)?;
            }
            Block::I64(v) => {
                v.resize(n, 0);
                r.read_i64_into::<LittleEndian>(v)?;
            }
            Block::U32(v) => {
                v.resize(n, 0);
                r.read_u32_into::<LittleEndian>(v)?;
            }
            Block::I32(v) => {
                v.resize(n, 0);
                r.read_i32_into::<LittleEndian>(v)?;
            }
            Block::U16(v) => {
                v.resize(n, 0);
                r.read_u16_into::<LittleEndian>(v)?;
            }
            Block::I16(v) => {
                v.resize(n, 0);
                r.read_i16_into::<LittleEndian>(v)?;
            }
            Block::U8(v) => v.extend_from_slice(body),
            Block::I8(v) => v.extend(body.iter().map(|b| *b as i8)),
            Block::F64(v) => {
                v.resize(n, 0.0);
                r.read_f64_into::<LittleEndian>(v)?;
            }
            Block::F32(v) => {
                v.resize(n, 0.0);
                r.read_f32_into::<LittleEndian>(v)?;
            }
            Block::Bool(v) => {
                for &b in body {
                    match b {
                        0 => v.push(false),
                        1 => v.push(true),
                        _ => return Err(Error::Decode("block", format!("invalid bool {b}"))),
                    }
                }
            }
            Block::Bytes(v) => {
                while (r.position() as usize) < body.len() {
                    let len = r.read_u32::<LittleEndian>()? as usize;
                    let remaining = body.len() - r.position() as usize;
                    if len > remaining {
                        return Err(Error::Decode("block", "truncated bytes value".into()));
                    }
                    let mut value = vec![0u8; len];
                    r.read_exact(&mut value)?;
                    v.push(value);
                }
            }
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Block::U64(vec![0, 1, u64::MAX]); "u64")]
    #[test_case(Block::I64(vec![-5, 0, 7]); "i64")]
    #[test_case(Block::U32(vec![3, 4]); "u32")]
    #[test_case(Block::I16(vec![-1, 1]); "i16")]
    #[test_case(Block::I8(vec![-128, 127]); "i8")]
    #[test_case(Block::F64(vec![-1.5, 2.25]); "f64")]
    #[test_case(Block::F32(vec![0.5]); "f32")]
    #[test_case(Block::Bool(vec![true, false, true]); "bool")]
    #[test_case(Block::Bytes(vec![b"ab".to_vec(), Vec::new(), b"xyz".to_vec()]); "bytes")]
    #[test_case(Block::U64(Vec::new()); "empty")]
    fn test_encode_decode(block: Block) {
        let encoded = block.encode().unwrap();
        assert_eq!(encoded[0], block.block_type() as u8);
        assert_eq!(Block::decode(&encoded).unwrap(), block);
    }

    #[test]
    fn test_single_header_byte() {
        let block = Block::U64(vec![1, 2]);
        let encoded = block.encode().unwrap();
        assert_eq!(encoded.len(), 1 + 16);
        assert_eq!(&encoded[1..9], &1u64.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Block::decode(&[]).is_err());
        assert!(Block::decode(&[99]).is_err());
        assert!(Block::decode(&[BlockType::U64 as u8, 1, 2, 3]).is_err());
        assert!(Block::decode(&[BlockType::Bool as u8, 2]).is_err());
        assert!(Block::decode(&[BlockType::Bytes as u8, 9, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_split_and_delete() {
        let mut block = Block::U64(vec![1, 2, 3, 4, 5]);
        let upper = block.split_off(3);
        assert_eq!(block, Block::U64(vec![1, 2, 3]));
        assert_eq!(upper, Block::U64(vec![4, 5]));

        block.delete_range(1, 1);
        assert_eq!(block, Block::U64(vec![1, 3]));
        block.delete_range(1, 10);
        assert_eq!(block, Block::U64(vec![1]));
    }

    #[test]
    fn test_append_range_type_mismatch() {
        let mut a = Block::U64(vec![1]);
        a.append_range(&Block::U64(vec![7, 8, 9]), 1, 3).unwrap();
        assert_eq!(a, Block::U64(vec![1, 8, 9]));
        assert!(a.append_range(&Block::I64(vec![1]), 0, 1).is_err());
    }

    #[test]
    fn test_wire_encoding() {
        let mut buf = Vec::new();
        Block::Bytes(vec![b"hi".to_vec()]).write_wire(0, &mut buf).unwrap();
        assert_eq!(buf, vec![2, 0, 0, 0, b'h', b'i']);
        assert!(Block::U8(vec![1]).write_wire(1, &mut buf).is_err());
    }
}
