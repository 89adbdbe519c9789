//! On-disk snapshot of a [`MemDb`](super::mem::MemDb).
//!
//! Layout (big-endian):
//!
//! ```text
//! magic u32 | version u16 | checksum u64 | body_len u64 | body
//! body := nbuckets u32 { name_len u16 name nkeys u64 { klen u32 key vlen u32 value } }
//! ```

use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::mem::{Bucket, Buckets};
use crate::error::{Error, Result};
use crate::hasher::Hasher;

const MAGIC: u32 = 0x5044_5831; // "PDX1"
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 8 + 8;

pub(crate) fn encode(buckets: &Buckets) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    body.write_u32::<BigEndian>(buckets.len() as u32)?;
    for (name, bucket) in buckets {
        body.write_u16::<BigEndian>(name.len() as u16)?;
        body.write_all(name.as_bytes())?;
        body.write_u64::<BigEndian>(bucket.len() as u64)?;
        for (key, value) in bucket.iter() {
            body.write_u32::<BigEndian>(key.len() as u32)?;
            body.write_all(key)?;
            body.write_u32::<BigEndian>(value.len() as u32)?;
            body.write_all(value)?;
        }
    }

    let mut hasher = Hasher::new();
    hasher.write(&body);

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.write_u32::<BigEndian>(MAGIC)?;
    out.write_u16::<BigEndian>(VERSION)?;
    out.write_u64::<BigEndian>(hasher.checksum())?;
    out.write_u64::<BigEndian>(body.len() as u64)?;
    out.extend_from_slice(&body);
    Ok(out)
}

fn read_bytes(r: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let remaining = r.get_ref().len() - r.position() as usize;
    if len > remaining {
        return Err(Error::Decode("snapshot", "truncated entry".into()));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Buckets> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Decode("snapshot", "truncated header".into()));
    }
    let mut r = Cursor::new(bytes);
    let magic = r.read_u32::<BigEndian>()?;
    if magic != MAGIC {
        return Err(Error::Decode("snapshot", format!("bad magic {magic:#x}")));
    }
    let version = r.read_u16::<BigEndian>()?;
    if version != VERSION {
        return Err(Error::Decode("snapshot", format!("unsupported version {version}")));
    }
    let checksum = r.read_u64::<BigEndian>()?;
    let body_len = r.read_u64::<BigEndian>()? as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != body_len {
        return Err(Error::Decode("snapshot", "body length mismatch".into()));
    }
    let mut hasher = Hasher::new();
    hasher.write(body);
    if hasher.checksum() != checksum {
        return Err(Error::ChecksumMismatch);
    }

    let mut r = Cursor::new(body);
    let mut buckets = Buckets::new();
    for _ in 0..r.read_u32::<BigEndian>()? {
        let name_len = r.read_u16::<BigEndian>()? as usize;
        let name = String::from_utf8(read_bytes(&mut r, name_len)?)
            .map_err(|e| Error::Decode("snapshot bucket name", e.to_string()))?;
        let mut bucket = Bucket::new();
        for _ in 0..r.read_u64::<BigEndian>()? {
            let klen = r.read_u32::<BigEndian>()? as usize;
            let key = read_bytes(&mut r, klen)?;
            let vlen = r.read_u32::<BigEndian>()? as usize;
            let value = read_bytes(&mut r, vlen)?;
            bucket.insert(key, value);
        }
        buckets.insert(name, Arc::new(bucket));
    }
    Ok(buckets)
}

/// Atomically replaces the snapshot at `path`.
pub(crate) fn save(path: &Path, buckets: &Buckets) -> Result<()> {
    let bytes = encode(buckets)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn load(path: &Path) -> Result<Buckets> {
    let bytes = fs::read(path)?;
    decode(&bytes)
}
