//! Transactional bucket store backing the index.
//!
//! The index only depends on the [`Db`] and [`Tx`] traits. [`mem::MemDb`]
//! is the bundled MVCC implementation.

pub mod mem;
pub mod snapshot;

use crate::error::Result;

/// An entry returned by positioning calls.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Size information about a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub keys: usize,
    pub bytes: usize,
}

pub trait Db {
    /// The transaction type returned by begin().
    type Tx<'a>: Tx
    where
        Self: 'a;

    /// Opens a transaction. Read transactions see a stable snapshot.
    fn begin(&self, writable: bool) -> Result<Self::Tx<'_>>;

    /// Commits `tx` and opens a fresh write transaction.
    fn commit_and_continue<'a>(&'a self, tx: Self::Tx<'a>) -> Result<Self::Tx<'a>> {
        tx.commit()?;
        self.begin(true)
    }
}

/// A transaction over named buckets. Bucket iteration follows key byte
/// order. Calls on a missing bucket fail with `Error::NoBucket`.
pub trait Tx {
    fn is_writable(&self) -> bool;

    fn create_bucket(&mut self, bucket: &str) -> Result<()>;

    fn delete_bucket(&mut self, bucket: &str) -> Result<()>;

    fn has_bucket(&self, bucket: &str) -> bool;

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) -> Result<()>;

    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<()>;

    /// Returns the smallest entry.
    fn first(&self, bucket: &str) -> Result<Option<KeyValue>>;

    /// Returns the largest entry.
    fn last(&self, bucket: &str) -> Result<Option<KeyValue>>;

    /// Returns the smallest entry with a key >= `key`.
    fn seek(&self, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>>;

    /// Returns the smallest entry with a key > `key`.
    fn after(&self, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>>;

    /// Returns the largest entry with a key < `key`.
    fn before(&self, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>>;

    fn stats(&self, bucket: &str) -> Result<BucketStats>;

    fn commit(self) -> Result<()>;

    fn rollback(self);
}

/// A forward/backward cursor over one bucket.
///
/// The cursor remembers its current entry rather than a position in the
/// underlying tree, so writes through the same transaction never
/// invalidate it.
#[derive(Debug, Clone)]
pub struct Cursor {
    bucket: String,
    current: Option<KeyValue>,
}

impl Cursor {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            current: None,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    pub fn first<T: Tx>(&mut self, tx: &T) -> Result<bool> {
        self.current = tx.first(&self.bucket)?;
        Ok(self.valid())
    }

    pub fn last<T: Tx>(&mut self, tx: &T) -> Result<bool> {
        self.current = tx.last(&self.bucket)?;
        Ok(self.valid())
    }

    pub fn seek<T: Tx>(&mut self, tx: &T, key: &[u8]) -> Result<bool> {
        self.current = tx.seek(&self.bucket, key)?;
        Ok(self.valid())
    }

    /// Moves to the next entry. An exhausted cursor stays exhausted.
    pub fn next<T: Tx>(&mut self, tx: &T) -> Result<bool> {
        self.current = match self.current.take() {
            Some((key, _)) => tx.after(&self.bucket, &key)?,
            None => None,
        };
        Ok(self.valid())
    }

    /// Moves to the previous entry. An exhausted cursor stays exhausted.
    pub fn prev<T: Tx>(&mut self, tx: &T) -> Result<bool> {
        self.current = match self.current.take() {
            Some((key, _)) => tx.before(&self.bucket, &key)?,
            None => None,
        };
        Ok(self.valid())
    }
}
