use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::{snapshot, BucketStats, Db, KeyValue, Tx};
use crate::error::{Error, Result};

pub(crate) type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;
pub(crate) type Buckets = BTreeMap<String, Arc<Bucket>>;

struct Committed {
    version: u64,
    buckets: Arc<Buckets>,
}

struct Inner {
    committed: Mutex<Committed>,
    path: Option<PathBuf>,
}

/// In-memory MVCC bucket store with optional snapshot persistence.
///
/// Every transaction works on a copy-on-write view of the committed
/// state. Write transactions use optimistic concurrency: a commit fails
/// with `TxConflict` if another writer committed after it began.
#[derive(Clone)]
pub struct MemDb {
    inner: Arc<Inner>,
}

impl MemDb {
    /// Creates an empty, purely in-memory database.
    pub fn in_memory() -> Self {
        Self::with_state(Buckets::new(), None)
    }

    /// Opens a database persisted at `path`, loading the last committed
    /// snapshot if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let buckets = if path.exists() {
            let buckets = snapshot::load(&path)?;
            info!(path = %path.display(), buckets = buckets.len(), "Loaded database snapshot");
            buckets
        } else {
            Buckets::new()
        };
        Ok(Self::with_state(buckets, Some(path)))
    }

    fn with_state(buckets: Buckets, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                committed: Mutex::new(Committed {
                    version: 0,
                    buckets: Arc::new(buckets),
                }),
                path,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Committed> {
        self.inner
            .committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Db for MemDb {
    type Tx<'a> = MemTx<'a>;

    fn begin(&self, writable: bool) -> Result<MemTx<'_>> {
        let committed = self.lock();
        Ok(MemTx {
            db: self,
            base_version: committed.version,
            buckets: committed.buckets.clone(),
            writable,
            dirty: false,
        })
    }
}

pub struct MemTx<'a> {
    db: &'a MemDb,
    base_version: u64,
    buckets: Arc<Buckets>,
    writable: bool,
    dirty: bool,
}

impl MemTx<'_> {
    fn bucket(&self, name: &str) -> Result<&Bucket> {
        self.buckets
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::NoBucket(name.to_string()))
    }

    fn bucket_mut(&mut self, name: &str) -> Result<&mut Bucket> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        self.dirty = true;
        let buckets = Arc::make_mut(&mut self.buckets);
        let bucket = buckets
            .get_mut(name)
            .ok_or_else(|| Error::NoBucket(name.to_string()))?;
        Ok(Arc::make_mut(bucket))
    }
}

fn first_of<'b>(mut entries: impl Iterator<Item = (&'b Vec<u8>, &'b Vec<u8>)>) -> Option<KeyValue> {
    entries.next().map(|(k, v)| (k.clone(), v.clone()))
}

impl Tx for MemTx<'_> {
    fn is_writable(&self) -> bool {
        self.writable
    }

    fn create_bucket(&mut self, bucket: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if self.buckets.contains_key(bucket) {
            return Err(Error::BucketExists(bucket.to_string()));
        }
        self.dirty = true;
        Arc::make_mut(&mut self.buckets).insert(bucket.to_string(), Arc::new(Bucket::new()));
        Ok(())
    }

    fn delete_bucket(&mut self, bucket: &str) -> Result<()> {
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        if !self.buckets.contains_key(bucket) {
            return Err(Error::NoBucket(bucket.to_string()));
        }
        self.dirty = true;
        Arc::make_mut(&mut self.buckets).remove(bucket);
        Ok(())
    }

    fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.contains_key(bucket)
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.bucket(bucket)?.get(key).cloned())
    }

    fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.bucket_mut(bucket)?.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<()> {
        self.bucket_mut(bucket)?.remove(key);
        Ok(())
    }

    fn first(&self, bucket: &str) -> Result<Option<KeyValue>> {
        Ok(first_of(self.bucket(bucket)?.iter()))
    }

    fn last(&self, bucket: &str) -> Result<Option<KeyValue>> {
        Ok(first_of(self.bucket(bucket)?.iter().rev()))
    }

    fn seek(&self, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>> {
        let range = self
            .bucket(bucket)?
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded));
        Ok(first_of(range))
    }

    fn after(&self, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>> {
        let range = self
            .bucket(bucket)?
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded));
        Ok(first_of(range))
    }

    fn before(&self, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>> {
        let range = self
            .bucket(bucket)?
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .rev();
        Ok(first_of(range))
    }

    fn stats(&self, bucket: &str) -> Result<BucketStats> {
        let b = self.bucket(bucket)?;
        Ok(BucketStats {
            keys: b.len(),
            bytes: b.iter().map(|(k, v)| k.len() + v.len()).sum(),
        })
    }

    fn commit(self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut committed = self.db.lock();
        if committed.version != self.base_version {
            debug!(
                base = self.base_version,
                current = committed.version,
                "Rejecting conflicting commit"
            );
            return Err(Error::TxConflict);
        }
        if let Some(path) = &self.db.inner.path {
            snapshot::save(path, &self.buckets)?;
        }
        committed.version += 1;
        committed.buckets = self.buckets;
        Ok(())
    }

    fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Cursor;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_commit() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.put("b", b"k1", b"v1".to_vec()).unwrap();
        tx.commit().unwrap();

        let tx = db.begin(false).unwrap();
        assert_eq!(tx.get("b", b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tx.get("b", b"k2").unwrap(), None);
        assert!(matches!(tx.get("missing", b"k1"), Err(Error::NoBucket(_))));
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.put("b", b"k", b"old".to_vec()).unwrap();
        tx.commit().unwrap();

        let reader = db.begin(false).unwrap();
        let mut writer = db.begin(true).unwrap();
        writer.put("b", b"k", b"new".to_vec()).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.get("b", b"k").unwrap(), Some(b"old".to_vec()));
        let fresh = db.begin(false).unwrap();
        assert_eq!(fresh.get("b", b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_write_conflict() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.commit().unwrap();

        let mut a = db.begin(true).unwrap();
        let mut b = db.begin(true).unwrap();
        a.put("b", b"x", vec![1]).unwrap();
        b.put("b", b"y", vec![2]).unwrap();
        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(Error::TxConflict)));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(false).unwrap();
        assert!(matches!(tx.create_bucket("b"), Err(Error::TxNotWritable)));
    }

    #[test]
    fn test_rollback_discards() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.rollback();
        assert!(!db.begin(false).unwrap().has_bucket("b"));
    }

    #[test]
    fn test_cursor_navigation_survives_writes() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        for k in [b"a", b"c", b"e"] {
            tx.put("b", k, k.to_vec()).unwrap();
        }

        let mut cursor = Cursor::new("b");
        assert!(cursor.seek(&tx, b"b").unwrap());
        assert_eq!(cursor.key(), Some(&b"c"[..]));

        tx.delete("b", b"c").unwrap();
        tx.put("b", b"d", b"d".to_vec()).unwrap();

        assert!(cursor.next(&tx).unwrap());
        assert_eq!(cursor.key(), Some(&b"d"[..]));
        assert!(cursor.prev(&tx).unwrap());
        assert_eq!(cursor.key(), Some(&b"a"[..]));
        assert!(!cursor.prev(&tx).unwrap());
        assert!(!cursor.next(&tx).unwrap());

        assert!(cursor.last(&tx).unwrap());
        assert_eq!(cursor.value(), Some(&b"e"[..]));
        assert!(!cursor.seek(&tx, b"f").unwrap());
    }

    #[test]
    fn test_bucket_stats() {
        let db = MemDb::in_memory();
        let mut tx = db.begin(true).unwrap();
        tx.create_bucket("b").unwrap();
        tx.put("b", b"ab", vec![0; 3]).unwrap();
        tx.put("b", b"c", vec![0; 4]).unwrap();
        assert_eq!(tx.stats("b").unwrap(), BucketStats { keys: 2, bytes: 10 });
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let db = MemDb::open(&path).unwrap();
            let mut tx = db.begin(true).unwrap();
            tx.create_bucket("data").unwrap();
            tx.create_bucket("empty").unwrap();
            tx.put("data", b"k", b"v".to_vec()).unwrap();
            tx.commit().unwrap();
        }

        let db = MemDb::open(&path).unwrap();
        let tx = db.begin(false).unwrap();
        assert!(tx.has_bucket("empty"));
        assert_eq!(tx.get("data", b"k").unwrap(), Some(b"v".to_vec()));
    }
}
