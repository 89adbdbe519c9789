//! Readers over the stored packs of an index.
//!
//! [`LookupIterator`] resolves sorted point keys by binary search inside
//! each pack. [`ScanIterator`] walks pack statistics and only loads packs
//! whose key range can satisfy a [`KeyFilter`].

use std::sync::Arc;

use roaring::RoaringTreemap;
use tracing::debug;

use super::merge::MergeValue;
use super::state::PackStats;
use super::{BucketNames, KEY_COL, ROW_COL};
use crate::cache::BucketCache;
use crate::context::Context;
use crate::encoding::format::{Formatter, Packs};
use crate::encoding::keycode::{PackKey, KEY_COLUMN, ROWID_COLUMN};
use crate::encoding::{Key, Value};
use crate::error::{Error, Result};
use crate::pack::{Block, Package};
use crate::query::KeyFilter;
use crate::store::{Cursor, Db, Tx};

/// Keys per pack in the data bucket, one per column.
pub(crate) const DATA_STRIDE: usize = 2;
/// Keys per pack in the stats bucket.
pub(crate) const STATS_STRIDE: usize = 1;

/// A pack read from the data bucket.
pub(crate) struct LoadedPack {
    /// Storage key of the pack.
    pub key: MergeValue,
    pub pack: Package,
    /// Encoded size of both column blocks.
    pub stored_size: usize,
    /// Storage key of the following pack, invalid at the end.
    pub next: MergeValue,
}

fn decode_pack_key(cursor: &Cursor) -> Result<PackKey> {
    let key = cursor
        .key()
        .ok_or_else(|| Error::Contract("cursor is not positioned".into()))?;
    PackKey::decode(key)
}

/// Positions `cursor` on the first key of the last pack starting at or
/// before `search`, where every pack occupies `stride` keys. Returns false
/// when the bucket is empty or all packs start after `search`.
pub(crate) fn seek_pack<T: Tx>(
    cursor: &mut Cursor,
    tx: &T,
    search: MergeValue,
    stride: usize,
) -> Result<bool> {
    if cursor.seek(tx, &PackKey::first(search.key, search.row_id).encode())? {
        let k = decode_pack_key(cursor)?;
        if (k.key, k.row_id) == (search.key, search.row_id) {
            return Ok(true);
        }
        let mut valid = true;
        for _ in 0..stride {
            valid = cursor.prev(tx)?;
        }
        return Ok(valid);
    }
    if !cursor.last(tx)? {
        return Ok(false);
    }
    for _ in 1..stride {
        if !cursor.prev(tx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn load_block(cache: Option<&BucketCache>, key: PackKey, value: &[u8]) -> Result<Arc<Block>> {
    let Some(cache) = cache else {
        return Ok(Arc::new(Block::decode(value)?));
    };
    if let Some(block) = cache.get(key) {
        return Ok(block);
    }
    let block = Arc::new(Block::decode(value)?);
    cache.insert(key, block.clone());
    Ok(block)
}

/// Reads the pack whose first column is under the cursor and leaves the
/// cursor on the following pack.
pub(crate) fn read_pack<T: Tx>(
    cursor: &mut Cursor,
    tx: &T,
    cache: Option<&BucketCache>,
    pack_size: usize,
) -> Result<LoadedPack> {
    let mut blocks = Vec::with_capacity(DATA_STRIDE);
    let mut first: Option<PackKey> = None;
    let mut stored_size = 0;
    for col in [KEY_COLUMN, ROWID_COLUMN] {
        let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
            return Err(Error::DatabaseCorrupt(format!("pack is missing column {col}")));
        };
        let k = PackKey::decode(key)?;
        let same_pack = first.map_or(true, |f| (f.key, f.row_id) == (k.key, k.row_id));
        if k.column != col || !same_pack {
            return Err(Error::Contract(format!(
                "expected column {col} of pack, found {}",
                Packs::key(key)
            )));
        }
        first.get_or_insert(k);
        stored_size += value.len();
        blocks.push(load_block(cache, k, value)?);
        cursor.next(tx)?;
    }

    let first = first.ok_or_else(|| Error::Contract("pack has no columns".into()))?;
    let next = match cursor.key() {
        Some(k) => {
            let k = PackKey::decode(k)?;
            MergeValue::new(k.key, k.row_id)
        }
        None => MergeValue::invalid(),
    };
    Ok(LoadedPack {
        key: MergeValue::new(first.key, first.row_id),
        pack: Package::from_blocks(blocks, pack_size)?,
        stored_size,
        next,
    })
}

fn begin_read<'a, D: Db + 'a>(db: &'a D, buckets: &BucketNames) -> Result<D::Tx<'a>> {
    let tx = db.begin(false)?;
    for b in [&buckets.data, &buckets.stats] {
        if !tx.has_bucket(b) {
            tx.rollback();
            return Err(Error::DatabaseCorrupt(format!("missing bucket {b}")));
        }
    }
    Ok(tx)
}

/// Resolves sorted point keys against the packs of one read snapshot.
pub struct LookupIterator<'a, D: Db + 'a> {
    tx: D::Tx<'a>,
    cursor: Cursor,
    cache: Option<&'a BucketCache>,
    pack_size: usize,
    keys: Vec<u64>,
    /// first key not yet fully resolved
    pos: usize,
    search: MergeValue,
    done: bool,
    pub packs_loaded: usize,
}

impl<'a, D: Db + 'a> LookupIterator<'a, D> {
    pub fn new(
        db: &'a D,
        buckets: &BucketNames,
        cache: Option<&'a BucketCache>,
        pack_size: usize,
        mut keys: Vec<u64>,
    ) -> Result<Self> {
        keys.sort_unstable();
        keys.dedup();
        let search = keys
            .first()
            .map_or(MergeValue::invalid(), |&k| MergeValue::new(k, 0));
        Ok(Self {
            tx: begin_read(db, buckets)?,
            cursor: Cursor::new(buckets.data.clone()),
            cache,
            pack_size,
            done: keys.is_empty(),
            keys,
            pos: 0,
            search,
            packs_loaded: 0,
        })
    }

    /// Returns the row ids found in the next pack that can hold a pending
    /// key, or `None` when every key is resolved.
    pub fn next_pack(&mut self) -> Result<Option<Vec<u64>>> {
        if self.done {
            return Ok(None);
        }
        if !seek_pack(&mut self.cursor, &self.tx, self.search, DATA_STRIDE)?
            && !self.cursor.first(&self.tx)?
        {
            self.done = true;
            return Ok(None);
        }
        let loaded = read_pack(&mut self.cursor, &self.tx, self.cache, self.pack_size)?;
        self.packs_loaded += 1;

        let pkeys = loaded.pack.u64s(KEY_COL)?;
        let prows = loaded.pack.u64s(ROW_COL)?;
        let next = loaded.next;
        let mut found = Vec::new();
        while self.pos < self.keys.len() {
            let k = self.keys[self.pos];
            let start = pkeys.partition_point(|&x| x < k);
            found.extend(
                pkeys[start..]
                    .iter()
                    .zip(&prows[start..])
                    .take_while(|(x, _)| **x == k)
                    .map(|(_, r)| *r)
                    .filter(|&r| r != 0),
            );
            // the key continues in, or belongs to, a later pack
            if next.is_valid() && next.key <= k {
                break;
            }
            self.pos += 1;
        }

        if !next.is_valid() || self.pos >= self.keys.len() {
            self.done = true;
        } else {
            let target = MergeValue::new(self.keys[self.pos], 0);
            self.search = if target.less(&next) { next } else { target };
        }
        Ok(Some(found))
    }

    /// Drains the iterator into a row id set.
    pub fn collect(mut self, ctx: &Context) -> Result<RoaringTreemap> {
        let mut rows = RoaringTreemap::new();
        while let Some(found) = self.next_pack()? {
            ctx.err()?;
            rows.extend(found);
        }
        debug!(keys = self.keys.len(), packs = self.packs_loaded, rows = rows.len(), "Lookup finished");
        self.tx.rollback();
        Ok(rows)
    }
}

/// Scans packs whose statistics may satisfy a key filter.
pub struct ScanIterator<'a, D: Db + 'a> {
    tx: D::Tx<'a>,
    stats: Cursor,
    data: Cursor,
    cache: Option<&'a BucketCache>,
    pack_size: usize,
    filter: KeyFilter,
    /// remaining key range, `None` once exhausted
    hull: Option<(u64, u64)>,
    started: bool,
    pub packs_loaded: usize,
    pub packs_skipped: usize,
}

impl<'a, D: Db + 'a> ScanIterator<'a, D> {
    pub fn new(
        db: &'a D,
        buckets: &BucketNames,
        cache: Option<&'a BucketCache>,
        pack_size: usize,
        filter: KeyFilter,
    ) -> Result<Self> {
        Ok(Self {
            tx: begin_read(db, buckets)?,
            stats: Cursor::new(buckets.stats.clone()),
            data: Cursor::new(buckets.data.clone()),
            cache,
            pack_size,
            hull: filter.bounds(),
            filter,
            started: false,
            packs_loaded: 0,
            packs_skipped: 0,
        })
    }

    fn advance(&mut self, lo: u64) -> Result<bool> {
        if self.started {
            return self.stats.next(&self.tx);
        }
        self.started = true;
        let search = MergeValue::new(lo, 0);
        if seek_pack(&mut self.stats, &self.tx, search, STATS_STRIDE)? {
            return Ok(true);
        }
        self.stats.first(&self.tx)
    }

    /// Returns the matching row ids of the next pack that passes the
    /// statistics check, or `None` at the end of the range.
    pub fn next_pack(&mut self) -> Result<Option<Vec<u64>>> {
        while let Some((lo, hi)) = self.hull {
            if !self.advance(lo)? {
                self.hull = None;
                break;
            }
            let key = decode_pack_key(&self.stats)?;
            let value = self
                .stats
                .value()
                .ok_or_else(|| Error::Contract("cursor is not positioned".into()))?;
            let stats = PackStats::decode(value)?;
            if stats.n_values > 0 && stats.min_key > hi {
                self.hull = None;
                break;
            }
            if !self.filter.maybe_match_tree(&stats) {
                self.packs_skipped += 1;
                continue;
            }

            let exact = PackKey::first(key.key, key.row_id).encode();
            if !self.data.seek(&self.tx, &exact)? || self.data.key() != Some(exact.as_slice()) {
                return Err(Error::DatabaseCorrupt(format!(
                    "statistics for missing {}",
                    Packs::key(&exact)
                )));
            }
            let loaded = read_pack(&mut self.data, &self.tx, self.cache, self.pack_size)?;
            self.packs_loaded += 1;

            let keys = loaded.pack.u64s(KEY_COL)?;
            let rows = loaded.pack.u64s(ROW_COL)?;
            let found = self
                .filter
                .match_tree(keys)
                .iter()
                .map(|pos| rows[pos as usize])
                .filter(|&r| r != 0)
                .collect();
            return Ok(Some(found));
        }
        Ok(None)
    }

    /// Drains the iterator into a row id set.
    pub fn collect(mut self, ctx: &Context) -> Result<RoaringTreemap> {
        let mut rows = RoaringTreemap::new();
        while let Some(found) = self.next_pack()? {
            ctx.err()?;
            rows.extend(found);
        }
        debug!(
            loaded = self.packs_loaded,
            skipped = self.packs_skipped,
            rows = rows.len(),
            "Scan finished"
        );
        self.tx.rollback();
        Ok(rows)
    }
}
