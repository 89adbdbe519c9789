//! Secondary index storage and merge engine.
//!
//! An index maps a key derived from one or more table columns to the row
//! ids of matching rows. Entries are kept as sorted runs ("packs") of
//! (key, row id) pairs in the backend store:
//!
//! ```text
//!  add_pack ──► Converter ──► Journal ──┐
//!                                       ├──► merge ──► {name}_data  (pack blocks)
//!  del_pack ──► Converter ──► Tomb ─────┘             {name}_stats (pack statistics)
//!                              │                      {name}_state (IndexState)
//!                              └──► {name}_tomb (until gc)
//! ```
//!
//! # Write Path
//! 1. **Convert**: table pages become two-column index pages
//! 2. **Buffer**: inserts go to the journal, deletes to the tomb
//! 3. **Merge**: a full buffer, `sync` or `finalize` merges it into packs,
//!    splitting packs that grow past the configured size
//!
//! # Read Path
//! - **Lookup**: equality and IN conditions binary-search each pack
//! - **Scan**: range conditions prune packs by their statistics first
//!
//! # Recovery
//!
//! A merge may commit in several transactions. Replaying a journal skips
//! entries already on disk, and tombstones are persisted before they are
//! merged so `open` can reload and replay them.

pub mod buffer;
pub mod convert;
pub mod gc;
pub mod iterator;
pub mod merge;
pub mod metrics;
pub mod query;
pub mod state;

pub use buffer::{Journal, Tomb};
pub use convert::{Convert, Converter};
pub use merge::{MergeIterator, MergeValue};
pub use metrics::{IndexMetrics, MergeStats};
pub use query::IndexResult;
pub use state::{IndexState, PackStats};

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cache::{BlockCache, BucketCache};
use crate::config::IndexOptions;
use crate::context::Context;
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::pack::{Package, WriteMode};
use crate::schema::{IndexSchema, Schema};
use crate::store::{Db, Tx};
use state::STATE_KEY;

/// Position of the key column in index pages.
pub const KEY_COL: usize = 0;
/// Position of the row id column in index pages.
pub const ROW_COL: usize = 1;

/// Names of the buckets owned by one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
    pub data: String,
    pub stats: String,
    pub tomb: String,
    pub state: String,
}

impl BucketNames {
    pub fn new(index: &str) -> Self {
        Self {
            data: format!("{index}_data"),
            stats: format!("{index}_stats"),
            tomb: format!("{index}_tomb"),
            state: format!("{index}_state"),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.data, &self.stats, &self.tomb, &self.state]
    }
}

/// A secondary index over one table.
///
/// Callers serialize writes per index. Queries open their own read
/// transactions and may run while another handle merges.
pub struct Index<D: Db> {
    db: D,
    table: Schema,
    schema: IndexSchema,
    opts: IndexOptions,
    buckets: BucketNames,
    converter: Converter,
    journal: Journal,
    tomb: Tomb,
    state: IndexState,
    cache: Option<BucketCache>,
    metrics: IndexMetrics,
}

impl<D: Db> Index<D> {
    /// Creates the buckets of a new index and stores its initial state.
    pub fn create(db: D, table: Schema, schema: IndexSchema, opts: IndexOptions) -> Result<Self> {
        opts.validate()?;
        let converter = Converter::new(&table, &schema)?;
        let buckets = BucketNames::new(&schema.name);
        {
            let mut tx = db.begin(true)?;
            if buckets.all().iter().any(|b| tx.has_bucket(b)) {
                tx.rollback();
                return Err(Error::IndexExists(schema.name.clone()));
            }
            for b in buckets.all() {
                tx.create_bucket(b)?;
            }
            tx.put(&buckets.state, STATE_KEY, IndexState::default().encode()?)?;
            tx.commit()?;
        }
        info!(index = %schema.name, kind = ?schema.kind, fields = ?schema.fields, "Created index");
        Ok(Self::assemble(db, table, schema, opts, buckets, converter, IndexState::default()))
    }

    /// Opens an existing index, reloading tombstones that were persisted
    /// but not yet merged.
    pub fn open(db: D, table: Schema, schema: IndexSchema, opts: IndexOptions) -> Result<Self> {
        opts.validate()?;
        let converter = Converter::new(&table, &schema)?;
        let buckets = BucketNames::new(&schema.name);
        let state = {
            let tx = db.begin(false)?;
            if let Some(missing) = buckets.all().into_iter().find(|b| !tx.has_bucket(b)) {
                let err = if missing == buckets.data {
                    Error::NoIndex(schema.name.clone())
                } else {
                    Error::DatabaseCorrupt(format!("index {} has no bucket {missing}", schema.name))
                };
                tx.rollback();
                return Err(err);
            }
            let state = tx
                .get(&buckets.state, STATE_KEY)?
                .ok_or_else(|| {
                    Error::DatabaseCorrupt(format!("index {} has no state record", schema.name))
                })
                .and_then(|v| IndexState::decode(&v));
            tx.rollback();
            state?
        };

        let mut index = Self::assemble(db, table, schema, opts, buckets, converter, state);
        let recovered = index.recover_tombs()?;
        info!(
            index = %index.name(),
            rows = state.nrows,
            packs = state.npacks,
            epoch = state.epoch,
            recovered,
            "Opened index"
        );
        Ok(index)
    }

    fn assemble(
        db: D,
        table: Schema,
        schema: IndexSchema,
        opts: IndexOptions,
        buckets: BucketNames,
        converter: Converter,
        state: IndexState,
    ) -> Self {
        let cache = opts.use_cache.then(|| {
            BucketCache::new(&buckets.data, Arc::new(Mutex::new(BlockCache::new(opts.cache_size))))
        });
        Self {
            journal: Journal::new(opts.journal_size),
            tomb: Tomb::new(opts.journal_size),
            db,
            table,
            schema,
            opts,
            buckets,
            converter,
            state,
            cache,
            metrics: IndexMetrics {
                total_size: state.size,
                ..Default::default()
            },
        }
    }

    /// Shares a block cache with other indexes. Blocks are cached per data
    /// bucket. Ignored when caching is off.
    pub fn with_cache(mut self, cache: Arc<Mutex<BlockCache>>) -> Self {
        if self.opts.use_cache {
            self.cache = Some(BucketCache::new(&self.buckets.data, cache));
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn table(&self) -> &Schema {
        &self.table
    }

    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn metrics(&self) -> IndexMetrics {
        self.metrics.clone()
    }

    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    pub fn tomb_len(&self) -> usize {
        self.tomb.len()
    }

    /// Indexes the rows of a table page selected by `mode`.
    pub fn add_pack(&mut self, ctx: &Context, pkg: &Package, mode: WriteMode) -> Result<()> {
        let page = self.converter.convert_pack(pkg, mode)?;
        if page.is_empty() {
            return Ok(());
        }
        if self.journal.len() + page.len() <= self.journal.capacity() {
            self.journal.append_page(&page)?;
        } else {
            let (keys, rows) = (page.u64s(KEY_COL)?, page.u64s(ROW_COL)?);
            for (&k, &r) in keys.iter().zip(rows) {
                self.journal.push(k, r);
                if self.journal.is_full() {
                    self.merge_append(ctx)?;
                }
            }
        }
        if self.journal.is_full() {
            self.merge_append(ctx)?;
        }
        Ok(())
    }

    /// Removes the rows of a table page selected by `mode`. `epoch` must be
    /// newer than the last finalized epoch.
    pub fn del_pack(
        &mut self,
        ctx: &Context,
        pkg: &Package,
        mode: WriteMode,
        epoch: u64,
    ) -> Result<()> {
        if epoch <= self.state.epoch {
            return Err(Error::InvalidValue(format!(
                "delete epoch {epoch} is not after finalized epoch {}",
                self.state.epoch
            )));
        }
        let page = self.converter.convert_pack(pkg, mode)?;
        if page.is_empty() {
            return Ok(());
        }
        if self.tomb.len() + page.len() <= self.journal.capacity() {
            self.tomb.append_page(&page, epoch)?;
        } else {
            let (keys, rows) = (page.u64s(KEY_COL)?, page.u64s(ROW_COL)?);
            for (&k, &r) in keys.iter().zip(rows) {
                self.tomb.push(k, r, epoch);
                if self.tomb.is_full() {
                    self.merge_tomb(ctx)?;
                }
            }
        }
        if self.tomb.is_full() {
            self.merge_tomb(ctx)?;
        }
        Ok(())
    }

    /// Merges both buffers, inserts first.
    pub fn sync(&mut self, ctx: &Context) -> Result<()> {
        self.merge_append(ctx)?;
        self.merge_tomb(ctx)?;
        Ok(())
    }

    /// Merges both buffers and records `epoch` as finalized.
    pub fn finalize(&mut self, ctx: &Context, epoch: u64) -> Result<()> {
        self.sync(ctx)?;
        if epoch > self.state.epoch {
            let mut next = self.state;
            next.epoch = epoch;
            let mut tx = self.db.begin(true)?;
            tx.put(&self.buckets.state, STATE_KEY, next.encode()?)?;
            tx.commit()?;
            self.state = next;
            debug!(index = %self.name(), epoch, "Finalized epoch");
        }
        Ok(())
    }

    /// Merges pending buffers and returns the underlying store.
    pub fn close(mut self, ctx: &Context) -> Result<D> {
        self.sync(ctx)?;
        self.metrics.log(&self.schema.name);
        Ok(self.db)
    }

    /// Removes every entry and tombstone and resets the state.
    pub fn truncate(&mut self) -> Result<()> {
        let mut tx = self.db.begin(true)?;
        for b in [&self.buckets.data, &self.buckets.stats, &self.buckets.tomb] {
            tx.delete_bucket(b)?;
            tx.create_bucket(b)?;
        }
        tx.put(&self.buckets.state, STATE_KEY, IndexState::default().encode()?)?;
        tx.commit()?;

        self.journal.clear();
        self.tomb.clear();
        self.state = IndexState::default();
        self.metrics.total_size = 0;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!(index = %self.name(), "Truncated index");
        Ok(())
    }

    /// Deletes all buckets of the index and returns the store.
    pub fn drop_index(self) -> Result<D> {
        {
            let mut tx = self.db.begin(true)?;
            for b in self.buckets.all() {
                tx.delete_bucket(b)?;
            }
            tx.commit()?;
        }
        info!(index = %self.schema.name, "Dropped index");
        Ok(self.db)
    }

    /// Rebuilds the index from a full pass over the table.
    pub fn rebuild<'p>(
        &mut self,
        ctx: &Context,
        pages: impl IntoIterator<Item = &'p Package>,
    ) -> Result<()> {
        let epoch = self.state.epoch;
        self.truncate()?;
        for page in pages {
            ctx.err()?;
            self.add_pack(ctx, page, WriteMode::All)?;
        }
        self.finalize(ctx, epoch)?;
        info!(index = %self.name(), rows = self.state.nrows, packs = self.state.npacks, "Rebuilt index");
        Ok(())
    }

    pub fn log_metrics(&self) {
        self.metrics.log(self.name());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::encoding::keycode::PackKey;
    use crate::encoding::Key;
    use crate::pack::{Block, BlockType};
    use crate::schema::{Field, FieldType, IndexKind};
    use crate::store::mem::MemDb;
    use crate::store::Cursor;

    pub(crate) fn test_table() -> Schema {
        Schema::new(
            "orders",
            vec![
                Field::new("id", FieldType::Uint64),
                Field::new("amount", FieldType::Int64),
                Field::new("name", FieldType::String),
                Field::new("region", FieldType::Uint32),
            ],
        )
    }

    /// Builds an orders page from (id, amount, name, region) rows.
    pub(crate) fn orders_page(rows: &[(u64, i64, &str, u32)]) -> Package {
        let mut pkg = Package::new(&test_table().block_types(), rows.len().max(1));
        let mut ids = Block::new(BlockType::U64, rows.len());
        let mut amounts = Block::new(BlockType::I64, rows.len());
        let mut names = Block::new(BlockType::Bytes, rows.len());
        let mut regions = Block::new(BlockType::U32, rows.len());
        for &(id, amount, name, region) in rows {
            if let Block::U64(v) = &mut ids {
                v.push(id);
            }
            if let Block::I64(v) = &mut amounts {
                v.push(amount);
            }
            if let Block::Bytes(v) = &mut names {
                v.push(name.as_bytes().to_vec());
            }
            if let Block::U32(v) = &mut regions {
                v.push(region);
            }
        }
        for (col, block) in [ids, amounts, names, regions].into_iter().enumerate() {
            *pkg.block_mut(col).unwrap() = block;
        }
        pkg
    }

    pub(crate) fn small_opts(pack_size: usize, tx_max_size: usize) -> IndexOptions {
        IndexOptions::new()
            .pack_size(pack_size)
            .journal_size(64)
            .tx_max_size(tx_max_size)
            .cache_size(16)
    }

    /// An ordered index on `amount`.
    pub(crate) fn int_index(db: MemDb, pack_size: usize, tx_max_size: usize) -> Index<MemDb> {
        let schema = IndexSchema::new("amount_idx", IndexKind::Int, &["amount"], "id");
        Index::create(db, test_table(), schema, small_opts(pack_size, tx_max_size)).unwrap()
    }

    /// Entries of every stored pack, in bucket order.
    pub(crate) fn pack_entries<D: Db>(idx: &Index<D>) -> Vec<Vec<(u64, u64)>> {
        let tx = idx.db.begin(false).unwrap();
        let mut cursor = Cursor::new(idx.buckets.data.clone());
        let mut packs = Vec::new();
        let mut valid = cursor.first(&tx).unwrap();
        while valid {
            let k = PackKey::decode(cursor.key().unwrap()).unwrap();
            assert_eq!(k.column, 0);
            let keys = Block::decode(cursor.value().unwrap()).unwrap();
            cursor.next(&tx).unwrap();
            let rows = Block::decode(cursor.value().unwrap()).unwrap();
            let entries = keys
                .as_u64s()
                .unwrap()
                .iter()
                .copied()
                .zip(rows.as_u64s().unwrap().iter().copied())
                .collect::<Vec<_>>();
            packs.push(entries);
            valid = cursor.next(&tx).unwrap();
        }
        tx.rollback();
        packs
    }

    pub(crate) fn pack_layout<D: Db>(idx: &Index<D>) -> Vec<Vec<u64>> {
        pack_entries(idx)
            .into_iter()
            .map(|p| p.into_iter().map(|(k, _)| k).collect())
            .collect()
    }

    pub(crate) fn all_entries<D: Db>(idx: &Index<D>) -> Vec<(u64, u64)> {
        pack_entries(idx).into_iter().flatten().collect()
    }

    #[test]
    fn test_bucket_names() {
        let b = BucketNames::new("idx");
        assert_eq!(b.all(), ["idx_data", "idx_stats", "idx_tomb", "idx_state"]);
    }

    #[test]
    fn test_create_twice_fails() {
        let db = MemDb::in_memory();
        let idx = int_index(db.clone(), 4, 64);
        drop(idx);
        let schema = IndexSchema::new("amount_idx", IndexKind::Int, &["amount"], "id");
        let err = Index::create(db, test_table(), schema, IndexOptions::default()).err();
        assert!(matches!(err, Some(Error::IndexExists(_))));
    }

    #[test]
    fn test_open_missing_index() {
        let schema = IndexSchema::new("nope", IndexKind::Int, &["amount"], "id");
        let err = Index::open(MemDb::in_memory(), test_table(), schema, IndexOptions::default()).err();
        assert!(matches!(err, Some(Error::NoIndex(_))));
    }

    #[test]
    fn test_open_without_state_is_corrupt() {
        let db = MemDb::in_memory();
        drop(int_index(db.clone(), 4, 64));
        {
            let mut tx = db.begin(true).unwrap();
            tx.delete(&BucketNames::new("amount_idx").state, STATE_KEY).unwrap();
            tx.commit().unwrap();
        }
        let schema = IndexSchema::new("amount_idx", IndexKind::Int, &["amount"], "id");
        let err = Index::open(db, test_table(), schema, IndexOptions::default()).err();
        assert!(matches!(err, Some(Error::DatabaseCorrupt(_))));
    }

    #[test]
    fn test_add_and_delete_pages() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 4, 1 << 20);
        let page = orders_page(&[(1, 30, "a", 1), (2, -5, "b", 1), (3, 12, "c", 2)]);
        idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
        assert_eq!(idx.journal_len(), 3);
        idx.finalize(&ctx, 1).unwrap();
        assert_eq!(idx.journal_len(), 0);
        assert_eq!(idx.state().nrows, 3);
        assert_eq!(idx.state().epoch, 1);

        let rows: Vec<u64> = all_entries(&idx).iter().map(|e| e.1).collect();
        assert_eq!(rows, vec![2, 3, 1]);

        // deletes must be tagged with a newer epoch
        let del = page.clone().with_selection(vec![0]);
        let err = idx.del_pack(&ctx, &del, WriteMode::IncludeSelected, 1);
        assert!(matches!(err, Err(Error::InvalidValue(_))));

        idx.del_pack(&ctx, &del, WriteMode::IncludeSelected, 2).unwrap();
        idx.finalize(&ctx, 2).unwrap();
        let rows: Vec<u64> = all_entries(&idx).iter().map(|e| e.1).collect();
        assert_eq!(rows, vec![2, 3]);
        assert_eq!(idx.state().nrows, 2);
        assert_eq!(idx.state().epoch, 2);
    }

    #[test]
    fn test_full_journal_merges() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 8, 1 << 20);
        let rows: Vec<(u64, i64, &str, u32)> = (1..=100).map(|i| (i, i as i64, "x", 0)).collect();
        idx.add_pack(&ctx, &orders_page(&rows), WriteMode::All).unwrap();
        assert!(idx.journal_len() < 64);
        assert_eq!(idx.state().nrows + idx.journal_len() as u64, 100);
        idx.sync(&ctx).unwrap();
        assert_eq!(idx.state().nrows, 100);
        assert!(pack_entries(&idx).iter().all(|p| p.len() <= 8));
    }

    #[test]
    fn test_insert_then_delete_in_one_window() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 4, 1 << 20);
        let page = orders_page(&[(7, 70, "a", 0)]);
        idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
        idx.del_pack(&ctx, &page, WriteMode::All, 1).unwrap();
        idx.finalize(&ctx, 1).unwrap();
        assert!(all_entries(&idx).is_empty());
        assert_eq!(idx.state().nrows, 0);
    }

    #[test]
    fn test_truncate_and_rebuild() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 4, 1 << 20);
        let page = orders_page(&[(1, 3, "a", 0), (2, 1, "b", 0), (3, 2, "c", 0)]);
        idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
        idx.finalize(&ctx, 3).unwrap();

        idx.truncate().unwrap();
        assert!(all_entries(&idx).is_empty());
        assert_eq!(idx.state(), &IndexState::default());

        idx.rebuild(&ctx, [&page]).unwrap();
        assert_eq!(all_entries(&idx), vec![(order(1), 2), (order(2), 3), (order(3), 1)]);
        assert_eq!(idx.state().nrows, 3);
    }

    fn order(v: i64) -> u64 {
        crate::encoding::keycode::order_i64(v)
    }

    #[test]
    fn test_drop_index_removes_buckets() {
        let idx = int_index(MemDb::in_memory(), 4, 64);
        let db = idx.drop_index().unwrap();
        let tx = db.begin(false).unwrap();
        for b in BucketNames::new("amount_idx").all() {
            assert!(!tx.has_bucket(b));
        }
        tx.rollback();
    }

    #[test]
    fn test_close_merges_and_reopen() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 4, 64);
        idx.add_pack(&ctx, &orders_page(&[(1, 5, "a", 0)]), WriteMode::All).unwrap();
        let db = idx.close(&ctx).unwrap();

        let schema = IndexSchema::new("amount_idx", IndexKind::Int, &["amount"], "id");
        let idx = Index::open(db, test_table(), schema, small_opts(4, 64)).unwrap();
        assert_eq!(idx.state().nrows, 1);
        assert_eq!(all_entries(&idx), vec![(order(5), 1)]);
    }
}
