//! Epoch based cleanup and recovery of persisted tombstones.

use tracing::{debug, info};

use super::Index;
use crate::context::Context;
use crate::encoding::format::{Formatter, Tombs};
use crate::encoding::keycode::{encode_epoch_prefix, TombKey};
use crate::encoding::Key;
use crate::error::Result;
use crate::store::{Cursor, Db, Tx};

impl<D: Db> Index<D> {
    /// Deletes persisted tombstones that no open snapshot can need any
    /// more: those older than `watermark` whose epoch is already
    /// finalized. Returns the number removed.
    pub fn gc(&mut self, ctx: &Context, watermark: u64) -> Result<usize> {
        let limit = watermark.min(self.state.epoch.saturating_add(1));
        let mut tx = self.db.begin(true)?;
        let mut cursor = Cursor::new(self.buckets.tomb.clone());
        let mut valid = cursor.first(&tx)?;
        let mut removed = 0;
        while valid {
            ctx.err()?;
            let Some(key) = cursor.key() else { break };
            let tomb = TombKey::decode(key)?;
            if tomb.epoch >= limit {
                debug!(index = %self.name(), stop = %Tombs::key(key), "Tombstone GC reached limit");
                break;
            }
            let key = key.to_vec();
            tx.delete(&self.buckets.tomb, &key)?;
            removed += 1;
            valid = cursor.next(&tx)?;
        }
        tx.commit()?;

        self.metrics.gc_tombstones += removed as u64;
        if removed > 0 {
            info!(index = %self.name(), removed, watermark, epoch = self.state.epoch, "Collected tombstones");
        }
        Ok(removed)
    }

    /// Reloads tombstones newer than the finalized epoch into the tomb
    /// buffer. Their merge may not have completed before the last close.
    pub(crate) fn recover_tombs(&mut self) -> Result<usize> {
        let tx = self.db.begin(false)?;
        let mut cursor = Cursor::new(self.buckets.tomb.clone());
        let start = encode_epoch_prefix(self.state.epoch.saturating_add(1));
        let mut valid = self.state.epoch < u64::MAX && cursor.seek(&tx, &start)?;
        let mut recovered = 0;
        while valid {
            let Some(key) = cursor.key() else { break };
            let tomb = TombKey::decode(key)?;
            self.tomb.push(tomb.key, tomb.row_id, tomb.epoch);
            recovered += 1;
            valid = cursor.next(&tx)?;
        }
        tx.rollback();
        if recovered > 0 {
            info!(index = %self.name(), recovered, epoch = self.state.epoch, "Recovered unmerged tombstones");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{all_entries, int_index, orders_page, small_opts, test_table};
    use crate::pack::WriteMode;
    use crate::schema::{IndexKind, IndexSchema};
    use crate::store::mem::MemDb;

    fn tomb_epochs<D: Db>(idx: &Index<D>) -> Vec<u64> {
        let tx = idx.db.begin(false).unwrap();
        let mut cursor = Cursor::new(idx.buckets.tomb.clone());
        let mut out = Vec::new();
        let mut valid = cursor.first(&tx).unwrap();
        while valid {
            out.push(TombKey::decode(cursor.key().unwrap()).unwrap().epoch);
            valid = cursor.next(&tx).unwrap();
        }
        out
    }

    fn reopen(db: MemDb) -> Index<MemDb> {
        let schema = IndexSchema::new("amount_idx", IndexKind::Int, &["amount"], "id");
        Index::open(db, test_table(), schema, small_opts(4, 1 << 20)).unwrap()
    }

    #[test]
    fn test_gc_respects_watermark_and_epoch() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 4, 1 << 20);
        let page = orders_page(&[(1, 10, "a", 0), (2, 20, "b", 0), (3, 30, "c", 0)]);
        idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
        idx.finalize(&ctx, 1).unwrap();

        let first = page.clone().with_selection(vec![0]);
        idx.del_pack(&ctx, &first, WriteMode::IncludeSelected, 2).unwrap();
        idx.finalize(&ctx, 2).unwrap();
        let second = page.with_selection(vec![1]);
        idx.del_pack(&ctx, &second, WriteMode::IncludeSelected, 3).unwrap();
        // merged but epoch 3 is not finalized
        idx.sync(&ctx).unwrap();
        assert_eq!(tomb_epochs(&idx), vec![2, 3]);

        // watermark below both
        assert_eq!(idx.gc(&ctx, 2).unwrap(), 0);
        // unfinalized epochs survive any watermark
        assert_eq!(idx.gc(&ctx, 10).unwrap(), 1);
        assert_eq!(tomb_epochs(&idx), vec![3]);
        assert_eq!(idx.metrics().gc_tombstones, 1);
    }

    #[test]
    fn test_open_recovers_unmerged_tombstones() {
        let ctx = Context::new();
        let db = MemDb::in_memory();
        let mut idx = int_index(db.clone(), 4, 1 << 20);
        let page = orders_page(&[(1, 10, "a", 0), (2, 20, "b", 0)]);
        idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
        idx.finalize(&ctx, 1).unwrap();

        // persisted, then the merge never ran
        idx.del_pack(&ctx, &page, WriteMode::All, 2).unwrap();
        idx.tomb.sort();
        idx.persist_tomb().unwrap();
        drop(idx);

        let mut idx = reopen(db);
        assert_eq!(idx.tomb_len(), 2);
        idx.finalize(&ctx, 2).unwrap();
        assert!(all_entries(&idx).is_empty());
        assert_eq!(idx.state().nrows, 0);
        assert_eq!(idx.state().epoch, 2);
    }

    #[test]
    fn test_replayed_tombstones_are_stray() {
        let ctx = Context::new();
        let db = MemDb::in_memory();
        let mut idx = int_index(db.clone(), 4, 1 << 20);
        let page = orders_page(&[(1, 10, "a", 0), (2, 20, "b", 0)]);
        idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
        idx.finalize(&ctx, 1).unwrap();
        idx.del_pack(&ctx, &page.with_selection(vec![0]), WriteMode::IncludeSelected, 2).unwrap();
        idx.sync(&ctx).unwrap();
        drop(idx);

        // epoch 2 was merged but never finalized
        let mut idx = reopen(db);
        assert_eq!(idx.tomb_len(), 1);
        let stats = idx.merge_tomb(&ctx).unwrap();
        assert_eq!(stats.stray, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(idx.state().nrows, 1);
    }

    #[test]
    fn test_cancelled_gc_removes_nothing() {
        let ctx = Context::new();
        let mut idx = int_index(MemDb::in_memory(), 4, 1 << 20);
        idx.add_pack(&ctx, &orders_page(&[(1, 10, "a", 0)]), WriteMode::All).unwrap();
        idx.finalize(&ctx, 1).unwrap();
        idx.del_pack(&ctx, &orders_page(&[(1, 10, "a", 0)]), WriteMode::All, 2).unwrap();
        idx.finalize(&ctx, 2).unwrap();

        let cancelled = Context::new();
        cancelled.cancel();
        assert!(idx.gc(&cancelled, 10).is_err());
        assert_eq!(tomb_epochs(&idx), vec![2]);
        assert_eq!(idx.gc(&ctx, 10).unwrap(), 1);
    }
}
