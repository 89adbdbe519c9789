//! Merging of the journal and tomb buffers into on-disk packs.
//!
//! Packs are stored under the (key, row id) of the first record they were
//! created with and hold every entry in `[own key, next pack key)`. Merges
//! walk the buffers in sorted order, load the single pack whose range
//! covers the next buffered entry, and write back new packs.

use std::time::{Instant, SystemTime};

use tracing::{debug, error, info, warn};

use super::iterator::{read_pack, seek_pack, DATA_STRIDE};
use super::metrics::MergeStats;
use super::state::{IndexState, PackStats, STATE_KEY};
use super::{BucketNames, Index, KEY_COL, ROW_COL};
use crate::cache::BucketCache;
use crate::config::IndexOptions;
use crate::context::Context;
use crate::encoding::keycode::{PackKey, TombKey, KEY_COLUMN, ROWID_COLUMN};
use crate::encoding::{Key, Value};
use crate::error::{Error, Result};
use crate::pack::{BlockType, Package};
use crate::store::{Cursor, Db, Tx};

/// A comparable (key, row id) pair. Invalid values sort after every valid
/// value and stand for "no more input".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeValue {
    pub key: u64,
    pub row_id: u64,
    pub valid: bool,
}

impl MergeValue {
    pub fn new(key: u64, row_id: u64) -> Self {
        Self {
            key,
            row_id,
            valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn less(&self, other: &MergeValue) -> bool {
        match (self.valid, other.valid) {
            (true, true) => (self.key, self.row_id) < (other.key, other.row_id),
            (true, false) => true,
            _ => false,
        }
    }

    pub fn equal(&self, other: &MergeValue) -> bool {
        self.valid && other.valid && self.key == other.key && self.row_id == other.row_id
    }
}

/// Returns a new empty index pack.
pub(crate) fn new_pack(pack_size: usize) -> Package {
    Package::new(&[BlockType::U64, BlockType::U64], pack_size)
}

fn value_at(keys: &[u64], rows: &[u64], i: usize) -> MergeValue {
    if i < keys.len() {
        MergeValue::new(keys[i], rows[i])
    } else {
        MergeValue::invalid()
    }
}

/// Locates, loads and stores index packs inside a write transaction that
/// is committed in batches.
pub struct MergeIterator<'a, D: Db + 'a> {
    db: &'a D,
    tx: Option<D::Tx<'a>>,
    cursor: Cursor,
    buckets: &'a BucketNames,
    pack_size: usize,
    tx_max_size: usize,
    cache: Option<&'a BucketCache>,
    /// index state when the merge started
    base: IndexState,
    /// index state as of the last successful batch commit
    committed: IndexState,
    /// key of the currently loaded pack, reused when it is stored back
    last: MergeValue,
    /// stored size of the currently loaded pack
    last_size: usize,
    /// bytes written since the last commit
    pending_bytes: usize,
    pub stats: MergeStats,
}

impl<'a, D: Db + 'a> MergeIterator<'a, D> {
    pub fn new(
        db: &'a D,
        buckets: &'a BucketNames,
        opts: &IndexOptions,
        cache: Option<&'a BucketCache>,
        state: IndexState,
    ) -> Self {
        Self {
            db,
            tx: None,
            cursor: Cursor::new(buckets.data.clone()),
            buckets,
            pack_size: opts.pack_size,
            tx_max_size: opts.tx_max_size,
            cache,
            base: state,
            committed: state,
            last: MergeValue::invalid(),
            last_size: 0,
            pending_bytes: 0,
            stats: MergeStats::default(),
        }
    }

    /// Loads the pack whose range covers `search` and returns it together
    /// with the first key of the following pack. Returns no pack when
    /// `search` sorts before the first pack or the index is empty. An
    /// invalid boundary means there is no following pack.
    pub fn next(&mut self, search: MergeValue) -> Result<(Option<Package>, MergeValue)> {
        if self.pending_bytes >= self.tx_max_size {
            if let Some(mut tx) = self.tx.take() {
                debug!(pending = self.pending_bytes, "Committing merge batch");
                // each batch carries the counters of the work it commits
                let state = self.pending_state();
                tx.put(&self.buckets.state, STATE_KEY, state.encode()?)?;
                self.tx = Some(self.db.commit_and_continue(tx)?);
                self.committed = state;
                self.cursor = Cursor::new(self.buckets.data.clone());
                self.pending_bytes = 0;
                self.stats.commits += 1;
            }
        }

        if self.tx.is_none() {
            let tx = self.db.begin(true)?;
            if !tx.has_bucket(&self.buckets.data) {
                return Err(Error::DatabaseCorrupt(format!(
                    "missing data bucket {}",
                    self.buckets.data
                )));
            }
            self.tx = Some(tx);
        }

        self.last = MergeValue::invalid();
        self.last_size = 0;
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Contract("merge iterator has no open transaction".into()))?;

        if !seek_pack(&mut self.cursor, tx, search, DATA_STRIDE)? {
            // search sorts before the first pack: its key bounds the new
            // front pack
            self.cursor.first(tx)?;
            let next = match self.cursor.key() {
                Some(k) => {
                    let k = PackKey::decode(k)?;
                    MergeValue::new(k.key, k.row_id)
                }
                None => MergeValue::invalid(),
            };
            return Ok((None, next));
        }

        let loaded = read_pack(&mut self.cursor, tx, None, self.pack_size)?;
        self.last = loaded.key;
        self.last_size = loaded.stored_size;
        self.stats.packs_loaded += 1;
        self.stats.bytes_read += loaded.stored_size;
        Ok((Some(loaded.pack), loaded.next))
    }

    /// Writes `pkg` back under the loaded pack's key, or under its first
    /// record's key for new packs. Empty packs are deleted.
    pub fn store(&mut self, pkg: &Package) -> Result<()> {
        let id = if self.last.is_valid() {
            self.last
        } else if !pkg.is_empty() {
            self.stats.packs_diff += 1;
            MergeValue::new(pkg.u64s(KEY_COL)?[0], pkg.u64s(ROW_COL)?[0])
        } else {
            return Ok(());
        };

        let buckets = self.buckets;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::Contract("merge iterator has no open transaction".into()))?;
        let keys = [
            PackKey::new(id.key, id.row_id, KEY_COLUMN),
            PackKey::new(id.key, id.row_id, ROWID_COLUMN),
        ];
        let stats_key = PackKey::first(id.key, id.row_id).encode();

        if pkg.is_empty() {
            for k in &keys {
                tx.delete(&buckets.data, &k.encode())?;
            }
            tx.delete(&buckets.stats, &stats_key)?;
            self.pending_bytes += 1;
            self.stats.bytes_diff -= self.last_size as i64;
            self.stats.packs_diff -= 1;
            debug!(key = id.key, row_id = id.row_id, "Deleted empty pack");
        } else {
            let mut n = 0;
            for (col, k) in keys.iter().enumerate() {
                let buf = pkg.block(col)?.encode()?;
                n += buf.len();
                tx.put(&buckets.data, &k.encode(), buf)?;
            }
            let stats = PackStats::from_columns(pkg.u64s(KEY_COL)?, pkg.u64s(ROW_COL)?, n);
            tx.put(&buckets.stats, &stats_key, stats.encode()?)?;
            self.pending_bytes += n;
            self.stats.bytes_written += n;
            self.stats.bytes_diff += n as i64 - self.last_size as i64;
        }

        if let Some(cache) = self.cache {
            for k in keys {
                cache.remove(k);
            }
        }

        self.last = MergeValue::invalid();
        self.last_size = 0;
        self.stats.packs_stored += 1;
        Ok(())
    }

    /// Stores the lower half of a full pack and returns the upper half to
    /// continue filling. Both halves are non-empty.
    pub fn split_and_store(&mut self, mut pkg: Package) -> Result<Package> {
        let mid = pkg.len() / 2;
        let upper = pkg.split_off(mid);
        self.store(&pkg)?;
        self.stats.packs_split += 1;
        Ok(upper)
    }

    /// The starting state with every counter change made so far applied.
    fn pending_state(&self) -> IndexState {
        let s = &self.stats;
        let mut next = self.base;
        next.apply(s.inserted as i64 - s.deleted as i64, s.bytes_diff, s.packs_diff);
        next
    }

    /// Index state persisted by the last successful commit.
    pub fn committed_state(&self) -> IndexState {
        self.committed
    }

    /// Writes the counters of all work done so far in the current
    /// transaction and returns them. They only hold once the transaction
    /// is committed by [`complete`](Self::complete).
    pub fn update_index_state(&mut self) -> Result<IndexState> {
        let next = self.pending_state();
        if next == self.committed {
            return Ok(next);
        }
        let buckets = self.buckets;
        let tx = self.tx.as_mut().ok_or_else(|| {
            Error::Contract("merge iterator has no open transaction".into())
        })?;
        tx.put(&buckets.state, STATE_KEY, next.encode()?)?;
        Ok(next)
    }

    /// Commits the open transaction and returns the merge counters.
    pub fn complete(mut self) -> Result<MergeStats> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        Ok(self.stats)
    }

    /// Writes the final counters and commits. Returns the merge counters
    /// and the new index state.
    pub fn finish(mut self) -> Result<(MergeStats, IndexState)> {
        let state = self.update_index_state()?;
        let stats = self.complete()?;
        Ok((stats, state))
    }

    #[cfg(test)]
    pub(crate) fn has_tx(&self) -> bool {
        self.tx.is_some()
    }
}

impl<D: Db> Index<D> {
    /// Upper bound of merge loop iterations before the circuit breaker trips.
    fn loop_bound(&self, buffered: usize) -> usize {
        let npacks = self.state.npacks as usize;
        let maxloop = 2 * npacks + 2 * buffered / self.opts.pack_size + 2;
        maxloop * self.opts.max_loop_factor
    }

    fn check_loops(&self, loops: usize, max: usize) -> Result<()> {
        if loops > max {
            error!(
                index = %self.name(),
                loops,
                max,
                "Merge loop bound exceeded"
            );
            return Err(Error::MergeLoop {
                index: self.name().to_string(),
                loops,
                max,
            });
        }
        if loops == max / 2 + 1 {
            warn!(index = %self.name(), loops, max, "Merge loop count unusually high");
        }
        Ok(())
    }

    /// Merges the sorted journal into the on-disk packs.
    pub(crate) fn merge_append(&mut self, ctx: &Context) -> Result<MergeStats> {
        if self.journal.is_empty() {
            return Ok(MergeStats::default());
        }
        let started = SystemTime::now();
        let timer = Instant::now();
        let repeated = self.journal.sort();
        let jlen = self.journal.len();

        let mut it = MergeIterator::new(
            &self.db,
            &self.buckets,
            &self.opts,
            self.cache.as_ref(),
            self.state,
        );
        it.stats.duplicates += repeated;
        let merged = self.append_journal(ctx, &mut it);
        let committed = it.committed_state();
        let stats = match merged.and_then(|()| it.finish()) {
            Ok((stats, state)) => {
                self.state = state;
                stats
            }
            Err(err) => {
                // the journal is kept, a retry skips what already committed
                self.state = committed;
                if err.is_transient() {
                    warn!(index = %self.name(), error = %err, journal = jlen, "Journal merge failed, keeping buffer for retry");
                }
                return Err(err);
            }
        };
        self.journal.clear();
        self.metrics.record_merge(&stats, started, timer.elapsed());
        self.metrics.total_size = self.state.size;

        if stats.duplicates > 0 {
            warn!(index = %self.name(), duplicates = stats.duplicates, "Skipped duplicate journal entries");
        }
        info!(
            index = %self.name(),
            packs = stats.packs_stored,
            split = stats.packs_split,
            inserted = stats.inserted,
            journal = jlen,
            bytes = stats.bytes_written,
            elapsed = ?timer.elapsed(),
            "Merged journal"
        );
        Ok(stats)
    }

    fn append_journal(&self, ctx: &Context, it: &mut MergeIterator<'_, D>) -> Result<()> {
        let jlen = self.journal.len();
        let max_loops = self.loop_bound(jlen);
        let pack_size = self.opts.pack_size;
        let keys = self.journal.keys();
        let rows = self.journal.rows();
        let mut jpos = 0;
        let mut loops = 0;

        while jpos < jlen {
            ctx.err()?;
            loops += 1;
            self.check_loops(loops, max_loops)?;

            let search = MergeValue::new(keys[jpos], rows[jpos]);
            let (src, next) = it.next(search)?;
            let (skeys, srows) = match &src {
                Some(p) => (p.u64s(KEY_COL)?, p.u64s(ROW_COL)?),
                None => (&[][..], &[][..]),
            };
            let slen = skeys.len();
            let mut spos = 0;
            let mut out = new_pack(pack_size);
            let mut changed = false;

            // journal entries at or beyond the next pack's key belong there
            let journal_at = |pos: usize| {
                let v = value_at(keys, rows, pos);
                if v.less(&next) {
                    v
                } else {
                    MergeValue::invalid()
                }
            };

            loop {
                let jval = journal_at(jpos);
                let sval = value_at(skeys, srows, spos);
                if !jval.is_valid() && !sval.is_valid() {
                    break;
                }

                if jval.equal(&sval) {
                    // left behind by an earlier, interrupted merge
                    jpos += 1;
                    it.stats.duplicates += 1;
                    continue;
                }

                if sval.less(&jval) {
                    out.push_u64s(&[sval.key, sval.row_id])?;
                    spos += 1;
                } else {
                    out.push_u64s(&[jval.key, jval.row_id])?;
                    jpos += 1;
                    it.stats.inserted += 1;
                    changed = true;
                }

                if out.is_full() && (spos < slen || journal_at(jpos).is_valid()) {
                    if spos < slen {
                        out = it.split_and_store(out)?;
                    } else {
                        // appending past the source: keep full packs
                        it.store(&out)?;
                        out = new_pack(pack_size);
                    }
                    changed = true;
                }
            }

            if changed && !out.is_empty() {
                it.store(&out)?;
            }
        }
        Ok(())
    }

    /// Writes the sorted tomb buffer to the tomb bucket in its own
    /// transaction so deletions survive a failed merge.
    pub(crate) fn persist_tomb(&self) -> Result<()> {
        let mut tx = self.db.begin(true)?;
        let (keys, rows, epochs) = (self.tomb.keys(), self.tomb.rows(), self.tomb.epochs());
        for i in 0..keys.len() {
            let key = TombKey {
                epoch: epochs[i],
                key: keys[i],
                row_id: rows[i],
            };
            tx.put(&self.buckets.tomb, &key.encode(), Vec::new())?;
        }
        tx.commit()
    }

    /// Removes tombstoned entries from the on-disk packs.
    pub(crate) fn merge_tomb(&mut self, ctx: &Context) -> Result<MergeStats> {
        if self.tomb.is_empty() {
            return Ok(MergeStats::default());
        }
        let started = SystemTime::now();
        let timer = Instant::now();
        self.tomb.sort();
        self.persist_tomb()?;
        let tlen = self.tomb.len();

        let mut it = MergeIterator::new(
            &self.db,
            &self.buckets,
            &self.opts,
            self.cache.as_ref(),
            self.state,
        );
        let merged = self.remove_tombstones(ctx, &mut it);
        let committed = it.committed_state();
        let stats = match merged.and_then(|()| it.finish()) {
            Ok((stats, state)) => {
                self.state = state;
                stats
            }
            Err(err) => {
                self.state = committed;
                if err.is_transient() {
                    warn!(index = %self.name(), error = %err, tomb = tlen, "Tomb merge failed, keeping buffer for retry");
                }
                return Err(err);
            }
        };
        self.tomb.clear();
        self.metrics.record_merge(&stats, started, timer.elapsed());
        self.metrics.total_size = self.state.size;

        if stats.stray > 0 {
            warn!(index = %self.name(), stray = stats.stray, "Skipped tombstones without matching entries");
        }
        info!(
            index = %self.name(),
            packs = stats.packs_stored,
            deleted = stats.deleted,
            tomb = tlen,
            bytes = stats.bytes_written,
            elapsed = ?timer.elapsed(),
            "Merged tombstones"
        );
        Ok(stats)
    }

    fn remove_tombstones(&self, ctx: &Context, it: &mut MergeIterator<'_, D>) -> Result<()> {
        let tlen = self.tomb.len();
        let max_loops = self.loop_bound(tlen);
        let pack_size = self.opts.pack_size;
        let keys = self.tomb.keys();
        let rows = self.tomb.rows();
        let mut tpos = 0;
        let mut loops = 0;

        while tpos < tlen {
            ctx.err()?;
            loops += 1;
            self.check_loops(loops, max_loops)?;

            let search = MergeValue::new(keys[tpos], rows[tpos]);
            let (src, next) = it.next(search)?;

            if let Some(src) = src {
                let skeys = src.u64s(KEY_COL)?;
                let srows = src.u64s(ROW_COL)?;
                let mut out = new_pack(pack_size);
                let mut deleted = 0;

                for spos in 0..skeys.len() {
                    let sval = MergeValue::new(skeys[spos], srows[spos]);
                    // tombstones between source entries match nothing
                    while tpos < tlen && value_at(keys, rows, tpos).less(&sval) {
                        it.stats.stray += 1;
                        tpos += 1;
                    }
                    if value_at(keys, rows, tpos).equal(&sval) {
                        tpos += 1;
                        deleted += 1;
                        continue;
                    }
                    out.push_u64s(&[sval.key, sval.row_id])?;
                }

                if deleted > 0 {
                    it.stats.deleted += deleted;
                    it.store(&out)?;
                }
            }

            // whatever is left below the next pack has no match
            while tpos < tlen && value_at(keys, rows, tpos).less(&next) {
                it.stats.stray += 1;
                tpos += 1;
            }
        }
        Ok(())
    }
}
