//! In-memory buffers of pending inserts (journal) and deletes (tomb).

use itertools::Itertools as _;

use crate::error::Result;
use crate::pack::Package;

use super::{KEY_COL, ROW_COL};

/// Sorts parallel columns by (key, row id), carrying `extra` along, and
/// drops exact duplicates. Returns the number of duplicates dropped.
fn co_sort(keys: &mut Vec<u64>, rows: &mut Vec<u64>, extra: Option<&mut Vec<u64>>) -> usize {
    let n = keys.len();
    let order = (0..n)
        .sorted_unstable_by_key(|&i| (keys[i], rows[i], i))
        .dedup_by(|&a, &b| keys[a] == keys[b] && rows[a] == rows[b])
        .collect_vec();
    if order.len() == n && order.iter().enumerate().all(|(pos, &i)| pos == i) {
        return 0;
    }
    let permute = |col: &Vec<u64>| order.iter().map(|&i| col[i]).collect_vec();
    *keys = permute(keys);
    *rows = permute(rows);
    if let Some(extra) = extra {
        *extra = permute(extra);
    }
    n - order.len()
}

/// Pending index insertions.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    keys: Vec<u64>,
    rows: Vec<u64>,
    capacity: usize,
    sorted: bool,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            rows: Vec::with_capacity(capacity),
            capacity,
            sorted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, key: u64, row_id: u64) {
        self.keys.push(key);
        self.rows.push(row_id);
        self.sorted = false;
    }

    /// Appends every entry of a converted index page.
    pub fn append_page(&mut self, page: &Package) -> Result<()> {
        let keys = page.u64s(KEY_COL)?;
        let rows = page.u64s(ROW_COL)?;
        self.keys.extend_from_slice(keys);
        self.rows.extend_from_slice(rows);
        self.sorted = self.sorted && keys.is_empty();
        Ok(())
    }

    /// Sorts by (key, row id) and drops exact duplicates, returning how
    /// many were dropped.
    pub fn sort(&mut self) -> usize {
        if self.sorted {
            return 0;
        }
        self.sorted = true;
        co_sort(&mut self.keys, &mut self.rows, None)
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn rows(&self) -> &[u64] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.rows.clear();
        self.sorted = true;
    }
}

/// Pending index deletions, each tagged with the epoch it was recorded in.
#[derive(Debug, Clone, Default)]
pub struct Tomb {
    entries: Journal,
    epochs: Vec<u64>,
}

impl Tomb {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Journal::new(capacity),
            epochs: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    pub fn push(&mut self, key: u64, row_id: u64, epoch: u64) {
        self.entries.push(key, row_id);
        self.epochs.push(epoch);
    }

    pub fn append_page(&mut self, page: &Package, epoch: u64) -> Result<()> {
        let n = page.len();
        self.entries.append_page(page)?;
        self.epochs.extend(std::iter::repeat(epoch).take(n));
        Ok(())
    }

    /// Sorts by (key, row id), keeping the first recorded duplicate.
    pub fn sort(&mut self) -> usize {
        if self.entries.sorted {
            return 0;
        }
        self.entries.sorted = true;
        co_sort(
            &mut self.entries.keys,
            &mut self.entries.rows,
            Some(&mut self.epochs),
        )
    }

    pub fn keys(&self) -> &[u64] {
        self.entries.keys()
    }

    pub fn rows(&self) -> &[u64] {
        self.entries.rows()
    }

    pub fn epochs(&self) -> &[u64] {
        &self.epochs
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.epochs.clear();
    }
}
