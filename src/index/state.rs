use serde::{Deserialize, Serialize};

/// Key of the [`IndexState`] record in the state bucket.
pub const STATE_KEY: &[u8] = b"state";

/// Persisted index counters, updated in the same transaction that
/// finishes a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Number of live index entries.
    pub nrows: u64,
    /// Total encoded size of all packs in bytes.
    pub size: u64,
    /// Number of stored packs.
    pub npacks: u64,
    /// Last epoch fully merged into the packs.
    pub epoch: u64,
}

impl IndexState {
    /// Applies signed deltas, clamping at zero.
    pub fn apply(&mut self, rows: i64, size: i64, packs: i64) {
        self.nrows = self.nrows.saturating_add_signed(rows);
        self.size = self.size.saturating_add_signed(size);
        self.npacks = self.npacks.saturating_add_signed(packs);
    }
}

/// Statistics of one stored pack, kept in the stats bucket under the
/// pack's first key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackStats {
    pub n_values: u64,
    pub min_key: u64,
    pub max_key: u64,
    pub min_row: u64,
    pub max_row: u64,
    /// Encoded size of both column blocks.
    pub stored_size: u64,
}

impl PackStats {
    /// Computes statistics over sorted keys and their row ids.
    pub fn from_columns(keys: &[u64], rows: &[u64], stored_size: usize) -> Self {
        let (min_key, max_key) = match (keys.first(), keys.last()) {
            (Some(a), Some(b)) => (*a, *b),
            _ => (0, 0),
        };
        Self {
            n_values: keys.len() as u64,
            min_key,
            max_key,
            min_row: rows.iter().copied().min().unwrap_or(0),
            max_row: rows.iter().copied().max().unwrap_or(0),
            stored_size: stored_size as u64,
        }
    }
}
