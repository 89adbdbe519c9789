use std::time::{Duration, SystemTime};

/// Counters collected by a single merge and folded into [`IndexMetrics`]
/// once it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub deleted: usize,
    /// Journal entries already present on disk, or repeated in the journal.
    pub duplicates: usize,
    /// Tombstones without a matching entry.
    pub stray: usize,
    pub packs_loaded: usize,
    pub packs_stored: usize,
    pub packs_split: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
    /// Intermediate commits caused by transaction batching.
    pub commits: usize,
    /// Change in total stored size.
    pub bytes_diff: i64,
    /// Change in pack count.
    pub packs_diff: i64,
}

/// Running totals for one index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMetrics {
    pub merge_calls: u64,
    pub inserted_tuples: u64,
    pub deleted_tuples: u64,
    pub duplicate_tuples: u64,
    pub stray_tombstones: u64,
    pub packs_loaded: u64,
    pub packs_stored: u64,
    pub packs_split: u64,
    pub blocks_loaded: u64,
    pub blocks_stored: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub queried_tuples: u64,
    pub query_calls: u64,
    pub gc_tombstones: u64,
    pub total_size: u64,
    pub last_merge_time: Option<SystemTime>,
    pub last_merge_duration: Duration,
}

impl IndexMetrics {
    pub fn record_merge(&mut self, stats: &MergeStats, started: SystemTime, elapsed: Duration) {
        self.merge_calls += 1;
        self.inserted_tuples += stats.inserted as u64;
        self.deleted_tuples += stats.deleted as u64;
        self.duplicate_tuples += stats.duplicates as u64;
        self.stray_tombstones += stats.stray as u64;
        self.packs_loaded += stats.packs_loaded as u64;
        self.packs_stored += stats.packs_stored as u64;
        self.packs_split += stats.packs_split as u64;
        self.blocks_loaded += 2 * stats.packs_loaded as u64;
        self.blocks_stored += 2 * stats.packs_stored as u64;
        self.bytes_read += stats.bytes_read as u64;
        self.bytes_written += stats.bytes_written as u64;
        self.last_merge_time = Some(started);
        self.last_merge_duration = elapsed;
    }

    pub fn record_query(&mut self, tuples: u64) {
        self.query_calls += 1;
        self.queried_tuples += tuples;
    }

    /// Logs the current totals as one structured event.
    pub fn log(&self, index: &str) {
        tracing::info!(
            index = index,
            merge_calls = self.merge_calls,
            inserted = self.inserted_tuples,
            deleted = self.deleted_tuples,
            duplicates = self.duplicate_tuples,
            stray = self.stray_tombstones,
            packs_loaded = self.packs_loaded,
            packs_stored = self.packs_stored,
            packs_split = self.packs_split,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            queries = self.query_calls,
            queried = self.queried_tuples,
            gc_tombstones = self.gc_tombstones,
            total_size = self.total_size,
            last_merge_ms = self.last_merge_duration.as_millis() as u64,
            "Index metrics"
        );
    }
}
