use crate::error::{Error, Result};

/// Tuning knobs for a single secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
    /// Maximum number of entries per on-disk pack (default: 65536)
    pub pack_size: usize,

    /// Capacity of the journal and tomb buffers (default: 131072)
    pub journal_size: usize,

    /// Pending bytes after which a merge commits and reopens its
    /// transaction (default: 1MB)
    pub tx_max_size: usize,

    /// Number of column blocks kept in the block cache (default: 256)
    pub cache_size: usize,

    /// Serve lookups and scans through the block cache (default: true)
    pub use_cache: bool,

    /// Multiplier applied to the expected merge loop count before the
    /// circuit breaker trips (default: 2)
    pub max_loop_factor: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            pack_size: 1 << 16,
            journal_size: 1 << 17,
            tx_max_size: 1 << 20, // 1MB
            cache_size: 256,
            use_cache: true,
            max_loop_factor: 2,
        }
    }
}

impl IndexOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pack capacity
    pub fn pack_size(mut self, size: usize) -> Self {
        self.pack_size = size;
        self
    }

    /// Set the journal and tomb capacity
    pub fn journal_size(mut self, size: usize) -> Self {
        self.journal_size = size;
        self
    }

    /// Set the transaction batching threshold
    pub fn tx_max_size(mut self, size: usize) -> Self {
        self.tx_max_size = size;
        self
    }

    /// Set the number of cached blocks
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Enable or disable the block cache
    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Set the circuit breaker multiplier
    pub fn max_loop_factor(mut self, factor: usize) -> Self {
        self.max_loop_factor = factor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pack_size < 2 {
            return Err(Error::InvalidValue(format!(
                "pack size {} must be at least 2",
                self.pack_size
            )));
        }
        if self.journal_size == 0 {
            return Err(Error::InvalidValue("journal size must be positive".into()));
        }
        if self.tx_max_size == 0 {
            return Err(Error::InvalidValue("tx max size must be positive".into()));
        }
        if self.max_loop_factor == 0 {
            return Err(Error::InvalidValue("max loop factor must be positive".into()));
        }
        Ok(())
    }
}
