use std::sync::Arc;

use super::block::{Block, BlockType};
use crate::error::{Error, Result};

/// Which rows of a package a converter or writer should consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Every row.
    #[default]
    All,
    /// Only rows in the selection vector.
    IncludeSelected,
    /// Every row except those in the selection vector.
    ExcludeSelected,
}

/// A fixed-capacity set of equally long column blocks.
///
/// Blocks are shared and copied on first write, so cloning a package is
/// cheap and packages loaded from the cache never alias a writer's copy.
#[derive(Debug, Clone)]
pub struct Package {
    blocks: Vec<Arc<Block>>,
    max_rows: usize,
    /// Sorted row positions, set by callers that filter a page.
    selected: Option<Vec<u32>>,
}

impl Package {
    pub fn new(types: &[BlockType], max_rows: usize) -> Self {
        Self {
            blocks: types
                .iter()
                .map(|t| Arc::new(Block::new(*t, max_rows)))
                .collect(),
            max_rows,
            selected: None,
        }
    }

    /// Builds a package from existing blocks, which must all be the same length.
    pub fn from_blocks(blocks: Vec<Arc<Block>>, max_rows: usize) -> Result<Self> {
        if let Some(first) = blocks.first() {
            let n = first.len();
            if let Some(bad) = blocks.iter().position(|b| b.len() != n) {
                return Err(Error::Contract(format!(
                    "column {bad} has {} values, expected {n}",
                    blocks[bad].len()
                )));
            }
        }
        Ok(Self {
            blocks,
            max_rows,
            selected: None,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.first().map_or(0, |b| b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_rows
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn num_columns(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, col: usize) -> Result<&Block> {
        self.blocks
            .get(col)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::Contract(format!("no column {col}")))
    }

    pub fn block_mut(&mut self, col: usize) -> Result<&mut Block> {
        self.blocks
            .get_mut(col)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::Contract(format!("no column {col}")))
    }

    /// Returns the values of a u64 column.
    pub fn u64s(&self, col: usize) -> Result<&[u64]> {
        let block = self.block(col)?;
        block.as_u64s().ok_or_else(|| {
            Error::Contract(format!(
                "column {col} is {:?}, expected U64",
                block.block_type()
            ))
        })
    }

    /// Appends one row to a package whose columns are all u64.
    pub fn push_u64s(&mut self, row: &[u64]) -> Result<()> {
        if row.len() != self.blocks.len() {
            return Err(Error::Contract(format!(
                "row has {} values for {} columns",
                row.len(),
                self.blocks.len()
            )));
        }
        for (col, v) in row.iter().enumerate() {
            let block = self.block_mut(col)?;
            let typ = block.block_type();
            block
                .as_u64s_mut()
                .ok_or_else(|| Error::Contract(format!("column {col} is {typ:?}, expected U64")))?
                .push(*v);
        }
        Ok(())
    }

    pub fn with_selection(mut self, mut selected: Vec<u32>) -> Self {
        selected.sort_unstable();
        selected.dedup();
        self.selected = Some(selected);
        self
    }

    pub fn selection(&self) -> Option<&[u32]> {
        self.selected.as_deref()
    }

    /// Row positions consumed under `mode`. Without a selection vector the
    /// selected set is treated as every row for `IncludeSelected` and as
    /// empty for `ExcludeSelected`.
    pub fn rows(&self, mode: WriteMode) -> Vec<usize> {
        let n = self.len();
        match (mode, self.selection()) {
            (WriteMode::IncludeSelected, Some(sel)) => sel
                .iter()
                .map(|&i| i as usize)
                .filter(|&i| i < n)
                .collect(),
            (WriteMode::ExcludeSelected, Some(sel)) => (0..n)
                .filter(|&i| sel.binary_search(&(i as u32)).is_err())
                .collect(),
            _ => (0..n).collect(),
        }
    }

    /// Splits off rows `[at, len)` into a new package with the same capacity.
    pub fn split_off(&mut self, at: usize) -> Package {
        let blocks = self
            .blocks
            .iter_mut()
            .map(|b| Arc::new(Arc::make_mut(b).split_off(at)))
            .collect();
        Package {
            blocks,
            max_rows: self.max_rows,
            selected: None,
        }
    }

    pub fn delete_range(&mut self, start: usize, n: usize) {
        for b in self.blocks.iter_mut() {
            Arc::make_mut(b).delete_range(start, n);
        }
        self.selected = None;
    }

    /// Appends rows `[start, end)` of `other`, which must share the layout.
    pub fn append_range(&mut self, other: &Package, start: usize, end: usize) -> Result<()> {
        if other.num_columns() != self.num_columns() {
            return Err(Error::Contract("package layouts differ".into()));
        }
        for (col, b) in self.blocks.iter_mut().enumerate() {
            Arc::make_mut(b).append_range(other.block(col)?, start, end)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for b in self.blocks.iter_mut() {
            Arc::make_mut(b).clear();
        }
        self.selected = None;
    }
}
