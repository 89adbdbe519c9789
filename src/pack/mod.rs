//! In-memory column containers shared by tables and indexes.

pub mod block;
pub mod package;

pub use block::{Block, BlockType};
pub use package::{Package, WriteMode};
