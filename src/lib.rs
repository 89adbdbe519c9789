pub mod cache;
pub mod config;
pub mod context;
pub mod encoding;
pub mod error;
pub mod hasher;
pub mod index;
pub mod pack;
pub mod query;
pub mod schema;
pub mod store;

pub use config::IndexOptions;
pub use context::Context;
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use index::{Index, IndexResult};
pub use store::mem::MemDb;
