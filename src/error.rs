use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("bucket {0} not found")]
    NoBucket(String),

    #[error("bucket {0} already exists")]
    BucketExists(String),

    #[error("database corrupt: {0}")]
    DatabaseCorrupt(String),

    #[error("transaction is read-only")]
    TxNotWritable,

    #[error("transaction is closed")]
    TxClosed,

    #[error("transaction conflict: a concurrent writer committed first")]
    TxConflict,

    #[error("index {0} already exists")]
    IndexExists(String),

    #[error("index {0} does not exist")]
    NoIndex(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("internal contract violation: {0}")]
    Contract(String),

    #[error("index {index}: merge loop exceeded {loops} iterations (bound {max}), index likely corrupted")]
    MergeLoop {
        index: String,
        loops: usize,
        max: usize,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Reports whether the error comes from the backend and the whole
    /// operation can be retried from the unmodified buffers.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::TxConflict | Error::TxClosed)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_loop_message() {
        let err = Error::MergeLoop {
            index: "idx".to_string(),
            loops: 12,
            max: 6,
        };
        assert!(err.to_string().contains("likely corrupted"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::TxConflict.is_transient());
        assert!(Error::from(io::Error::new(io::ErrorKind::Other, "disk")).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::DatabaseCorrupt("x".into()).is_transient());
    }
}
