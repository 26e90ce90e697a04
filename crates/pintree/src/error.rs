//! error types for pintree

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid tree shape: {0}")]
    InvalidShape(String),

    #[error("invalid label {0}")]
    InvalidLabel(u64),

    #[error("record file for label {0} is corrupt")]
    CorruptRecord(u64),

    #[error("hash cache file is corrupt or stale")]
    CorruptCache,
}
