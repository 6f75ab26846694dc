use std::io;

use thiserror::Error;

use crate::dlog::FileId;
use logd_value::DecodeError;

/// A positional read named a generation that has since been compacted
/// away. The caller re-resolves the position through the index and
/// retries.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("stale generation on log file {file}: requested {requested}, current {current}")]
pub struct StaleGeneration {
    pub file: FileId,
    pub requested: u64,
    pub current: u64,
}

/// A log entry's trailing checksum did not match its bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("entry checksum mismatch at offset {pos}")]
pub struct ChecksumMismatch {
    pub pos: u64,
}

#[derive(Debug, Error)]
pub enum DlogError {
    #[error(transparent)]
    Stale(#[from] StaleGeneration),
    #[error("log file {file} has no entry at offset {pos}")]
    NoEntry { file: FileId, pos: u64 },
    #[error(transparent)]
    Checksum(#[from] ChecksumMismatch),
    #[error("failed to decode log entry at offset {pos}")]
    Decode {
        pos: u64,
        #[source]
        source: DecodeError,
    },
    #[error("i/o failure during {op} on {path}")]
    Io {
        op: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DlogError {
    pub(crate) fn io(op: &'static str, path: impl Into<std::path::PathBuf>, source: io::Error) -> Self {
        DlogError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
