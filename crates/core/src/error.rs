//! The error surface of the engine.
//!
//! One enum, one `kind()` taxonomy. Component errors from the log layer
//! convert in via `From`; I/O errors always carry the operation and path
//! they happened on.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use logd_dlog::error::{DlogError, StaleGeneration};
use logd_value::{DecodeError, PathParseError};

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification, stable across message changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Timeout,
    StaleGeneration,
    Corruption,
    Io,
    MigrationInProgress,
    NoMigrationInProgress,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::StaleGeneration => "stale-generation",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Io => "io",
            ErrorKind::MigrationInProgress => "migration-in-progress",
            ErrorKind::NoMigrationInProgress => "no-migration-in-progress",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transaction {tx_id} timed out waiting for participants")]
    Timeout { tx_id: u64 },
    #[error(transparent)]
    Stale(#[from] StaleGeneration),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("i/o failure during {op} on {path}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("schema migration already in progress")]
    MigrationInProgress,
    #[error("no schema migration in progress")]
    NoMigrationInProgress,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Stale(_) => ErrorKind::StaleGeneration,
            Error::Corruption(_) => ErrorKind::Corruption,
            Error::Io { .. } => ErrorKind::Io,
            Error::MigrationInProgress => ErrorKind::MigrationInProgress,
            Error::NoMigrationInProgress => ErrorKind::NoMigrationInProgress,
        }
    }

    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn corruption(msg: impl fmt::Display) -> Self {
        Error::Corruption(msg.to_string())
    }
}

impl From<DlogError> for Error {
    fn from(e: DlogError) -> Self {
        match e {
            DlogError::Stale(stale) => Error::Stale(stale),
            DlogError::NoEntry { file, pos } => Error::NotFound(format!(
                "log entry at {file}@{pos} referenced by the index is missing"
            )),
            DlogError::Checksum(inner) => Error::corruption(inner),
            DlogError::Decode { pos, source } => {
                Error::Corruption(format!("undecodable entry at offset {pos}: {source}"))
            }
            DlogError::Io { op, path, source } => Error::Io { op, path, source },
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::corruption(e)
    }
}

impl From<PathParseError> for Error {
    fn from(e: PathParseError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

/// The error half of a [`crate::tx::TxResult`]: cloneable, carries the
/// taxonomy tag plus a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TxError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for TxError {
    fn from(e: &Error) -> Self {
        TxError {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
