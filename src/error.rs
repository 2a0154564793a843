//! Error types.
//!
//! Each module gets its own `thiserror`-derived error enum. Wire-level
//! failures additionally collapse to `ErrorCode`, the small `Copy` enum
//! that rides over the network in an `Error` message — never the internal
//! `thiserror` types, which may carry data not safe or meaningful to expose
//! to a remote peer.

use thiserror::Error;

/// Error codes carried on the wire in an `Error` message.
///
/// `UnknownMsg` and `FileNotFound` are never actually sent — the dispatcher
/// suppresses replies for both, since an unrecognized broadcast type and a
/// missing file are both routine, high-frequency conditions that don't
/// deserve a reply on every occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    UnknownMsg = 1,
    ProtocolError = 2,
    AllocFail = 3,
    KeyNotFound = 4,
    InvalidType = 5,
    ReadOnly = 6,
    FilesystemBusy = 7,
    FileNotFound = 8,
    InvalidFileSession = 9,
    LinkEof = 10,
}

use serde::{Deserialize, Serialize};

/// Errors from the typed-value codec and KV layers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("parameter is read-only")]
    ReadOnly,
    #[error("requested type is invalid for this key")]
    InvalidType,
    #[error("destination buffer too small")]
    NotEnoughSpace,
    #[error("allocation failed")]
    AllocFail,
}

impl From<KvError> for ErrorCode {
    fn from(e: KvError) -> Self {
        match e {
            KvError::NotFound => ErrorCode::KeyNotFound,
            KvError::ReadOnly => ErrorCode::ReadOnly,
            KvError::InvalidType => ErrorCode::InvalidType,
            KvError::NotEnoughSpace => ErrorCode::ProtocolError,
            KvError::AllocFail => ErrorCode::AllocFail,
        }
    }
}

/// Errors from the persistence store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header magic or version mismatch")]
    HeaderMismatch,
}

/// Errors from the link store.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link table is full")]
    Full,
    #[error("no such link record")]
    NotFound,
}

/// Errors surfaced by a protocol message handler.
///
/// A handler returns this internally; the dispatch loop's single exit point
/// converts it to an `ErrorCode` and (usually) replies with it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("link store error: {0}")]
    Link(#[from] LinkError),
    #[error("unknown message type")]
    UnknownMsg,
    #[error("allocation failed")]
    AllocFail,
    #[error("file not found")]
    FileNotFound,
    #[error("invalid or expired file session")]
    InvalidFileSession,
    #[error("filesystem busy: a file session is already open")]
    FilesystemBusy,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message")]
    Malformed,
}

impl ProtocolError {
    /// Map to the wire error code sent back to the requester.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Kv(e) => (*e).into(),
            ProtocolError::Link(_) => ErrorCode::ProtocolError,
            ProtocolError::UnknownMsg => ErrorCode::UnknownMsg,
            ProtocolError::AllocFail => ErrorCode::AllocFail,
            ProtocolError::FileNotFound => ErrorCode::FileNotFound,
            ProtocolError::InvalidFileSession => ErrorCode::InvalidFileSession,
            ProtocolError::FilesystemBusy => ErrorCode::FilesystemBusy,
            ProtocolError::Io(_) => ErrorCode::ProtocolError,
            ProtocolError::Malformed => ErrorCode::ProtocolError,
        }
    }

    /// Whether a reply should be suppressed for this error.
    ///
    /// Matches the original dispatcher: unknown-message and file-not-found
    /// are both routine enough that acking every occurrence would just
    /// generate extra broadcast traffic.
    pub fn suppressed(&self) -> bool {
        matches!(self, ProtocolError::UnknownMsg | ProtocolError::FileNotFound)
    }
}
