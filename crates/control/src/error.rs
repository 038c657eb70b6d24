use std::io;
use thiserror::Error;

/// Failures while turning a protocol line into a packet, or while validating
/// a packet before it is encoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty line")]
    Empty,
    #[error("unknown packet kind {0}")]
    UnknownKind(i64),
    #[error("kind {kind} expects {expected} field(s), got {got}")]
    FieldCount {
        kind: u8,
        expected: usize,
        got: usize,
    },
    #[error("field {index} is not an integer: {value:?}")]
    NotInteger { index: usize, value: String },
    #[error("{what} level {value} out of range [0, 1023]")]
    LevelOutOfRange { what: &'static str, value: i64 },
    #[error("forward flag must be 0 or 1, got {0}")]
    FlagOutOfRange(i64),
}

#[derive(Error, Debug)]
pub enum LinkError {
    /// Outbound input failed validation; nothing was written.
    #[error("rejected: {0}")]
    Rejected(#[from] CodecError),
    #[error("link is not open")]
    NotOpen,
    #[error("failed to open transport: {0}")]
    Connect(#[source] io::Error),
    /// The transport refused a write. Not retried.
    #[error("transport write failed: {0}")]
    Write(#[source] io::Error),
    /// The background reader exited on an unrecoverable transport failure and
    /// every packet it queued has been drained.
    #[error("reader stopped: {0}")]
    ReaderStopped(String),
}
