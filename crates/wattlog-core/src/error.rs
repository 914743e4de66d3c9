//! Error taxonomy shared by the pipeline stages
//!
//! None of these errors ever reach an interactive user. Each one is either
//! retried on a later cycle, turned into backpressure, or counted in
//! [`crate::diagnostics`].

use thiserror_no_std::Error;

/// A byte slice did not have the exact size of the frame it claims to be.
///
/// Frames are only ever produced by [`crate::frame`] with fixed sizes, so this
/// points at a programming error or memory corruption.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
}

/// Failure reported by a storage medium implementation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFault {
    #[error("Storage I/O error")]
    Io,
    #[error("File not found")]
    NotFound,
    #[error("No space left on medium")]
    NoSpace,
    #[error("Stored data is corrupt")]
    Corrupt,
}

/// Errors produced by the persistent backlog
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogError {
    /// The write would consume more than half of the remaining free space.
    #[error("Storage full: {requested} bytes requested, {available} bytes free")]
    StorageFull { requested: u32, available: u64 },
    #[error("Storage error: {0}")]
    Storage(StorageFault),
    /// Streaming could not allocate even the smallest read chunk.
    #[error("Allocation failed for a {chunk} byte read chunk")]
    AllocationFailure { chunk: usize },
    #[error("Frame error: {0}")]
    Frame(FrameError),
}

impl From<StorageFault> for BacklogError {
    fn from(fault: StorageFault) -> Self {
        Self::Storage(fault)
    }
}

impl From<FrameError> for BacklogError {
    fn from(err: FrameError) -> Self {
        Self::Frame(err)
    }
}

/// Transient network failures. Every variant clears the verified server
/// address and forces rediscovery on the next reconnection attempt.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("Connection refused")]
    Refused,
    #[error("Connection reset")]
    Reset,
    #[error("Host unreachable")]
    Unreachable,
    #[error("Request timed out")]
    Timeout,
    #[error("Connection closed by peer")]
    Closed,
    #[error("Malformed HTTP response")]
    MalformedResponse,
}

/// Outcome of a failed upload attempt
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    #[error("Transport error: {0}")]
    Transport(TransportError),
    /// The collector answered, but not with a 2xx status.
    #[error("Collector rejected upload with status {status}")]
    Rejected { status: u16 },
    /// Reading the backlog failed while the body was being streamed.
    #[error("Backlog error during upload: {0}")]
    Backlog(BacklogError),
}

impl UploadError {
    /// Whether this failure means the link to the collector is gone.
    pub const fn is_link_lost(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<TransportError> for UploadError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<BacklogError> for UploadError {
    fn from(err: BacklogError) -> Self {
        Self::Backlog(err)
    }
}

/// Errors decoding persisted settings
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Settings could not be decoded")]
    Decode,
    #[error("Settings version {found} does not match expected version {expected}")]
    VersionMismatch { found: u16, expected: u16 },
}
