//! Error types for stream operations.

use crate::StreamPos;
use std::io;
use thiserror::Error;

/// Errors surfaced by stream operations.
///
/// Reservation failures (`ReserveWouldBlock`, queue full) are normally
/// recovered inside [`Stream::write`](crate::Stream::write) by retrying;
/// they only appear here so callbacks and collaborators can name them.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A single reservation may not exceed a tenth of the buffer capacity.
    #[error("reservation of {amount} bytes exceeds limit of {limit} bytes")]
    ReserveTooLarge { amount: usize, limit: usize },

    /// A reader pin overlaps the range the append pointer must cross.
    #[error("append range is blocked by a reader pin")]
    ReserveWouldBlock,

    /// The requested range extends past the committed boundary.
    #[error("bytes at position {pos} (+{amount}) are not committed yet")]
    ReadNotCommitted { pos: StreamPos, amount: usize },

    /// The buffer reported no readable ranges for an in-range position.
    #[error("no readable range in buffer")]
    ReadNoReadableRange,

    /// The buffer refused to pin the page backing the read.
    #[error("failed to pin buffer page for reading")]
    ReadPinFailed,

    /// The backing stream file failed or is missing.
    #[error("stream file read failed")]
    FileRead(#[source] io::Error),

    /// The stream was stopped while the operation was blocked.
    #[error("stream is stopped")]
    Stopped,

    /// The writer callback reported an error; the reservation was still
    /// committed with zero written bytes.
    #[error("writer callback failed")]
    Writer(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The reader callback reported an error.
    #[error("reader callback failed")]
    Reader(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StreamError {
    /// Wraps an arbitrary error as a writer-callback failure.
    pub fn writer<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Writer(Box::new(err))
    }

    /// Wraps an arbitrary error as a reader-callback failure.
    pub fn reader<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Reader(Box::new(err))
    }

    /// Returns `true` if the stream is permanently unusable.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}
