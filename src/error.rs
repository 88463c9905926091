//! Error type shared by the socket scheduler and its byte streams.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by multiplexed socket operations.
///
/// The first transport failure observed on a socket is recorded and reused
/// for every operation that fails after it, so the variant wrapping
/// [`io::Error`] must be cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// The operation was cancelled before or during transfer.
    #[error("operation aborted")]
    Aborted,
    /// The socket (or this fork) was closed while the operation was pending,
    /// or the operation was submitted after close.
    #[error("socket closed")]
    Closed,
    /// The peer sent a data frame whose size disagrees with the posted
    /// receive buffer. Fatal: the socket closes.
    #[error("frame size does not match the posted receive ({frame} vs {posted} bytes)")]
    SizeMismatch { frame: usize, posted: usize },
    /// The peer sent a frame for a slot it never announced, or re-announced
    /// a slot binding. Fatal: the socket closes.
    #[error("bad message header")]
    BadHeader,
    /// A send was submitted with an empty buffer or one whose length cannot
    /// be represented in the frame header.
    #[error("message size must be between 1 and u32::MAX - 1 bytes")]
    InvalidSize,
    /// The underlying byte stream failed.
    #[error("transport error: {0}")]
    Stream(Arc<io::Error>),
}

impl MuxError {
    /// True for the cancellation outcome of either tier: an op removed from
    /// its queue before starting, or an in-progress op stopped
    /// cooperatively.
    pub fn is_aborted(&self) -> bool {
        matches!(self, MuxError::Aborted)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, MuxError::Closed)
    }
}

impl From<io::Error> for MuxError {
    fn from(e: io::Error) -> Self {
        MuxError::Stream(Arc::new(e))
    }
}
