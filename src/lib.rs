//! muxlink - multiplexed protocol forks over a single byte stream.
//!
//! This crate provides two independent coordination primitives:
//! - `mux`: a socket scheduler that shares one bidirectional byte stream
//!   between many logically-independent protocol forks, with framing, slot
//!   negotiation, cancellation, buffered moves and graceful shutdown
//! - `sequence`: a wait-free multi-producer single-consumer sequencer over
//!   a power-of-two ring, plus the single-publisher barrier it waits on
//!
//! # Example
//!
//! ```rust,ignore
//! use muxlink::{duplex, MuxSocket, SessionId};
//!
//! let root = SessionId::root("demo");
//! let (a, b) = duplex(64 * 1024);
//! let alice = MuxSocket::new(a, root);
//! let bob = MuxSocket::new(b, root);
//!
//! // Both parties derive the same fork id with no traffic.
//! let fork = alice.fork(root)?;
//! let fork_b = bob.fork(root)?;
//!
//! alice.send(fork, vec![1, 2, 3]).await?;
//! let msg = bob.recv(fork_b, vec![0; 3]).await?;
//! ```

pub mod error;
pub mod frame;
pub mod mux;
pub mod sequence;
pub mod session;
pub mod stream;

// Re-export commonly used types at crate root for convenience
pub use error::MuxError;
pub use session::SessionId;

pub use mux::MuxSocket;
pub use stream::{duplex, ByteStream, IoStream, PipeStream};

pub use sequence::{
    // Sequencing primitives
    MpscSequencer, SequenceBarrier, SequenceOrder, SequenceRange, WrappingOrder,
    // Claim/wait futures
    BarrierWait, Claim, ClaimOne, WaitPublished,
};
