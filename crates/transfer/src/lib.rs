//! Content hashing, chunk planning and transfer speed estimation.
//!
//! Everything here is synchronous and runtime-agnostic; callers run the
//! file-reading functions on a blocking worker.

mod chunked;
mod progress;
mod types;

pub use chunked::{digest_chunk, digest_file, read_chunk};
pub use progress::SpeedEstimator;
pub use types::{Chunk, ChunkPlan};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file size changed: expected {expected} bytes, found {actual}")]
    SizeChanged { expected: u64, actual: u64 },

    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },
}
