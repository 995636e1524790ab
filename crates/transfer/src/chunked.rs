use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::types::{Chunk, ChunkPlan};
use crate::TransferError;

/// Read buffer for streamed hashing.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum progress step reported to the callback (1%).
const PROGRESS_STEP: f64 = 0.01;

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn digest_chunk(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes SHA-256 of an entire file, streaming it through a fixed buffer.
///
/// `progress` receives the hashed fraction in `[0.0, 1.0]`, at most once per
/// percent and always once with `1.0` at the end. When `expected_size` is
/// given, a file whose length differs (before or after reading) fails with
/// [`TransferError::SizeChanged`].
pub fn digest_file(
    path: &Path,
    expected_size: Option<u64>,
    progress: &mut dyn FnMut(f64),
) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    if let Some(expected) = expected_size
        && expected != size
    {
        return Err(TransferError::SizeChanged {
            expected,
            actual: size,
        });
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut read_total: u64 = 0;
    let mut last_reported = 0.0f64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_total += n as u64;

        if size > 0 {
            let fraction = (read_total as f64 / size as f64).min(1.0);
            if fraction - last_reported >= PROGRESS_STEP {
                progress(fraction);
                last_reported = fraction;
            }
        }
    }

    if read_total != size {
        return Err(TransferError::SizeChanged {
            expected: size,
            actual: read_total,
        });
    }

    progress(1.0);
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Chunk reads
// ---------------------------------------------------------------------------

/// Reads chunk `index` of `path` according to `plan`.
///
/// Each call opens the file and seeks, so concurrent reads of different
/// chunks never share a cursor.
pub fn read_chunk(path: &Path, plan: ChunkPlan, index: u32) -> Result<Chunk, TransferError> {
    if index >= plan.total_chunks() {
        return Err(TransferError::ChunkOutOfRange {
            index,
            total: plan.total_chunks(),
        });
    }

    let mut file = std::fs::File::open(path)?;
    let actual = file.metadata()?.len();
    if actual != plan.size() {
        return Err(TransferError::SizeChanged {
            expected: plan.size(),
            actual,
        });
    }

    let offset = plan.offset(index);
    let len = plan.len(index) as usize;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)?;

    Ok(Chunk {
        index,
        offset,
        data,
    })
}
