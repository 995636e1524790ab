use std::ops::Range;

use crate::DEFAULT_CHUNK_SIZE;

/// One fixed-size slice of a file, read for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based chunk index.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk bytes.
    pub data: Vec<u8>,
}

/// Chunk geometry of a file: how a byte length splits into indices.
///
/// A zero-byte file still has one (empty) chunk, so every upload sends at
/// least one chunk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    /// Plans `size` bytes in chunks of `chunk_size`.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(size: u64, chunk_size: u64) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let total = size.div_ceil(chunk_size).max(1);
        Self {
            size,
            chunk_size,
            total_chunks: u32::try_from(total).unwrap_or(u32::MAX),
        }
    }

    /// Total file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Nominal chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks, `ceil(size / chunk_size)` (at least 1).
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// All chunk indices.
    pub fn indices(&self) -> Range<u32> {
        0..self.total_chunks
    }

    /// Byte offset of chunk `index`.
    pub fn offset(&self, index: u32) -> u64 {
        (index as u64 * self.chunk_size).min(self.size)
    }

    /// Length in bytes of chunk `index`; the last chunk may be short.
    pub fn len(&self, index: u32) -> u64 {
        if index >= self.total_chunks {
            return 0;
        }
        let start = self.offset(index);
        (start + self.chunk_size).min(self.size) - start
    }

    /// Sum of the lengths of the given chunks.
    pub fn bytes_for(&self, indices: impl IntoIterator<Item = u32>) -> u64 {
        indices.into_iter().map(|i| self.len(i)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_splits_with_short_tail() {
        let plan = ChunkPlan::new(10, 4);
        assert_eq!(plan.total_chunks(), 3);
        assert_eq!(plan.offset(0), 0);
        assert_eq!(plan.offset(2), 8);
        assert_eq!(plan.len(0), 4);
        assert_eq!(plan.len(1), 4);
        assert_eq!(plan.len(2), 2);
        assert_eq!(plan.len(3), 0);
    }

    #[test]
    fn plan_exact_multiple() {
        let plan = ChunkPlan::new(12, 4);
        assert_eq!(plan.total_chunks(), 3);
        assert_eq!(plan.len(2), 4);
        assert_eq!(plan.bytes_for(plan.indices()), 12);
    }

    #[test]
    fn plan_empty_file_has_one_chunk() {
        let plan = ChunkPlan::new(0, 4);
        assert_eq!(plan.total_chunks(), 1);
        assert_eq!(plan.len(0), 0);
    }

    #[test]
    fn plan_zero_chunk_size_uses_default() {
        let plan = ChunkPlan::new(DEFAULT_CHUNK_SIZE * 2 + 1, 0);
        assert_eq!(plan.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(plan.total_chunks(), 3);
    }

    #[test]
    fn bytes_for_subset() {
        let plan = ChunkPlan::new(10, 4);
        assert_eq!(plan.bytes_for([1, 2]), 6);
    }
}
