// Copyright 2025 OPPO.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use marlin_common::io::ByteQueue;
use marlin_common::state::{CHECKSUM_BLOCKS_PER_CHUNK, CHECKSUM_BLOCK_SIZE, CHUNK_SIZE};
use tokio::time::Instant;

const BITMAP_WORDS: usize = CHECKSUM_BLOCKS_PER_CHUNK / 64;

/// One bit per checksum block of a chunk. A set bit means some write covering
/// that block is either in flight or has claimed the block while waiting to
/// be dispatched.
#[derive(Debug)]
pub(crate) struct BlockBitmap {
    words: [u64; BITMAP_WORDS],
}

impl BlockBitmap {
    pub fn new() -> Self {
        Self {
            words: [0; BITMAP_WORDS],
        }
    }

    pub fn test(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1u64 << (bit % 64);
    }

    pub fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1u64 << (bit % 64));
    }

    pub fn clear_range(&mut self, begin: usize, end: usize) {
        for bit in begin..end {
            self.clear(bit);
        }
    }

    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// One write RPC worth of data. `begin_block` doubles as the claim cursor:
/// while the op waits for a conflicting in-flight block it keeps the blocks
/// it already claimed and resumes claiming from `begin_block`, exactly
/// matching the bitmap state. `init_block_range` recomputes the full range
/// from the offset and current length.
#[derive(Debug)]
pub(crate) struct WriteOp {
    pub op_id: u64,
    /// Chunk relative byte offset.
    pub offset: i64,
    pub buffer: ByteQueue,
    pub begin_block: usize,
    pub end_block: usize,
    pub checksum: Option<u32>,
    pub checksums: Vec<u32>,
    pub checksum_valid: bool,
    pub op_start_time: Instant,
}

impl WriteOp {
    pub fn new(op_id: u64, offset: i64) -> Self {
        debug_assert!((0..CHUNK_SIZE).contains(&offset));
        Self {
            op_id,
            offset,
            buffer: ByteQueue::new(),
            begin_block: 0,
            end_block: 0,
            checksum: None,
            checksums: Vec::new(),
            checksum_valid: false,
            op_start_time: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.bytes_available()
    }

    pub fn init_block_range(&mut self) {
        debug_assert!(self.offset >= 0 && self.offset + self.len() as i64 <= CHUNK_SIZE);
        self.begin_block = (self.offset / CHECKSUM_BLOCK_SIZE) as usize;
        self.end_block = self.begin_block
            + (self.len() as i64 + CHECKSUM_BLOCK_SIZE - 1).div_euclid(CHECKSUM_BLOCK_SIZE)
                as usize;
    }

    pub fn invalidate_checksums(&mut self) {
        self.checksum = None;
        self.checksums.clear();
        self.checksum_valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_covers_partial_blocks() {
        let mut op = WriteOp::new(1, CHECKSUM_BLOCK_SIZE + 100);
        op.buffer.append_slice(&vec![0u8; CHECKSUM_BLOCK_SIZE as usize]);
        op.init_block_range();
        assert_eq!(op.begin_block, 1);
        assert_eq!(op.end_block, 3);
    }

    #[test]
    fn bitmap_set_clear() {
        let mut bits = BlockBitmap::new();
        assert!(bits.is_clear());
        bits.set(0);
        bits.set(63);
        bits.set(64);
        bits.set(CHECKSUM_BLOCKS_PER_CHUNK - 1);
        assert!(bits.test(0) && bits.test(63) && bits.test(64));
        bits.clear_range(0, 65);
        assert!(!bits.test(64));
        assert!(bits.test(CHECKSUM_BLOCKS_PER_CHUNK - 1));
        bits.clear(CHECKSUM_BLOCKS_PER_CHUNK - 1);
        assert!(bits.is_clear());
    }
}
