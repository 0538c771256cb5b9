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

mod duration_unit;

pub use duration_unit::DurationUnit;

use crate::io::ByteQueue;

/// CRC of the leading `len` bytes of `queue`, computed over fragments without
/// flattening.
pub fn queue_checksum(queue: &ByteQueue, len: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    let mut remaining = len;
    for frag in queue.fragments() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(frag.len());
        hasher.update(&frag[..take]);
        remaining -= take;
    }
    hasher.finalize()
}

/// One CRC per `block_size` run; the last block may be short.
pub fn queue_block_checksums(queue: &ByteQueue, len: usize, block_size: usize) -> Vec<u32> {
    assert!(block_size > 0);
    let len = len.min(queue.bytes_available());
    let mut out = Vec::with_capacity(len.div_ceil(block_size));
    let mut hasher = crc32fast::Hasher::new();
    let mut in_block = 0usize;
    let mut remaining = len;
    for frag in queue.fragments() {
        let mut data = &frag[..remaining.min(frag.len())];
        remaining -= data.len();
        while !data.is_empty() {
            let take = data.len().min(block_size - in_block);
            hasher.update(&data[..take]);
            data = &data[take..];
            in_block += take;
            if in_block == block_size {
                out.push(std::mem::replace(&mut hasher, crc32fast::Hasher::new()).finalize());
                in_block = 0;
            }
        }
        if remaining == 0 {
            break;
        }
    }
    if in_block > 0 {
        out.push(hasher.finalize());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_checksums_split_at_block_boundaries() {
        let mut queue = ByteQueue::with_fragment_size(4);
        queue.append_slice(b"abcdefgh");
        queue.append_slice(b"ij");

        let blocks = queue_block_checksums(&queue, 10, 4);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], crc32fast::hash(b"abcd"));
        assert_eq!(blocks[1], crc32fast::hash(b"efgh"));
        assert_eq!(blocks[2], crc32fast::hash(b"ij"));

        assert_eq!(queue_checksum(&queue, 10), crc32fast::hash(b"abcdefghij"));
    }
}
