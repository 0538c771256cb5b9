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

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

const DEFAULT_FRAGMENT_SIZE: usize = 16 * 1024;

/// A fragment is either owned (appendable up to its capacity) or shared
/// (a reference-moved application buffer, never written to).
#[derive(Debug)]
enum Frag {
    Owned(BytesMut),
    Shared(Bytes),
}

impl Frag {
    fn len(&self) -> usize {
        match self {
            Frag::Owned(b) => b.len(),
            Frag::Shared(b) => b.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Frag::Owned(b) => b.as_ref(),
            Frag::Shared(b) => b.as_ref(),
        }
    }

    fn split_to(&mut self, at: usize) -> Frag {
        match self {
            Frag::Owned(b) => Frag::Owned(b.split_to(at)),
            Frag::Shared(b) => Frag::Shared(b.split_to(at)),
        }
    }
}

/// Queue of buffer fragments. Moving data between queues transfers fragments
/// without copying; copies happen only when explicitly requested
/// (`replace_keep_full`, `make_buffers_full`, `to_bytes`).
#[derive(Debug)]
pub struct ByteQueue {
    frags: VecDeque<Frag>,
    fragment_size: usize,
    len: usize,
}

impl Default for ByteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::with_fragment_size(DEFAULT_FRAGMENT_SIZE)
    }

    pub fn with_fragment_size(fragment_size: usize) -> Self {
        Self {
            frags: VecDeque::new(),
            fragment_size: fragment_size.max(1),
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut queue = Self::new();
        queue.append_slice(data);
        queue
    }

    pub fn bytes_available(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    pub fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.frags.iter().map(|f| f.as_slice())
    }

    pub fn clear(&mut self) {
        self.frags.clear();
        self.len = 0;
    }

    /// Append by copy, filling the tail fragment before allocating new ones.
    pub fn append_slice(&mut self, mut data: &[u8]) {
        self.len += data.len();
        while !data.is_empty() {
            let spare = match self.frags.back_mut() {
                Some(Frag::Owned(b)) => b.capacity() - b.len(),
                _ => 0,
            };
            if spare > 0 {
                if let Some(Frag::Owned(b)) = self.frags.back_mut() {
                    let take = spare.min(data.len());
                    b.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    continue;
                }
            }
            self.frags
                .push_back(Frag::Owned(BytesMut::with_capacity(self.fragment_size)));
        }
    }

    /// Append an application buffer by reference. The fragment may be
    /// arbitrarily sized and is never coalesced until `make_buffers_full`.
    pub fn push_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.frags.push_back(Frag::Shared(data));
    }

    /// Move up to `count` bytes from the front of `src` to the back of this
    /// queue without copying. Returns the number of bytes moved.
    pub fn move_from(&mut self, src: &mut ByteQueue, count: usize) -> usize {
        let mut moved = 0;
        while moved < count {
            let Some(front) = src.frags.front_mut() else {
                break;
            };
            let remain = count - moved;
            let frag = if front.len() <= remain {
                src.frags.pop_front().unwrap()
            } else {
                front.split_to(remain)
            };
            moved += frag.len();
            src.len -= frag.len();
            if frag.len() > 0 {
                self.frags.push_back(frag);
            }
        }
        self.len += moved;
        moved
    }

    /// Move up to `count` bytes from `src` by copy, keeping this queue's
    /// fragments full: the tail fragment is topped up before new full-size
    /// fragments are allocated. Used for small appends to avoid
    /// fragmentation.
    pub fn replace_keep_full(&mut self, src: &mut ByteQueue, count: usize) -> usize {
        let mut copied = 0;
        while copied < count {
            let Some(front) = src.frags.front_mut() else {
                break;
            };
            let take = front.len().min(count - copied);
            let data = &front.as_slice()[..take];
            self.append_slice(data);
            copied += take;
            if take == front.len() {
                src.frags.pop_front();
            } else {
                front.split_to(take);
            }
            src.len -= take;
        }
        // append_slice already accounted the copied bytes into self.len.
        copied
    }

    /// Re-pack every fragment into full-size owned fragments. Costs one copy
    /// of the queue contents; resets fragmentation introduced by
    /// reference-moved buffers.
    pub fn make_buffers_full(&mut self) {
        if self.frags.len() <= 1 {
            return;
        }
        let mut packed = ByteQueue::with_fragment_size(self.fragment_size);
        for frag in &self.frags {
            packed.append_slice(frag.as_slice());
        }
        *self = packed;
    }

    /// Flatten the queue contents into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        if self.frags.len() == 1 {
            if let Some(Frag::Shared(b)) = self.frags.front() {
                return b.clone();
            }
        }
        let mut out = BytesMut::with_capacity(self.len);
        for frag in &self.frags {
            out.extend_from_slice(frag.as_slice());
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(queue: &ByteQueue) -> Vec<u8> {
        queue.to_bytes().to_vec()
    }

    #[test]
    fn append_fills_tail_fragment() {
        let mut queue = ByteQueue::with_fragment_size(8);
        queue.append_slice(b"abc");
        queue.append_slice(b"defgh");
        assert_eq!(queue.fragment_count(), 1);
        queue.append_slice(b"i");
        assert_eq!(queue.fragment_count(), 2);
        assert_eq!(contents(&queue), b"abcdefghi");
    }

    #[test]
    fn move_from_is_zero_copy_and_splits() {
        let mut src = ByteQueue::with_fragment_size(8);
        src.push_bytes(Bytes::from_static(b"0123456789"));
        let mut dst = ByteQueue::with_fragment_size(8);

        assert_eq!(dst.move_from(&mut src, 4), 4);
        assert_eq!(contents(&dst), b"0123");
        assert_eq!(src.bytes_available(), 6);

        assert_eq!(dst.move_from(&mut src, 100), 6);
        assert_eq!(contents(&dst), b"0123456789");
        assert!(src.is_empty());
    }

    #[test]
    fn replace_keep_full_copies_into_tail() {
        let mut dst = ByteQueue::with_fragment_size(8);
        dst.append_slice(b"abc");

        let mut src = ByteQueue::with_fragment_size(8);
        src.push_bytes(Bytes::from_static(b"XYZ"));
        src.push_bytes(Bytes::from_static(b"PQ"));

        assert_eq!(dst.replace_keep_full(&mut src, 4), 4);
        assert_eq!(dst.fragment_count(), 1);
        assert_eq!(contents(&dst), b"abcXYZP");
        assert_eq!(src.bytes_available(), 1);
    }

    #[test]
    fn make_buffers_full_compacts_partial_fragments() {
        let mut queue = ByteQueue::with_fragment_size(8);
        queue.push_bytes(Bytes::from_static(b"ab"));
        queue.push_bytes(Bytes::from_static(b"cd"));
        queue.push_bytes(Bytes::from_static(b"efghij"));
        assert_eq!(queue.fragment_count(), 3);

        queue.make_buffers_full();
        assert_eq!(queue.fragment_count(), 2);
        assert_eq!(queue.bytes_available(), 10);
        assert_eq!(contents(&queue), b"abcdefghij");
    }
}
