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

use log::debug;
use marlin_common::io::ByteQueue;
use marlin_common::state::{StriperType, CHUNK_SIZE};
use marlin_common::{err_box, FsError, FsResult};
use std::cmp::{max, min};

const STRIPE_ALIGNMENT: i64 = 4096;
const MAX_STRIPE_COUNT: i32 = 64;
const MAX_RECOVERY_COUNT: i32 = 32;

/// Per-stripe transform layered above the per-chunk write path. The writer
/// feeds staged bytes through `process`; the striper re-enters the writer
/// through the sink with per-stripe sub-writes.
pub trait Striper: Send {
    fn process(
        &mut self,
        sink: &mut dyn StriperSink,
        buf: &mut ByteQueue,
        offset: &mut i64,
        write_threshold: usize,
    ) -> FsResult<()>;

    /// Logical file size for the close-time truncate; negative when unknown.
    fn file_size(&self) -> i64;

    /// Bytes consumed from the writer but not yet queued to chunk workers.
    fn pending_size(&self) -> i64 {
        0
    }

    /// Whether a failed write at `file_offset` is worth retrying. Returning
    /// false makes the writer invalidate the stripe and report its bytes as
    /// completed with the error latched.
    fn is_write_retry_needed(
        &self,
        _file_offset: i64,
        _retry_count: i32,
        _max_retry: i32,
        _status: i32,
    ) -> bool {
        true
    }
}

/// The writer-side half of the striper plug: queue one sub-write and start
/// the chunk worker it landed on.
pub trait StriperSink {
    fn queue_write(
        &mut self,
        buf: &mut ByteQueue,
        size: i64,
        offset: i64,
        write_threshold: usize,
    ) -> i64;

    fn start_queued_write(&mut self, queued: i64);
}

/// Returns the striper and its open-chunk-block size hint, or `None` for
/// plain (non-striped) files.
pub fn create_striper(
    striper_type: StriperType,
    stripe_count: i32,
    recovery_count: i32,
    stripe_size: i32,
    file_size: i64,
) -> FsResult<Option<(Box<dyn Striper>, i64)>> {
    match striper_type {
        StriperType::None => Ok(None),
        StriperType::Striped => {
            let striper =
                StripedLayout::new(stripe_count, recovery_count, stripe_size, file_size)?;
            let hint = striper.open_chunk_block_size();
            Ok(Some((Box::new(striper), hint)))
        }
    }
}

struct StripeBuf {
    queue: ByteQueue,
    /// Chunk block the next queued byte of this stripe belongs to.
    block_idx: i64,
    /// Position within that chunk.
    in_chunk: i64,
}

/// Data striping over fixed-size stripe units laid out round-robin across
/// `stripe_count` chunks per chunk block. Recovery chunks reserve address
/// space in the physical layout but carry no client writes.
pub struct StripedLayout {
    stripe_count: i64,
    recovery_count: i64,
    stripe_size: i64,
    stripes: Vec<StripeBuf>,
    /// Logical offset of the next byte to demux.
    logical_pos: i64,
    logical_size: i64,
    pending_bytes: i64,
}

impl StripedLayout {
    pub fn new(
        stripe_count: i32,
        recovery_count: i32,
        stripe_size: i32,
        file_size: i64,
    ) -> FsResult<Self> {
        if !(1..=MAX_STRIPE_COUNT).contains(&stripe_count)
            || !(0..=MAX_RECOVERY_COUNT).contains(&recovery_count)
        {
            return err_box!(
                "invalid stripe counts: {} data, {} recovery",
                stripe_count,
                recovery_count
            );
        }
        let stripe_size = stripe_size as i64;
        if stripe_size < STRIPE_ALIGNMENT
            || stripe_size > CHUNK_SIZE
            || stripe_size % STRIPE_ALIGNMENT != 0
        {
            return err_box!("invalid stripe size: {}", stripe_size);
        }
        let stripes = (0..stripe_count)
            .map(|_| StripeBuf {
                queue: ByteQueue::new(),
                block_idx: 0,
                in_chunk: 0,
            })
            .collect();
        Ok(Self {
            stripe_count: stripe_count as i64,
            recovery_count: recovery_count as i64,
            stripe_size,
            stripes,
            logical_pos: 0,
            logical_size: max(0, file_size),
            pending_bytes: 0,
        })
    }

    pub fn open_chunk_block_size(&self) -> i64 {
        (self.stripe_count + self.recovery_count) * CHUNK_SIZE
    }

    /// Stripe index and position of a logical byte offset.
    fn locate(&self, logical: i64) -> (usize, i64, i64) {
        let data_block = self.stripe_count * CHUNK_SIZE;
        let block_idx = logical / data_block;
        let in_block = logical % data_block;
        let unit = in_block / self.stripe_size;
        let stripe = (unit % self.stripe_count) as usize;
        let row = unit / self.stripe_count;
        let in_chunk = row * self.stripe_size + in_block % self.stripe_size;
        (stripe, block_idx, in_chunk)
    }

    fn physical_offset(&self, stripe: usize, block_idx: i64, in_chunk: i64) -> i64 {
        block_idx * self.open_chunk_block_size() + stripe as i64 * CHUNK_SIZE + in_chunk
    }

    /// Move every staged byte into the per-stripe buffers.
    fn demux(&mut self, buf: &mut ByteQueue) {
        while !buf.is_empty() {
            let unit_left = self.stripe_size - self.logical_pos % self.stripe_size;
            let (stripe, block_idx, in_chunk) = self.locate(self.logical_pos);
            let target = &mut self.stripes[stripe];
            if target.queue.is_empty() {
                // Nothing buffered; the queue restarts at this position.
                target.block_idx = block_idx;
                target.in_chunk = in_chunk;
            }
            let moved = target.queue.move_from(buf, unit_left as usize) as i64;
            self.logical_pos += moved;
            self.pending_bytes += moved;
        }
        self.logical_size = max(self.logical_size, self.logical_pos);
    }

    /// Queue buffered stripe bytes to the chunk workers. Bytes a worker
    /// declines (below its write threshold) stay buffered here.
    fn drain(&mut self, sink: &mut dyn StriperSink, write_threshold: usize) {
        for stripe in 0..self.stripes.len() {
            loop {
                let buf = &mut self.stripes[stripe].queue;
                let avail = buf.bytes_available() as i64;
                if avail == 0 {
                    break;
                }
                let block_idx = self.stripes[stripe].block_idx;
                let in_chunk = self.stripes[stripe].in_chunk;
                let offset = self.physical_offset(stripe, block_idx, in_chunk);
                let room = CHUNK_SIZE - in_chunk;
                let size = min(avail, room);
                let queued = {
                    let buf = &mut self.stripes[stripe].queue;
                    sink.queue_write(buf, size, offset, write_threshold)
                };
                if queued <= 0 {
                    break;
                }
                self.pending_bytes -= queued;
                sink.start_queued_write(queued);
                let target = &mut self.stripes[stripe];
                target.in_chunk += queued;
                if target.in_chunk >= CHUNK_SIZE {
                    target.block_idx += 1;
                    target.in_chunk = 0;
                } else if queued < size {
                    // Declined tail; wait for more data or a flush.
                    break;
                }
            }
        }
    }
}

impl Striper for StripedLayout {
    fn process(
        &mut self,
        sink: &mut dyn StriperSink,
        buf: &mut ByteQueue,
        offset: &mut i64,
        write_threshold: usize,
    ) -> FsResult<()> {
        if *offset != self.logical_pos {
            if !self.stripes.iter().all(|s| s.queue.is_empty()) {
                return Err(FsError::seek(format!(
                    "striped write out of order: {} expected {}",
                    offset, self.logical_pos
                )));
            }
            debug!("striper reseek: {} -> {}", self.logical_pos, offset);
            self.logical_pos = *offset;
        }
        let consumed = buf.bytes_available() as i64;
        self.demux(buf);
        *offset += consumed;
        self.drain(sink, write_threshold);
        Ok(())
    }

    fn file_size(&self) -> i64 {
        self.logical_size
    }

    fn pending_size(&self) -> i64 {
        self.pending_bytes
    }
}
