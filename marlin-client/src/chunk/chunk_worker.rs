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

use crate::chunk::lease::LeaseCredentials;
use crate::chunk::{BlockBitmap, WriteOp};
use crate::file::coordinator::{ChunkOpTag, Event, WriterCtx};
use crate::rpc::{
    AllocateChunkRequest, AllocateChunkResponse, ChunkRequest, ChunkResponse, ChunkServerClient,
    ChunkServerStats, CloseChunkRequest, RpcFormat, WriteIdAllocRequest, WritePrepareRequest,
    WriteSyncRequest,
};
use log::{debug, error, info, warn};
use marlin_common::error::{
    CODE_FAULT, CODE_MAX_RETRY_REACHED, CODE_NO_ENTRY, CODE_PARAMETERS, CODE_READ_ONLY,
};
use marlin_common::io::ByteQueue;
use marlin_common::state::{
    WriteIdEntry, CHECKSUM_BLOCK_SIZE, CHUNK_SIZE, LEASE_INTERVAL_SECS, LEASE_RENEW_TIME_SECS,
};
use marlin_common::utils::{queue_block_checksums, queue_checksum};
use marlin_common::FsError;
use std::cmp::{max, min};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const TEN_YEARS_SECS: i64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastOp {
    Allocate,
    WriteIdAlloc,
    UpdateLease,
    Close,
}

/// Per-chunk write state machine. Runs the sequence
/// allocate -> write id alloc -> write (-> lease renew) -> close, with every
/// transition happening in the completion of the previous operation. All
/// retry policy for chunk server operations lives here; the connection layer
/// never retries.
pub(crate) struct ChunkWorker {
    id: u64,
    /// Bumped by reset and teardown; completions carrying an older epoch are
    /// cancellations and must not transition state.
    epoch: u64,
    chunk_server: ChunkServerClient,
    error_code: i32,
    retry_count: i32,
    pending_bytes: i64,
    /// File offset of the chunk start; negative until the first queued write.
    file_offset: i64,
    open_chunk_block_offset: i64,
    max_chunk_pos: i64,
    op_start_time: Instant,
    write_ids: Vec<WriteIdEntry>,
    alloc: Option<AllocateChunkResponse>,
    invalidate_all: bool,
    write_prep_reply_supported: bool,
    /// Chunk being closed, kept across close retries.
    close_target: Option<(i64, i64)>,
    last_op: Option<LastOp>,
    sleeping: bool,
    closing: bool,
    keep_lease: bool,
    lease_update_pending: bool,
    lease: LeaseCredentials,
    lease_end_time: Instant,
    lease_expire_time: Instant,
    in_flight_blocks: BlockBitmap,
    pending_queue: VecDeque<WriteOp>,
    in_flight: Vec<WriteOp>,
    next_op_id: u64,
    log_prefix: String,
}

impl ChunkWorker {
    pub fn new(id: u64, ctx: &WriterCtx) -> Self {
        let mut chunk_server = ChunkServerClient::new(
            ctx.chunk_transport.clone(),
            ctx.conf.op_timeout,
            ctx.conf.idle_timeout,
        );
        chunk_server.set_retry_connect_only(true);
        let now = Instant::now();
        Self {
            id,
            epoch: 0,
            chunk_server,
            error_code: 0,
            retry_count: 0,
            pending_bytes: 0,
            file_offset: -1,
            open_chunk_block_offset: -1,
            max_chunk_pos: 0,
            op_start_time: now,
            write_ids: Vec::new(),
            alloc: None,
            invalidate_all: false,
            write_prep_reply_supported: false,
            close_target: None,
            last_op: None,
            sleeping: false,
            closing: false,
            keep_lease: false,
            lease_update_pending: false,
            lease: LeaseCredentials::new(),
            lease_end_time: now,
            lease_expire_time: now,
            in_flight_blocks: BlockBitmap::new(),
            pending_queue: VecDeque::new(),
            in_flight: Vec::new(),
            next_op_id: 0,
            log_prefix: ctx.log_prefix.clone(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        self.pending_queue.is_empty() && self.in_flight.is_empty() && !self.closing
    }

    pub fn is_open(&self) -> bool {
        self.error_code == 0 && self.file_offset >= 0 && !self.closing
    }

    pub fn file_offset(&self) -> i64 {
        if self.error_code == 0 {
            self.file_offset
        } else {
            -1
        }
    }

    pub fn open_chunk_block_file_offset(&self) -> i64 {
        if self.file_offset >= 0 {
            self.open_chunk_block_offset
        } else {
            -1
        }
    }

    pub fn pending_bytes(&self) -> i64 {
        self.pending_bytes
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn cancel_close(&mut self) {
        self.closing = false;
    }

    pub fn chunk_server_stats(&self) -> ChunkServerStats {
        self.chunk_server.stats()
    }

    /// Queue application bytes for this chunk, splitting by checksum block
    /// alignment. Never starts RPCs and never invokes completions, so the
    /// caller can finish updating its own state before `start_write`.
    pub fn queue_write(
        &mut self,
        ctx: &mut WriterCtx,
        src: &mut ByteQueue,
        size: i64,
        offset: i64,
        write_threshold: usize,
    ) -> i64 {
        let mut size = min(src.bytes_available() as i64, size);
        if size <= 0 {
            return 0;
        }
        debug_assert!(offset >= 0 && !self.closing);
        let chunk_offset = offset % CHUNK_SIZE;
        if self.file_offset < 0 {
            self.file_offset = offset - chunk_offset;
            self.open_chunk_block_offset =
                self.file_offset - self.file_offset % ctx.open_chunk_block_size;
        } else {
            debug_assert_eq!(self.file_offset, offset - chunk_offset);
        }
        size = min(size, CHUNK_SIZE - chunk_offset);
        ctx.stats.write_count += 1;
        ctx.stats.write_byte_count += size as u64;
        let mut pos = chunk_offset;

        // Append to the last pending op when the new range continues it and
        // there is room before the next checksum boundary (or within the max
        // write size when the op is aligned).
        if let Some(op) = self.pending_queue.back_mut() {
            let op_size = op.len() as i64;
            if op.offset + op_size == pos {
                let head = op.offset % CHECKSUM_BLOCK_SIZE;
                let room = if head == 0 {
                    ctx.conf.max_write_size as i64
                } else {
                    CHECKSUM_BLOCK_SIZE - head
                };
                let mut nwr = min(size, room - op_size);
                if nwr > 0 && op_size + nwr > CHECKSUM_BLOCK_SIZE {
                    nwr -= (op_size + nwr) % CHECKSUM_BLOCK_SIZE;
                }
                if nwr > 0 {
                    let moved = op.buffer.move_from(src, nwr as usize) as i64;
                    op.invalidate_checksums();
                    // Keep the claim cursor; only the end of the range moves.
                    let begin = op.begin_block;
                    op.init_block_range();
                    op.begin_block = begin;
                    size -= moved;
                    pos += moved;
                }
            }
        }

        // Force a drain when the write reaches the chunk end.
        let write_threshold = if pos + size >= CHUNK_SIZE {
            1
        } else {
            max(write_threshold as i64, 1)
        };

        // Leading partial block.
        let block_off = pos % CHECKSUM_BLOCK_SIZE;
        if block_off > 0 && (size >= write_threshold || block_off + size >= CHECKSUM_BLOCK_SIZE) {
            let mut op = self.new_op(pos);
            let moved = op
                .buffer
                .move_from(src, min(size, CHECKSUM_BLOCK_SIZE - block_off) as usize)
                as i64;
            size -= moved;
            pos += moved;
            op.init_block_range();
            self.pending_queue.push_back(op);
        }

        // Full-size block-aligned ops.
        while size >= write_threshold {
            let mut op_size = min(ctx.conf.max_write_size as i64, size);
            if op_size > CHECKSUM_BLOCK_SIZE {
                op_size -= op_size % CHECKSUM_BLOCK_SIZE;
            }
            let mut op = self.new_op(pos);
            let moved = op.buffer.move_from(src, op_size as usize) as i64;
            size -= moved;
            pos += moved;
            op.init_block_range();
            self.pending_queue.push_back(op);
        }

        debug_assert!(pos <= CHUNK_SIZE && size >= 0);
        let queued = pos - chunk_offset;
        self.pending_bytes += queued;
        self.max_chunk_pos = max(pos, self.max_chunk_pos);
        queued
    }

    /// The dispatcher: decides which RPC, if any, moves this chunk forward.
    pub fn start_write(&mut self, ctx: &mut WriterCtx) {
        if self.sleeping && !self.cancel_lease_update() {
            return;
        }
        self.lease_update_pending = false;
        if self.error_code != 0 && !self.invalidate_all {
            if self.last_op.is_some() {
                self.reset();
            }
            self.closing = false;
            return;
        }
        if self.closing && !self.can_write() {
            if !self.in_flight.is_empty() {
                return;
            }
            if self.last_op == Some(LastOp::Close) {
                return;
            }
            // Close the chunk even after a chunk server disconnect, to
            // release the write lease.
            if self.alloc.is_some() {
                // An object store block close must wait for an in-flight
                // write id allocation.
                let wait_for_write_id = self.last_op == Some(LastOp::WriteIdAlloc)
                    && self
                        .close_target
                        .map_or(false, |(id, version)| id > 0 && version < 0);
                if !wait_for_write_id {
                    self.close_chunk(ctx);
                }
                return;
            }
            if self.keep_lease {
                if self.last_op != Some(LastOp::Allocate)
                    && self.last_op != Some(LastOp::WriteIdAlloc)
                {
                    // Re-allocate the object block to recreate the lease.
                    self.reset();
                    self.allocate_chunk(ctx);
                }
                return;
            }
            self.chunk_server.stop();
            self.epoch += 1;
            self.last_op = None;
            self.closing = false;
            self.file_offset = -1;
            self.alloc = None;
            self.report_completion(ctx, 0, 0);
            return;
        }
        if !self.can_write() && !self.schedule_lease_update(ctx) {
            return;
        }
        if self.alloc.is_some() {
            let renew_edge = min(
                self.lease_end_time - Duration::from_secs(1),
                self.lease_expire_time + Duration::from_secs((LEASE_RENEW_TIME_SECS / 2) as u64),
            );
            if renew_edge <= Instant::now() {
                // The chunk server may have cleaned up the write lease;
                // start over from chunk allocation.
                debug!(
                    "{} write lease expired, chunk offset: {}, pending queue empty: {}",
                    self.log_prefix,
                    self.file_offset,
                    self.pending_queue.is_empty()
                );
                self.reset();
                if !self.can_write() && !self.schedule_lease_update(ctx) {
                    // No data pending; do not preallocate after inactivity.
                    return;
                }
            }
        }
        if self.alloc.is_some() && !self.write_ids.is_empty() {
            if self.can_write() {
                self.write(ctx);
            } else {
                self.update_lease(ctx);
            }
        } else if self.last_op.is_none() {
            self.reset();
            self.allocate_chunk(ctx);
        }
    }

    pub fn close(&mut self, ctx: &mut WriterCtx) {
        if !self.closing && self.is_open() {
            self.closing = true;
            self.start_write(ctx);
        }
    }

    /// Discard every queued operation. No completions are delivered for the
    /// discarded writes.
    pub fn shutdown(&mut self) {
        self.reset();
        self.pending_queue.clear();
        self.closing = false;
        self.error_code = 0;
        self.pending_bytes = 0;
    }

    pub fn on_alloc_done(
        &mut self,
        ctx: &mut WriterCtx,
        epoch: u64,
        result: Result<AllocateChunkResponse, FsError>,
    ) {
        if epoch != self.epoch {
            ctx.stats.meta_ops_cancelled_count += 1;
            return;
        }
        if self.last_op == Some(LastOp::Allocate) {
            self.last_op = None;
        }
        let resp = match result {
            Err(e) => {
                let (status, last_error) = split_status(&e);
                self.handle_error(ctx, "allocate", status, last_error);
                return;
            }
            Ok(resp) => resp,
        };
        if resp.chunk_id <= 0 || (resp.servers.is_empty() && !self.invalidate_all) {
            self.handle_error(ctx, "allocate", 0, 0);
            return;
        }
        if self.invalidate_all {
            // Report every queued byte as completed; the latched error code
            // travels with the completion so the application can decide.
            let size = self.pending_bytes;
            let offset = if size > 0 { self.file_offset } else { 0 };
            info!(
                "{} invalidate done, chunk: {} offset: {} status: {} pending: {}",
                self.log_prefix, resp.chunk_id, self.file_offset, self.error_code, size
            );
            self.invalidate_all = false;
            let worker_error = self.error_code;
            self.shutdown();
            ctx.report_completion(worker_error, offset, size);
            return;
        }
        let lease_secs = if resp.lease_duration < 0 {
            TEN_YEARS_SECS
        } else {
            max(1, resp.lease_duration - LEASE_RENEW_TIME_SECS)
        };
        self.lease_end_time = Instant::now() + Duration::from_secs(lease_secs as u64);
        self.update_lease_expiration();
        self.keep_lease = resp.chunk_version < 0;
        self.alloc = Some(resp);
        self.allocate_write_id(ctx);
    }

    pub fn on_chunk_done(
        &mut self,
        ctx: &mut WriterCtx,
        epoch: u64,
        tag: ChunkOpTag,
        result: Result<ChunkResponse, FsError>,
    ) {
        if epoch != self.epoch {
            return;
        }
        match tag {
            ChunkOpTag::WriteIdAlloc => {
                if self.last_op == Some(LastOp::WriteIdAlloc) {
                    self.last_op = None;
                }
                self.on_write_id_done(ctx, result);
            }
            ChunkOpTag::UpdateLease => {
                if self.last_op == Some(LastOp::UpdateLease) {
                    self.last_op = None;
                }
                self.on_update_lease_done(ctx, result);
            }
            ChunkOpTag::Close => {
                if self.last_op == Some(LastOp::Close) {
                    self.last_op = None;
                }
                self.on_close_done(ctx, result);
            }
            ChunkOpTag::Write(op_id) => self.on_write_done(ctx, op_id, result),
        }
    }

    pub fn on_timer(&mut self, ctx: &mut WriterCtx, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        debug!("{} timeout", self.log_prefix);
        self.sleeping = false;
        self.start_write(ctx);
    }

    fn new_op(&mut self, offset: i64) -> WriteOp {
        self.next_op_id += 1;
        WriteOp::new(self.next_op_id, offset)
    }

    fn can_write(&self) -> bool {
        !self.pending_queue.is_empty() || self.invalidate_all
    }

    fn update_lease_expiration(&mut self) {
        self.lease_expire_time = min(
            self.lease_end_time,
            Instant::now()
                + Duration::from_secs((LEASE_INTERVAL_SECS - LEASE_RENEW_TIME_SECS) as u64),
        );
    }

    fn schedule_lease_update(&mut self, ctx: &mut WriterCtx) -> bool {
        if !self.keep_lease {
            return false;
        }
        let now = Instant::now();
        if now < self.lease_expire_time {
            self.lease_update_pending = true;
            let remain = self.lease_expire_time.saturating_duration_since(now);
            self.sleep(ctx, max(1, remain.as_secs() as i64));
            return false;
        }
        true
    }

    fn cancel_lease_update(&mut self) -> bool {
        if !self.lease_update_pending {
            return false;
        }
        if self.sleeping {
            self.sleeping = false;
            self.epoch += 1;
        }
        self.lease_update_pending = false;
        true
    }

    fn allocate_chunk(&mut self, ctx: &mut WriterCtx) {
        debug_assert!(
            ctx.file_id > 0
                && self.file_offset >= 0
                && (!self.pending_queue.is_empty()
                    || self.close_target.map_or(false, |(id, v)| id > 0 && v < 0)
                    || self.keep_lease
                    || self.invalidate_all)
        );
        let req = AllocateChunkRequest {
            fid: ctx.file_id,
            path: ctx.path.clone(),
            file_offset: self.file_offset,
            invalidate_all: self.invalidate_all,
        };
        ctx.stats.chunk_alloc_count += 1;
        self.last_op = Some(LastOp::Allocate);
        self.op_start_time = Instant::now();
        // Allocation may require a chunk version change on the server side;
        // give it several meta op budgets.
        let meta_timeout = ctx.conf.meta_op_timeout;
        let extra = max(ctx.conf.op_timeout, meta_timeout * 5).saturating_sub(meta_timeout);
        let tx = ctx.event_tx.clone();
        let (worker, epoch) = (self.id, self.epoch);
        ctx.meta.enqueue_allocate(req, extra, move |result| {
            let _ = tx.send(Event::AllocDone {
                worker,
                epoch,
                result,
            });
        });
    }

    fn allocate_write_id(&mut self, ctx: &mut WriterCtx) {
        let Some(alloc) = self.alloc.as_ref() else {
            return;
        };
        let chunk_id = alloc.chunk_id;
        let chunk_version = alloc.chunk_version;
        let servers = alloc.servers.clone();
        let chunk_access = alloc.chunk_access.clone();
        let cs_access_token = alloc.cs_access_token.clone();
        let cs_access_key = alloc.cs_access_key.clone();
        let cs_access_issued = alloc.cs_access_issued;
        let cs_access_valid_for = alloc.cs_access_valid_for;
        let allow_clear_text = alloc.allow_cs_clear_text && ctx.conf.allow_cs_clear_text;
        let short_rpc = alloc.all_cs_short_rpc;

        let now = WriterCtx::now_secs();
        self.lease.reset_access();
        self.chunk_server.set_shutdown_ssl(allow_clear_text);
        self.chunk_server.set_rpc_format(if short_rpc {
            RpcFormat::Short
        } else {
            RpcFormat::Long
        });

        let mut req = WriteIdAllocRequest {
            chunk_id,
            chunk_version,
            servers: servers.clone(),
            access: Default::default(),
        };
        if cs_access_token.is_empty() || chunk_access.is_empty() {
            self.chunk_server.clear_key();
            if !cs_access_token.is_empty() {
                self.handle_error(ctx, "write id alloc: no chunk access", CODE_PARAMETERS, 0);
                return;
            }
            if !chunk_access.is_empty() {
                self.handle_error(
                    ctx,
                    "write id alloc: no chunk server access",
                    CODE_PARAMETERS,
                    0,
                );
                return;
            }
            if !ctx.conf.allow_cs_clear_text {
                self.handle_error(
                    ctx,
                    "write id alloc: no clear text chunk server access",
                    CODE_PARAMETERS,
                    0,
                );
                return;
            }
            self.lease.set_unlimited(now);
        } else {
            self.chunk_server.set_key(cs_access_token, cs_access_key);
            self.lease
                .init_from_allocate(now, chunk_access, cs_access_issued, cs_access_valid_for);
            // The chunk access issued by allocate is short lived; always ask
            // for a write-id-scoped replacement.
            req.access = self.lease.fill_access(now, true, None);
            req.access.create_chunk_access = true;
            if allow_clear_text && req.access.create_cs_access {
                req.access.decrypt_key = Some(self.chunk_server.session_key());
            }
        }
        let Some(master) = servers.first().cloned() else {
            self.handle_error(ctx, "write id alloc: no chunk servers", CODE_FAULT, 0);
            return;
        };
        if !self.chunk_server.set_server(master, true) {
            self.handle_error(ctx, "write id alloc: invalid chunk server", CODE_FAULT, 0);
            return;
        }
        self.last_op = Some(LastOp::WriteIdAlloc);
        self.op_start_time = Instant::now();
        let tx = ctx.event_tx.clone();
        let (worker, epoch) = (self.id, self.epoch);
        let queued = self
            .chunk_server
            .enqueue(ChunkRequest::WriteIdAlloc(req), move |result| {
                let _ = tx.send(Event::ChunkDone {
                    worker,
                    epoch,
                    tag: ChunkOpTag::WriteIdAlloc,
                    result,
                });
            });
        if !queued {
            let _ = ctx.event_tx.send(Event::ChunkDone {
                worker: self.id,
                epoch: self.epoch,
                tag: ChunkOpTag::WriteIdAlloc,
                result: Err(FsError::fault("chunk op enqueue failure")),
            });
        }
    }

    fn on_write_id_done(&mut self, ctx: &mut WriterCtx, result: Result<ChunkResponse, FsError>) {
        self.write_ids.clear();
        let resp = match result {
            Err(e) => {
                self.chunk_server.note_op_failed();
                let (status, last_error) = split_status(&e);
                self.handle_error(ctx, "write id alloc", status, last_error);
                return;
            }
            Ok(ChunkResponse::WriteIdAlloc(resp)) => resp,
            Ok(_) => {
                self.handle_error(ctx, "write id alloc: bad response kind", CODE_FAULT, 0);
                return;
            }
        };
        let (chunk_version, server_count) = match self.alloc.as_ref() {
            Some(alloc) => (alloc.chunk_version, alloc.servers.len()),
            None => return,
        };
        if chunk_version < 0 && !resp.write_prep_reply_supported {
            // Object store writes commit through the prepare reply; a server
            // without it cannot host the block.
            self.handle_error(
                ctx,
                "write id alloc: write prepare reply is not supported",
                CODE_PARAMETERS,
                0,
            );
            return;
        }
        let Some(ids) = crate::rpc::parse_write_ids(&resp.write_ids, server_count) else {
            error!(
                "{} write id alloc: invalid response: {:?} for {} servers",
                self.log_prefix, resp.write_ids, server_count
            );
            self.handle_error(ctx, "write id alloc", 0, 0);
            return;
        };
        self.write_ids = ids;
        self.write_prep_reply_supported = resp.write_prep_reply_supported;
        let now = WriterCtx::now_secs();
        if let Some((id, key)) = self.lease.update_access(now, &resp.access) {
            self.chunk_server.set_key(id, key);
        }
        self.update_lease_expiration();
        self.start_write(ctx);
    }

    /// Dispatch every pending op whose checksum block range can be claimed.
    /// An op blocked by an in-flight block keeps the blocks it already
    /// claimed and is retried on the next pass.
    fn write(&mut self, ctx: &mut WriterCtx) {
        let mut i = 0;
        while !self.sleeping && self.error_code == 0 && self.alloc.is_some() {
            if i >= self.pending_queue.len() {
                break;
            }
            if self.try_claim(i) {
                let op = self.pending_queue.remove(i).expect("claimed op");
                self.dispatch_write(ctx, op);
            } else {
                i += 1;
            }
        }
    }

    fn try_claim(&mut self, index: usize) -> bool {
        let op = &mut self.pending_queue[index];
        while op.begin_block < op.end_block {
            if self.in_flight_blocks.test(op.begin_block) {
                return false;
            }
            self.in_flight_blocks.set(op.begin_block);
            op.begin_block += 1;
        }
        true
    }

    fn dispatch_write(&mut self, ctx: &mut WriterCtx, mut op: WriteOp) {
        let Some(alloc) = self.alloc.as_ref() else {
            self.pending_queue.push_back(op);
            return;
        };
        let chunk_id = alloc.chunk_id;
        let chunk_version = alloc.chunk_version;
        let len = op.len();
        let reply_requested = self.write_prep_reply_supported;
        if reply_requested {
            if !op.checksum_valid {
                op.checksum = Some(queue_checksum(&op.buffer, len));
                op.checksum_valid = true;
            }
            op.checksums.clear();
        } else if op.checksums.is_empty() {
            op.checksums =
                queue_block_checksums(&op.buffer, len, CHECKSUM_BLOCK_SIZE as usize);
            op.checksum_valid = true;
        }
        let now = WriterCtx::now_secs();
        let access = self.fill_access(now, reply_requested);
        let prepare = WritePrepareRequest {
            chunk_id,
            chunk_version,
            offset: op.offset,
            len,
            reply_requested,
            checksum: if reply_requested { op.checksum } else { None },
            checksums: op.checksums.clone(),
            write_ids: self.write_ids.clone(),
            access,
            data: op.buffer.to_bytes(),
        };
        let sync = if reply_requested {
            None
        } else {
            Some(WriteSyncRequest {
                chunk_id,
                chunk_version,
                offset: op.offset,
                len,
                checksums: op.checksums.clone(),
                write_ids: self.write_ids.clone(),
                access: self.fill_access(now, true),
            })
        };
        op.op_start_time = Instant::now();
        ctx.stats.ops_write_count += 1;
        ctx.stats.ops_write_byte_count += len as u64;
        let op_id = op.op_id;
        self.in_flight.push(op);
        let tx = ctx.event_tx.clone();
        let (worker, epoch) = (self.id, self.epoch);
        let queued = self.chunk_server.enqueue_write(prepare, sync, move |result| {
            let _ = tx.send(Event::ChunkDone {
                worker,
                epoch,
                tag: ChunkOpTag::Write(op_id),
                result,
            });
        });
        if !queued {
            let _ = ctx.event_tx.send(Event::ChunkDone {
                worker: self.id,
                epoch: self.epoch,
                tag: ChunkOpTag::Write(op_id),
                result: Err(FsError::fault("chunk op enqueue failure")),
            });
        }
    }

    fn on_write_done(
        &mut self,
        ctx: &mut WriterCtx,
        op_id: u64,
        result: Result<ChunkResponse, FsError>,
    ) {
        let Some(index) = self.in_flight.iter().position(|op| op.op_id == op_id) else {
            return;
        };
        let mut op = self.in_flight.swap_remove(index);
        op.init_block_range();
        self.in_flight_blocks.clear_range(op.begin_block, op.end_block);
        match result {
            Err(e) => {
                self.chunk_server.note_op_failed();
                self.op_start_time = op.op_start_time;
                self.pending_queue.push_back(op);
                let (status, last_error) = split_status(&e);
                self.handle_error(ctx, "write", status, last_error);
            }
            Ok(resp) => {
                let done = op.len() as i64;
                debug_assert!(done >= 0 && self.pending_bytes >= done);
                self.pending_bytes -= done;
                let now = WriterCtx::now_secs();
                if let Some(update) = resp.access_update() {
                    if let Some((id, key)) = self.lease.update_access(now, update) {
                        self.chunk_server.set_key(id, key);
                    }
                }
                let offset = self.file_offset + op.offset;
                self.report_completion(ctx, offset, done);
                self.update_lease_expiration();
                self.start_write(ctx);
            }
        }
    }

    fn update_lease(&mut self, ctx: &mut WriterCtx) {
        debug_assert!(
            self.write_prep_reply_supported && self.alloc.is_some() && !self.write_ids.is_empty()
        );
        let Some(alloc) = self.alloc.as_ref() else {
            return;
        };
        let now = WriterCtx::now_secs();
        let reply_requested = self.write_prep_reply_supported;
        let mut req = WritePrepareRequest {
            chunk_id: alloc.chunk_id,
            chunk_version: alloc.chunk_version,
            offset: 0,
            len: 0,
            reply_requested,
            checksum: None,
            checksums: Vec::new(),
            write_ids: self.write_ids.clone(),
            access: Default::default(),
            data: Default::default(),
        };
        req.access = self.fill_access(now, reply_requested);
        self.last_op = Some(LastOp::UpdateLease);
        self.op_start_time = Instant::now();
        let tx = ctx.event_tx.clone();
        let (worker, epoch) = (self.id, self.epoch);
        let queued = self
            .chunk_server
            .enqueue(ChunkRequest::WritePrepare(req), move |result| {
                let _ = tx.send(Event::ChunkDone {
                    worker,
                    epoch,
                    tag: ChunkOpTag::UpdateLease,
                    result,
                });
            });
        if !queued {
            let _ = ctx.event_tx.send(Event::ChunkDone {
                worker: self.id,
                epoch: self.epoch,
                tag: ChunkOpTag::UpdateLease,
                result: Err(FsError::fault("chunk op enqueue failure")),
            });
        }
    }

    fn on_update_lease_done(&mut self, ctx: &mut WriterCtx, result: Result<ChunkResponse, FsError>) {
        match result {
            Err(e) => {
                self.chunk_server.note_op_failed();
                let (status, last_error) = split_status(&e);
                self.handle_error(ctx, "lease renew", status, last_error);
            }
            Ok(resp) => {
                let now = WriterCtx::now_secs();
                if let Some(update) = resp.access_update() {
                    if let Some((id, key)) = self.lease.update_access(now, update) {
                        self.chunk_server.set_key(id, key);
                    }
                }
                self.update_lease_expiration();
                self.start_write(ctx);
            }
        }
    }

    fn close_chunk(&mut self, ctx: &mut WriterCtx) {
        let Some(alloc) = self.alloc.take() else {
            return;
        };
        self.close_target = Some((alloc.chunk_id, alloc.chunk_version));
        let now = WriterCtx::now_secs();
        let mut req = CloseChunkRequest {
            chunk_id: alloc.chunk_id,
            chunk_version: alloc.chunk_version,
            write_ids: self.write_ids.clone(),
            servers: Vec::new(),
            access: Default::default(),
        };
        if req.write_ids.is_empty() {
            req.servers = alloc.servers.clone();
        }
        req.access = self.fill_access(now, true);
        if alloc.chunk_version < 0 {
            // Extend the timeout to cover an atomic object store commit of
            // everything written to the block.
            let max_write_size = max(1 << 9, ctx.conf.max_write_size as i64);
            let op_timeout_sec = ctx.conf.op_timeout.as_secs() as i64;
            let writes = (self.max_chunk_pos + max_write_size - 1) / max_write_size;
            let timeout_sec = min(
                LEASE_INTERVAL_SECS / 2,
                (op_timeout_sec + 3) / 4 * (1 + max(ctx.conf.max_retry as i64 / 3, writes)),
            );
            debug!(
                "{} chunk: {} version: {} close timeout: {} sec",
                self.log_prefix, alloc.chunk_id, alloc.chunk_version, timeout_sec
            );
            self.chunk_server
                .set_op_timeout(Duration::from_secs(max(1, timeout_sec) as u64));
        }
        self.write_ids.clear();
        self.last_op = Some(LastOp::Close);
        self.op_start_time = Instant::now();
        let tx = ctx.event_tx.clone();
        let (worker, epoch) = (self.id, self.epoch);
        let queued = self
            .chunk_server
            .enqueue(ChunkRequest::Close(req), move |result| {
                let _ = tx.send(Event::ChunkDone {
                    worker,
                    epoch,
                    tag: ChunkOpTag::Close,
                    result,
                });
            });
        if !queued {
            let _ = ctx.event_tx.send(Event::ChunkDone {
                worker: self.id,
                epoch: self.epoch,
                tag: ChunkOpTag::Close,
                result: Err(FsError::fault("chunk op enqueue failure")),
            });
        }
    }

    fn on_close_done(&mut self, ctx: &mut WriterCtx, result: Result<ChunkResponse, FsError>) {
        let object_store = self.close_target.map_or(false, |(_, version)| version < 0);
        if object_store {
            self.chunk_server.restore_op_timeout();
        }
        if let Err(e) = result {
            self.chunk_server.note_op_failed();
            if object_store {
                let (status, last_error) = split_status(&e);
                self.handle_error(ctx, "close", status, last_error);
                return;
            }
            debug!(
                "{} chunk close failure ignored, status: {}",
                self.log_prefix,
                e.code()
            );
        }
        self.keep_lease = false;
        self.close_target = None;
        self.reset();
        self.start_write(ctx);
    }

    /// Retry and invalidation policy for a failed operation. `op` names the
    /// failed operation for logs; allocate failures carry extra policy.
    fn handle_error(&mut self, ctx: &mut WriterCtx, op: &str, status: i32, last_error: i32) {
        error!(
            "{} operation failure, op: {} status: {} chunk offset: {} retry: {} of {}",
            self.log_prefix, op, status, self.file_offset, self.retry_count, ctx.conf.max_retry
        );
        let mut status = status;
        let is_allocate = op == "allocate";
        if is_allocate {
            if status == CODE_NO_ENTRY {
                // File deleted while the lease was out; nothing to retry.
                error!("{} file does not exist, giving up", self.log_prefix);
                self.error_code = status;
                self.reset();
                ctx.fatal_error(status);
                return;
            }
            if status == CODE_READ_ONLY
                && self.closing
                && self.close_target.map_or(false, |(id, _)| id > 0)
                && self.keep_lease
            {
                // The object store block went stable under us; the close
                // already took effect.
                warn!("{} object store block is now stable", self.log_prefix);
                self.keep_lease = false;
                self.close_target = None;
                self.reset();
                self.start_write(ctx);
                return;
            }
            if status == CODE_MAX_RETRY_REACHED && self.retry_count < ctx.conf.max_retry {
                // The meta transport exhausted every connection attempt.
                self.retry_count = ctx.conf.max_retry;
            }
        }
        if !self.invalidate_all && self.file_offset >= 0 {
            let retry_needed = match ctx.striper.as_deref() {
                Some(striper) => striper.is_write_retry_needed(
                    self.file_offset,
                    self.retry_count,
                    ctx.conf.max_retry,
                    status,
                ),
                None => true,
            };
            if !retry_needed {
                info!(
                    "{} invalidate, offset: {} status: {} pending: {}",
                    self.log_prefix, self.file_offset, status, self.pending_bytes
                );
                self.error_code = status;
                self.invalidate_all = true;
                self.retry_count = 0;
                self.reset();
                debug_assert!(self.can_write());
                self.start_write(ctx);
                return;
            }
        }
        self.retry_count += 1;
        if self.retry_count > ctx.conf.max_retry {
            error!(
                "{} max retry reached: {}, giving up",
                self.log_prefix, self.retry_count
            );
            if status >= 0 {
                status = marlin_common::error::CODE_IO;
            } else if status == CODE_MAX_RETRY_REACHED && last_error < 0 {
                status = last_error;
            }
            self.error_code = status;
            self.reset();
            ctx.fatal_error(status);
            return;
        }
        if is_allocate {
            ctx.stats.alloc_retries_count += 1;
        }
        ctx.stats.retries_count += 1;
        let mut delay = self.time_to_next_retry(ctx);
        if self.keep_lease {
            // Do not outlive the lease while backing off.
            let floor = if self.retry_count <= 1 {
                0
            } else {
                max(2, LEASE_INTERVAL_SECS / (2 * max(1, ctx.conf.max_retry as i64)))
            };
            let lease_left = self
                .lease_expire_time
                .saturating_duration_since(Instant::now())
                .as_secs() as i64;
            delay = min(max(floor, lease_left), delay);
        }
        info!(
            "{} scheduling retry: {} of {} in {} sec, op: {}",
            self.log_prefix, self.retry_count, ctx.conf.max_retry, delay, op
        );
        self.error_code = 0;
        self.reset();
        if !self.sleep(ctx, delay) {
            self.start_write(ctx);
        }
    }

    fn time_to_next_retry(&self, ctx: &WriterCtx) -> i64 {
        let elapsed = self.op_start_time.elapsed().as_secs() as i64;
        max(
            if self.retry_count >= 1 { 1 } else { 0 },
            ctx.conf.time_between_retries.as_secs() as i64 - elapsed,
        )
    }

    fn sleep(&mut self, ctx: &mut WriterCtx, secs: i64) -> bool {
        if secs <= 0 || self.sleeping {
            return false;
        }
        debug!("{} sleeping: {} sec", self.log_prefix, secs);
        self.sleeping = true;
        ctx.stats.sleep_time_sec += secs as u64;
        let tx = ctx.event_tx.clone();
        let (worker, epoch) = (self.id, self.epoch);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs as u64)).await;
            let _ = tx.send(Event::WorkerTimer { worker, epoch });
        });
        true
    }

    /// Cancel whatever is outstanding and fall back to the unallocated state.
    /// In-flight writes return to the pending queue exactly as their
    /// cancellation completions would have left them.
    fn reset(&mut self) {
        self.epoch += 1;
        for mut op in std::mem::take(&mut self.in_flight) {
            op.init_block_range();
            self.in_flight_blocks.clear_range(op.begin_block, op.end_block);
            self.pending_queue.push_back(op);
        }
        self.write_ids.clear();
        self.alloc = None;
        self.last_op = None;
        self.chunk_server.stop();
        self.sleeping = false;
        self.lease_update_pending = false;
    }

    fn fill_access(&mut self, now: i64, can_request: bool) -> crate::rpc::AccessFields {
        let first = self.write_ids.first().map(|w| w.write_id);
        let mut fields = self.lease.fill_access(now, can_request, first);
        if fields.create_cs_access && self.chunk_server.is_shutdown_ssl() {
            fields.decrypt_key = Some(self.chunk_server.session_key());
        }
        fields
    }

    fn report_completion(&mut self, ctx: &mut WriterCtx, offset: i64, size: i64) {
        if self.error_code == 0 {
            self.retry_count = 0;
        }
        ctx.report_completion(self.error_code, offset, size);
    }
}

fn split_status(e: &FsError) -> (i32, i32) {
    match e {
        FsError::MaxRetryReached { last_error, .. } => (CODE_MAX_RETRY_REACHED, *last_error),
        other => (other.code(), 0),
    }
}
