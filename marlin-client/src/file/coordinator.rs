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

use crate::chunk::ChunkWorker;
use crate::file::striper::{create_striper, Striper, StriperSink};
use crate::file::writer::{OpenSpec, WriterShared};
use crate::file::{Completion, WriterStats};
use crate::rpc::{
    AllocateChunkResponse, ChunkResponse, ChunkTransport, MetaServerClient, TruncateRequest,
};
use log::{debug, warn};
use marlin_common::error::{CODE_IO, CODE_MAX_RETRY_REACHED};
use marlin_common::io::ByteQueue;
use marlin_common::state::CHUNK_SIZE;
use marlin_common::{conf::WriterConf, FsError, FsResult};
use std::cmp::{max, min};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) enum ChunkOpTag {
    WriteIdAlloc,
    Write(u64),
    UpdateLease,
    Close,
}

/// Everything the pipeline task reacts to: application commands and the
/// completions of operations it spawned. Channel order is execution order.
pub(crate) enum Event {
    Cmd(Command),
    AllocDone {
        worker: u64,
        epoch: u64,
        result: FsResult<AllocateChunkResponse>,
    },
    ChunkDone {
        worker: u64,
        epoch: u64,
        tag: ChunkOpTag,
        result: FsResult<ChunkResponse>,
    },
    WorkerTimer {
        worker: u64,
        epoch: u64,
    },
    TruncateDone {
        epoch: u64,
        result: FsResult<()>,
    },
    CoordinatorTimer {
        epoch: u64,
    },
}

pub(crate) enum Command {
    Open {
        spec: OpenSpec,
        /// Caller-supplied striper and its open-chunk-block hint; `None`
        /// builds one from the spec.
        striper: Option<(Box<dyn Striper>, i64)>,
        reply: oneshot::Sender<FsResult<()>>,
    },
    Write {
        buf: ByteQueue,
        len: i64,
        offset: i64,
        flush: bool,
        write_threshold: Option<usize>,
        reply: oneshot::Sender<FsResult<i64>>,
    },
    Flush {
        reply: oneshot::Sender<FsResult<()>>,
    },
    Close {
        reply: oneshot::Sender<FsResult<()>>,
    },
    SetWriteThreshold {
        threshold: usize,
        reply: oneshot::Sender<FsResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<WriterStats>,
    },
    Register {
        completion: Option<Box<dyn Completion>>,
        reply: oneshot::Sender<()>,
    },
    /// Sent by the handle's drop; tears the pipeline task down.
    Exit,
}

/// File-level state shared with the chunk workers. Workers report
/// completions and read file identity through this; the worker set itself
/// stays with the coordinator so a worker can never observe its siblings.
pub(crate) struct WriterCtx {
    pub conf: WriterConf,
    pub file_id: i64,
    pub path: String,
    pub replica_count: i32,
    pub open_chunk_block_size: i64,
    pub closing: bool,
    pub error_code: i32,
    pub pending_count: i64,
    pub sweep_needed: bool,
    pub meta: MetaServerClient,
    pub chunk_transport: Arc<dyn ChunkTransport>,
    pub event_tx: mpsc::UnboundedSender<Event>,
    pub completion: Option<Box<dyn Completion>>,
    pub striper: Option<Box<dyn Striper>>,
    pub stats: WriterStats,
    pub log_prefix: String,
}

impl WriterCtx {
    pub fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Deliver one acknowledgement to the application and latch the first
    /// non-zero error. The idle sweep runs once the current event unwinds.
    pub fn report_completion(&mut self, worker_error: i32, offset: i64, size: i64) {
        debug_assert!(size >= 0 && self.pending_count >= size);
        self.pending_count -= size;
        if self.error_code == 0 && worker_error != 0 {
            self.error_code = worker_error;
        }
        if let Some(completion) = self.completion.as_mut() {
            completion.done(self.error_code, offset, size);
        }
        self.sweep_needed = true;
    }

    pub fn fatal_error(&mut self, status: i32) {
        if self.error_code == 0 {
            self.error_code = if status == 0 { CODE_IO } else { status };
        }
        self.closing = false;
        self.report_completion(0, 0, 0);
    }
}

/// Owner of the application-visible write contract: the staging buffer, the
/// chunk worker set (most recently used first), write thresholds, and the
/// close-out truncate.
pub(crate) struct Coordinator {
    ctx: WriterCtx,
    shared: Arc<WriterShared>,
    staging: ByteQueue,
    workers: Vec<ChunkWorker>,
    /// File offset of the first staged byte.
    offset: i64,
    file_size: i64,
    write_threshold: usize,
    max_pending_threshold: i64,
    partial_buffers_count: i32,
    sleeping: bool,
    retry_count: i32,
    /// Bumped by stop to cancel the in-flight truncate and timers.
    epoch: u64,
    truncate_offset: i64,
    truncate_in_flight: bool,
    op_start_time: Instant,
    next_worker_id: u64,
}

impl Coordinator {
    pub fn new(
        conf: WriterConf,
        meta: MetaServerClient,
        chunk_transport: Arc<dyn ChunkTransport>,
        completion: Option<Box<dyn Completion>>,
        event_tx: mpsc::UnboundedSender<Event>,
        shared: Arc<WriterShared>,
        log_prefix: String,
    ) -> Self {
        let staging = ByteQueue::with_fragment_size(conf.fragment_size);
        let write_threshold = conf.write_threshold;
        let max_pending_threshold = conf.max_write_size as i64;
        Self {
            ctx: WriterCtx {
                conf,
                file_id: -1,
                path: String::new(),
                replica_count: -1,
                open_chunk_block_size: CHUNK_SIZE,
                closing: false,
                error_code: 0,
                pending_count: 0,
                sweep_needed: false,
                meta,
                chunk_transport,
                event_tx,
                completion,
                striper: None,
                stats: WriterStats::default(),
                log_prefix,
            },
            shared,
            staging,
            workers: Vec::new(),
            offset: 0,
            file_size: 0,
            write_threshold,
            max_pending_threshold,
            partial_buffers_count: 0,
            sleeping: false,
            retry_count: 0,
            epoch: 0,
            truncate_offset: -1,
            truncate_in_flight: false,
            op_start_time: Instant::now(),
            next_worker_id: 0,
        }
    }

    /// Returns false once the pipeline should stop processing events.
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Cmd(Command::Exit) => {
                self.ctx.completion = None;
                self.shutdown();
                return false;
            }
            Event::Cmd(cmd) => self.handle_cmd(cmd),
            Event::AllocDone {
                worker,
                epoch,
                result,
            } => {
                if let Some(index) = self.worker_index(worker) {
                    let (workers, ctx) = (&mut self.workers, &mut self.ctx);
                    workers[index].on_alloc_done(ctx, epoch, result);
                }
            }
            Event::ChunkDone {
                worker,
                epoch,
                tag,
                result,
            } => {
                if let Some(index) = self.worker_index(worker) {
                    let (workers, ctx) = (&mut self.workers, &mut self.ctx);
                    workers[index].on_chunk_done(ctx, epoch, tag, result);
                }
            }
            Event::WorkerTimer { worker, epoch } => {
                if let Some(index) = self.worker_index(worker) {
                    let (workers, ctx) = (&mut self.workers, &mut self.ctx);
                    workers[index].on_timer(ctx, epoch);
                }
            }
            Event::TruncateDone { epoch, result } => self.on_truncate_done(epoch, result),
            Event::CoordinatorTimer { epoch } => self.on_timer(epoch),
        }
        self.sweep_if_needed();
        self.sync_shared();
        true
    }

    fn handle_cmd(&mut self, cmd: Command) {
        match cmd {
            Command::Open {
                spec,
                striper,
                reply,
            } => {
                let _ = reply.send(self.open(spec, striper));
            }
            Command::Write {
                mut buf,
                len,
                offset,
                flush,
                write_threshold,
                reply,
            } => {
                let _ = reply.send(self.write(&mut buf, len, offset, flush, write_threshold));
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.flush());
            }
            Command::Close { reply } => {
                let _ = reply.send(self.close());
            }
            Command::SetWriteThreshold { threshold, reply } => {
                let _ = reply.send(self.set_write_threshold(threshold));
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.ctx.stats);
            }
            Command::Register { completion, reply } => {
                if let Some(mut old) = self.ctx.completion.take() {
                    old.unregistered();
                }
                self.ctx.completion = completion;
                let _ = reply.send(());
            }
            Command::Exit => {}
        }
    }

    fn worker_index(&self, id: u64) -> Option<usize> {
        self.workers.iter().position(|w| w.id() == id)
    }

    fn is_open(&self) -> bool {
        self.ctx.file_id > 0
    }

    fn current_result(&self) -> FsResult<()> {
        if self.ctx.error_code == 0 {
            Ok(())
        } else {
            Err(FsError::from_code(self.ctx.error_code, "write failed"))
        }
    }

    fn open(
        &mut self,
        spec: OpenSpec,
        striper_override: Option<(Box<dyn Striper>, i64)>,
    ) -> FsResult<()> {
        if spec.file_id <= 0 || spec.path.is_empty() {
            return Err(FsError::parameters("invalid file id or path"));
        }
        if spec.replica_count == 0 && spec.file_size != 0 {
            // Object store files are append only; overwrite is a reseek.
            return Err(FsError::seek("object store files do not support overwrite"));
        }
        if self.is_open() {
            if spec.file_id == self.ctx.file_id && spec.path == self.ctx.path {
                return self.current_result();
            }
            return Err(FsError::parameters("writer is already open"));
        }
        if self.ctx.closing || self.sleeping {
            return Err(FsError::try_again("previous close is still in progress"));
        }
        let striper = match striper_override {
            Some(plug) => Some(plug),
            None => create_striper(
                spec.striper_type,
                spec.stripe_count,
                spec.recovery_count,
                spec.stripe_size,
                spec.file_size,
            )
            .map_err(|e| FsError::parameters(e.message().to_string()))?,
        };
        let (striper, hint) = match striper {
            Some((striper, hint)) => (Some(striper), hint),
            None => (None, CHUNK_SIZE),
        };
        self.ctx.open_chunk_block_size = max(hint, CHUNK_SIZE);
        self.ctx.striper = striper;
        self.staging.clear();
        self.ctx.stats = WriterStats::default();
        self.ctx.replica_count = spec.replica_count;
        self.file_size = spec.file_size;
        self.partial_buffers_count = 0;
        self.ctx.path = spec.path;
        self.ctx.error_code = 0;
        self.ctx.file_id = spec.file_id;
        self.ctx.pending_count = 0;
        self.offset = 0;
        self.truncate_in_flight = false;
        self.truncate_offset = spec.file_size;
        self.retry_count = 0;
        self.max_pending_threshold = self.ctx.conf.max_write_size as i64
            * if self.ctx.striper.is_some() {
                max(1, spec.stripe_count) as i64
            } else {
                1
            };
        self.start_write(false);
        self.current_result()
    }

    fn write(
        &mut self,
        buf: &mut ByteQueue,
        len: i64,
        offset: i64,
        flush: bool,
        write_threshold: Option<usize>,
    ) -> FsResult<i64> {
        if offset < 0 {
            return Err(FsError::parameters("negative write offset"));
        }
        if self.ctx.error_code != 0 {
            return Err(FsError::from_code(self.ctx.error_code, "write failed"));
        }
        if self.ctx.closing || !self.is_open() {
            return Err(FsError::parameters("writer is not open"));
        }
        let len = min(len, buf.bytes_available() as i64);
        if len <= 0 {
            self.ctx.report_completion(0, offset, 0);
            if flush {
                self.start_write(true);
            }
            return self.result_or(0);
        }
        if offset != self.offset + self.staging.bytes_available() as i64 {
            if self.ctx.replica_count == 0 {
                // Non sequential writes are not supported with object store
                // files.
                return Err(FsError::seek("non sequential object store write"));
            }
            // Flush what is staged, then reseek.
            self.start_write(true);
            if self.ctx.error_code != 0 {
                return Err(FsError::from_code(self.ctx.error_code, "flush failed"));
            }
            self.offset = offset;
        }
        if self.ctx.conf.max_partial_buffers == 0
            || len < 2 * self.staging.fragment_size() as i64
        {
            // Small writes are copied into the staging tail to avoid
            // fragmentation.
            self.staging.replace_keep_full(buf, len as usize);
        } else {
            if self.staging.is_empty() {
                self.partial_buffers_count = 0;
            }
            self.staging.move_from(buf, len as usize);
            self.partial_buffers_count += 1;
            if self.ctx.conf.max_partial_buffers >= 0
                && self.partial_buffers_count >= self.ctx.conf.max_partial_buffers
            {
                self.staging.make_buffers_full();
                self.partial_buffers_count = 0;
                self.ctx.stats.buffer_compaction_count += 1;
            }
        }
        if let Some(threshold) = write_threshold {
            self.write_threshold = threshold;
        }
        self.start_write(flush);
        self.result_or(len)
    }

    fn result_or(&self, value: i64) -> FsResult<i64> {
        if self.ctx.error_code == 0 {
            Ok(value)
        } else {
            Err(FsError::from_code(self.ctx.error_code, "write failed"))
        }
    }

    fn flush(&mut self) -> FsResult<()> {
        self.start_write(true);
        self.current_result()
    }

    fn close(&mut self) -> FsResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        if self.ctx.error_code != 0 {
            return Err(FsError::from_code(self.ctx.error_code, "write failed"));
        }
        if self.ctx.closing {
            return Err(FsError::try_again("close already in progress"));
        }
        self.ctx.closing = true;
        self.start_write(false);
        self.current_result()
    }

    fn set_write_threshold(&mut self, threshold: usize) -> FsResult<()> {
        let start = self.write_threshold > threshold;
        self.write_threshold = threshold;
        if start && self.is_open() && self.ctx.error_code == 0 {
            self.start_write(false);
        }
        self.current_result()
    }

    /// Synchronous teardown: discard all queued work without completions.
    fn stop(&mut self) {
        while let Some(worker) = self.workers.pop() {
            self.retire_worker(worker);
        }
        if self.truncate_in_flight {
            self.truncate_in_flight = false;
            self.epoch += 1;
        }
        if self.sleeping {
            self.sleeping = false;
            self.epoch += 1;
        }
        self.ctx.closing = false;
        self.staging.clear();
        self.ctx.pending_count = 0;
        self.ctx.sweep_needed = false;
    }

    fn shutdown(&mut self) {
        self.stop();
        self.ctx.striper = None;
        self.ctx.file_id = -1;
        self.ctx.error_code = 0;
    }

    fn retire_worker(&mut self, mut worker: ChunkWorker) {
        worker.shutdown();
        self.ctx.stats.chunk_servers.add(&worker.chunk_server_stats());
    }

    fn pending_size_self(&self) -> i64 {
        self.staging.bytes_available() as i64
            + self
                .ctx
                .striper
                .as_ref()
                .map_or(0, |s| max(0, s.pending_size()))
    }

    pub fn pending_size(&self) -> i64 {
        self.pending_size_self() + self.ctx.pending_count
    }

    /// The batching loop: convert staged bytes into per-chunk queued ops
    /// while a threshold is met, then drive close-out when closing.
    fn start_write(&mut self, flush: bool) {
        debug!(
            "{} start write, offset: {} staged: {} pending: {} thresh: {}/{} flush: {}{}",
            self.ctx.log_prefix,
            self.offset,
            self.staging.bytes_available(),
            self.pending_size_self(),
            self.write_threshold,
            self.max_pending_threshold,
            flush,
            if self.sleeping { " sleeping" } else { "" }
        );
        if self.sleeping {
            return;
        }
        let flush = flush || self.ctx.closing;
        let write_threshold = max(1, if flush { 1 } else { self.write_threshold as i64 });
        let queue_threshold = min(self.max_pending_threshold, write_threshold);
        while self.ctx.error_code == 0
            && (self.max_pending_threshold <= self.staging.bytes_available() as i64
                || write_threshold <= self.pending_size_self())
        {
            self.queue_write(queue_threshold as usize);
            if self.staging.is_empty() {
                break;
            }
        }
        if !self.ctx.closing {
            return;
        }
        if self.workers.is_empty() {
            self.ctx.sweep_needed = true;
            return;
        }
        // Close every open worker. A worker flips out of the open state the
        // moment close is called, so one pass per worker suffices; deletions
        // happen in the sweep.
        loop {
            let Some(index) = self.workers.iter().position(|w| w.is_open()) else {
                break;
            };
            let (workers, ctx) = (&mut self.workers, &mut self.ctx);
            workers[index].close(ctx);
        }
        if self.workers.is_empty() && self.ctx.closing {
            self.set_file_size();
        }
    }

    /// One batching step: either hand the staging buffer to the striper,
    /// which re-enters `queue_write` on the sink per stripe, or queue
    /// directly to the chunk worker that owns the offset.
    fn queue_write(&mut self, write_threshold: usize) {
        if self.ctx.striper.is_some() {
            let mut striper = self.ctx.striper.take().expect("striper");
            let mut staging = std::mem::take(&mut self.staging);
            let mut offset = self.offset;
            let result = striper.process(self, &mut staging, &mut offset, write_threshold);
            self.staging = staging;
            self.offset = offset;
            self.ctx.striper = Some(striper);
            if let Err(e) = result {
                warn!("{} striper: {}", self.ctx.log_prefix, e);
                if self.ctx.error_code == 0 {
                    self.ctx.error_code = e.code();
                }
            }
        } else {
            let mut staging = std::mem::take(&mut self.staging);
            let size = staging.bytes_available() as i64;
            let queued = self.queue_write_to_worker(&mut staging, size, self.offset, write_threshold);
            self.staging = staging;
            if queued > 0 {
                self.offset += queued;
                self.start_queued(queued);
            }
        }
    }

    fn queue_write_to_worker(
        &mut self,
        buf: &mut ByteQueue,
        size: i64,
        offset: i64,
        write_threshold: usize,
    ) -> i64 {
        debug_assert!(offset >= 0);
        if size <= 0 || buf.is_empty() {
            return 0;
        }
        let chunk_start = offset - offset % CHUNK_SIZE;
        match self.workers.iter().position(|w| w.file_offset() == chunk_start) {
            Some(0) => self.workers[0].cancel_close(),
            Some(index) => {
                let worker = self.workers.remove(index);
                self.workers.insert(0, worker);
                self.workers[0].cancel_close();
            }
            None => {
                self.next_worker_id += 1;
                let worker = ChunkWorker::new(self.next_worker_id, &self.ctx);
                self.workers.insert(0, worker);
            }
        }
        let (workers, ctx) = (&mut self.workers, &mut self.ctx);
        workers[0].queue_write(ctx, buf, size, offset, write_threshold)
    }

    fn start_queued(&mut self, queued: i64) {
        if queued <= 0 {
            return;
        }
        debug_assert!(!self.workers.is_empty());
        self.ctx.pending_count += queued;
        let (workers, ctx) = (&mut self.workers, &mut self.ctx);
        workers[0].start_write(ctx);
    }

    /// Runs after every event that delivered a completion: closes and frees
    /// idle workers, and finishes the file close once everything drained.
    fn sweep_if_needed(&mut self) {
        while self.ctx.sweep_needed {
            self.ctx.sweep_needed = false;
            self.try_to_close_idle();
            if self.ctx.closing && self.workers.is_empty() && !self.sleeping {
                self.set_file_size();
                if !self.truncate_in_flight && !self.sleeping {
                    self.ctx.closing = false;
                    self.ctx.file_id = -1;
                    self.ctx.striper = None;
                    let error = self.ctx.error_code;
                    if let Some(completion) = self.ctx.completion.as_mut() {
                        completion.done(error, 0, 0);
                    }
                }
            }
        }
    }

    /// Walk the worker list from the least recently used end, closing and
    /// deleting every idle worker the policy allows; stop at the first idle
    /// worker that must stay cached.
    fn try_to_close_idle(&mut self) {
        let mut index = self.workers.len();
        while index > 0 {
            index -= 1;
            if index >= self.workers.len() {
                continue;
            }
            if self.can_close(index) {
                let was_open = self.workers[index].is_open();
                if was_open {
                    let (workers, ctx) = (&mut self.workers, &mut self.ctx);
                    workers[index].close(ctx);
                }
                if !was_open || (!self.workers[index].is_open() && self.can_close(index)) {
                    let worker = self.workers.remove(index);
                    self.retire_worker(worker);
                }
            } else if self.workers[index].is_idle() && self.workers[index].is_open() {
                break;
            }
        }
    }

    fn can_close(&self, index: usize) -> bool {
        let worker = &self.workers[index];
        if !worker.is_idle() {
            return false;
        }
        if !worker.is_open() || self.ctx.closing {
            return true;
        }
        let Some(front) = self.workers.first() else {
            return true;
        };
        // The most recently used worker of a replicated file stays cached;
        // object store chunks close as soon as they are complete to bound
        // the number of non-stable blocks.
        if self.ctx.replica_count > 0 && index == 0 {
            return false;
        }
        let left_edge = front.open_chunk_block_file_offset();
        if left_edge < 0 {
            return false;
        }
        let right_edge = left_edge + self.ctx.open_chunk_block_size;
        let offset = worker.file_offset();
        offset < left_edge || right_edge <= offset
    }

    /// Extend the file to its final size through the meta server. Object
    /// store files commit through chunk close instead and never truncate.
    fn set_file_size(&mut self) {
        if (self.ctx.striper.is_none() && self.ctx.replica_count == 0)
            || self.ctx.error_code != 0
            || self.truncate_in_flight
        {
            return;
        }
        let size = match self.ctx.striper.as_ref() {
            Some(striper) => striper.file_size(),
            None => self.offset + self.staging.bytes_available() as i64,
        };
        if size < 0 || size <= self.truncate_offset {
            return;
        }
        self.op_start_time = Instant::now();
        self.truncate_offset = size;
        self.truncate_in_flight = true;
        debug!("{} meta +> truncate size: {}", self.ctx.log_prefix, size);
        let req = TruncateRequest {
            fid: self.ctx.file_id,
            path: self.ctx.path.clone(),
            file_offset: size,
        };
        let tx = self.ctx.event_tx.clone();
        let epoch = self.epoch;
        self.ctx.meta.enqueue_truncate(req, move |result| {
            let _ = tx.send(Event::TruncateDone { epoch, result });
        });
    }

    fn on_truncate_done(&mut self, epoch: u64, result: FsResult<()>) {
        if epoch != self.epoch {
            return;
        }
        self.truncate_in_flight = false;
        match result {
            Ok(()) => {
                self.retry_count = 0;
                self.ctx.sweep_needed = true;
            }
            Err(e) => {
                let (status, last_error) = match &e {
                    FsError::MaxRetryReached { last_error, .. } => {
                        (CODE_MAX_RETRY_REACHED, *last_error)
                    }
                    other => (other.code(), 0),
                };
                warn!(
                    "{} set size failure, offset: {} status: {} retry: {} of {}",
                    self.ctx.log_prefix,
                    self.truncate_offset,
                    status,
                    self.retry_count,
                    self.ctx.conf.max_retry
                );
                self.truncate_offset = -1;
                self.retry_count += 1;
                if self.retry_count < self.ctx.conf.max_retry {
                    let elapsed = self.op_start_time.elapsed().as_secs() as i64;
                    let delay = max(
                        if self.retry_count > 1 { 1 } else { 0 },
                        self.ctx.conf.time_between_retries.as_secs() as i64 - elapsed,
                    );
                    if !self.sleep(delay) {
                        self.start_write(false);
                    }
                } else {
                    let status = if status == CODE_MAX_RETRY_REACHED && last_error < 0 {
                        last_error
                    } else {
                        status
                    };
                    self.ctx.fatal_error(status);
                }
            }
        }
    }

    fn sleep(&mut self, secs: i64) -> bool {
        if secs <= 0 || self.sleeping {
            return false;
        }
        debug!("{} sleeping: {} sec", self.ctx.log_prefix, secs);
        self.sleeping = true;
        self.ctx.stats.sleep_time_sec += secs as u64;
        let tx = self.ctx.event_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs as u64)).await;
            let _ = tx.send(Event::CoordinatorTimer { epoch });
        });
        true
    }

    fn on_timer(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        debug!("{} timeout", self.ctx.log_prefix);
        self.sleeping = false;
        self.start_write(false);
    }

    fn sync_shared(&self) {
        let open = self.is_open();
        self.shared
            .error_code
            .store(self.ctx.error_code, Ordering::Relaxed);
        self.shared.open.store(open, Ordering::Relaxed);
        self.shared
            .closing
            .store(open && self.ctx.closing, Ordering::Relaxed);
        self.shared
            .pending
            .store(self.pending_size(), Ordering::Relaxed);
        self.shared.active.store(
            open && (!self.staging.is_empty() || !self.workers.is_empty() || self.ctx.closing),
            Ordering::Relaxed,
        );
    }
}

impl StriperSink for Coordinator {
    fn queue_write(
        &mut self,
        buf: &mut ByteQueue,
        size: i64,
        offset: i64,
        write_threshold: usize,
    ) -> i64 {
        self.queue_write_to_worker(buf, size, offset, write_threshold)
    }

    fn start_queued_write(&mut self, queued: i64) {
        self.start_queued(queued);
    }
}
