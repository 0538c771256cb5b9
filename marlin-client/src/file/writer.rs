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

#![allow(clippy::too_many_arguments)]

use crate::file::coordinator::{Command, Coordinator, Event};
use crate::file::{Completion, Striper, WriterStats};
use crate::rpc::{ChunkTransport, MetaServerClient, MetaTransport};
use marlin_common::conf::WriterConf;
use marlin_common::io::ByteQueue;
use marlin_common::state::StriperType;
use marlin_common::{FsError, FsResult};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Identity and layout of the file being opened.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    pub file_id: i64,
    pub path: String,
    pub file_size: i64,
    pub striper_type: StriperType,
    pub stripe_size: i32,
    pub stripe_count: i32,
    pub recovery_count: i32,
    /// Zero selects object store blocks (append only, commit on close).
    pub replica_count: i32,
}

impl OpenSpec {
    pub fn replicated(file_id: i64, path: impl Into<String>, replica_count: i32) -> Self {
        Self {
            file_id,
            path: path.into(),
            file_size: 0,
            striper_type: StriperType::None,
            stripe_size: 0,
            stripe_count: 0,
            recovery_count: 0,
            replica_count,
        }
    }

    pub fn object_store(file_id: i64, path: impl Into<String>) -> Self {
        Self::replicated(file_id, path, 0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct WriterShared {
    pub error_code: AtomicI32,
    pub open: AtomicBool,
    pub closing: AtomicBool,
    pub pending: AtomicI64,
    pub active: AtomicBool,
}

/// Handle to the write pipeline. All mutating calls are serialized through
/// the pipeline task; observability getters read shared atomics and never
/// block.
pub struct Writer {
    tx: mpsc::UnboundedSender<Event>,
    shared: Arc<WriterShared>,
}

impl Writer {
    /// Spawns the pipeline task on the current runtime.
    pub fn new(
        meta: Arc<dyn MetaTransport>,
        chunk: Arc<dyn ChunkTransport>,
        completion: Option<Box<dyn Completion>>,
        conf: WriterConf,
        log_prefix: impl Into<String>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WriterShared::default());
        let meta_client = MetaServerClient::new(meta, conf.meta_op_timeout);
        let mut coordinator = Coordinator::new(
            conf,
            meta_client,
            chunk,
            completion,
            tx.clone(),
            shared.clone(),
            log_prefix.into(),
        );
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !coordinator.handle_event(event) {
                    break;
                }
            }
        });
        Self { tx, shared }
    }

    pub async fn open(&self, spec: OpenSpec) -> FsResult<()> {
        self.call(|reply| Command::Open {
            spec,
            striper: None,
            reply,
        })
        .await?
    }

    /// Open with a caller-supplied striper instead of one built from the
    /// spec. `open_chunk_block_size` is the striper's idle-worker window
    /// hint.
    pub async fn open_with_striper(
        &self,
        spec: OpenSpec,
        striper: Box<dyn Striper>,
        open_chunk_block_size: i64,
    ) -> FsResult<()> {
        self.call(|reply| Command::Open {
            spec,
            striper: Some((striper, open_chunk_block_size)),
            reply,
        })
        .await?
    }

    /// Queue up to `len` bytes from `buf` at `offset`. Returns the number of
    /// bytes accepted; acknowledgements arrive through the completion sink.
    pub async fn write(
        &self,
        buf: ByteQueue,
        len: i64,
        offset: i64,
        flush: bool,
        write_threshold: Option<usize>,
    ) -> FsResult<i64> {
        self.call(|reply| Command::Write {
            buf,
            len,
            offset,
            flush,
            write_threshold,
            reply,
        })
        .await?
    }

    pub async fn write_slice(&self, data: &[u8], offset: i64, flush: bool) -> FsResult<i64> {
        let len = data.len() as i64;
        self.write(ByteQueue::from_slice(data), len, offset, flush, None)
            .await
    }

    pub async fn flush(&self) -> FsResult<()> {
        self.call(|reply| Command::Flush { reply }).await?
    }

    /// Start closing: drain queued writes, close chunks, truncate if needed.
    /// The final `(0, 0)` completion reports the outcome.
    pub async fn close(&self) -> FsResult<()> {
        self.call(|reply| Command::Close { reply }).await?
    }

    pub async fn set_write_threshold(&self, threshold: usize) -> FsResult<()> {
        self.call(|reply| Command::SetWriteThreshold { threshold, reply })
            .await?
    }

    /// Discard all queued work; no completions fire for discarded writes.
    pub async fn stop(&self) -> FsResult<()> {
        self.call(|reply| Command::Stop { reply }).await
    }

    pub async fn shutdown(&self) -> FsResult<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    pub async fn stats(&self) -> FsResult<WriterStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    pub async fn register_completion(
        &self,
        completion: Option<Box<dyn Completion>>,
    ) -> FsResult<()> {
        self.call(|reply| Command::Register { completion, reply })
            .await
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Relaxed)
    }

    pub fn pending_size(&self) -> i64 {
        self.shared.pending.load(Ordering::Relaxed)
    }

    pub fn error_code(&self) -> i32 {
        self.shared.error_code.load(Ordering::Relaxed)
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> FsResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Cmd(build(reply_tx)))
            .map_err(|_| FsError::fault("writer task is gone"))?;
        reply_rx
            .await
            .map_err(|_| FsError::fault("writer task is gone"))
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.tx.send(Event::Cmd(Command::Exit));
    }
}
