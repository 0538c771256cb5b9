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

//! End-to-end write pipeline scenarios over in-memory meta and chunk server
//! transports, driven under a paused clock.

use async_trait::async_trait;
use bytes::Bytes;
use marlin_client::file::{Striper, StriperSink};
use marlin_client::rpc::{
    format_write_ids, AllocateChunkRequest, AllocateChunkResponse, ChunkRequest, ChunkResponse,
    ChunkTransport, MetaTransport, TruncateRequest, WriteIdAllocResponse, WritePrepareResponse,
};
use marlin_client::{Completion, OpenSpec, Writer};
use marlin_common::conf::WriterConf;
use marlin_common::error::{CODE_IO, CODE_SEEK};
use marlin_common::io::ByteQueue;
use marlin_common::state::{
    ServerLocation, StriperType, WriteIdEntry, CHECKSUM_BLOCK_SIZE, CHUNK_SIZE,
};
use marlin_common::{FsError, FsResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MetaState {
    allocates: Vec<AllocateChunkRequest>,
    truncates: Vec<TruncateRequest>,
    alloc_failures: VecDeque<FsError>,
    truncate_failures: VecDeque<FsError>,
    server_count: usize,
    object_store: bool,
    lease_duration: i64,
    next_chunk_id: i64,
}

struct TestMeta(Mutex<MetaState>);

impl TestMeta {
    fn new(server_count: usize, object_store: bool) -> Arc<Self> {
        Arc::new(Self(Mutex::new(MetaState {
            allocates: Vec::new(),
            truncates: Vec::new(),
            alloc_failures: VecDeque::new(),
            truncate_failures: VecDeque::new(),
            server_count,
            object_store,
            // Object store block leases outlive the renew interval so idle
            // workers renew instead of re-allocating.
            lease_duration: if object_store { 3600 } else { 300 },
            next_chunk_id: 100,
        })))
    }

    fn allocates(&self) -> Vec<AllocateChunkRequest> {
        self.0.lock().unwrap().allocates.clone()
    }

    fn truncates(&self) -> Vec<TruncateRequest> {
        self.0.lock().unwrap().truncates.clone()
    }

    fn fail_next_truncate(&self, error: FsError) {
        self.0.lock().unwrap().truncate_failures.push_back(error);
    }
}

#[async_trait]
impl MetaTransport for TestMeta {
    async fn allocate(&self, req: AllocateChunkRequest) -> FsResult<AllocateChunkResponse> {
        let mut state = self.0.lock().unwrap();
        state.allocates.push(req);
        if let Some(error) = state.alloc_failures.pop_front() {
            return Err(error);
        }
        state.next_chunk_id += 1;
        let servers = (0..state.server_count)
            .map(|i| ServerLocation::new(format!("cs{}", i + 1), 20000 + i as u32))
            .collect();
        Ok(AllocateChunkResponse {
            chunk_id: state.next_chunk_id,
            chunk_version: if state.object_store { -1 } else { 1 },
            servers,
            lease_duration: state.lease_duration,
            allow_cs_clear_text: true,
            all_cs_short_rpc: false,
            chunk_access: String::new(),
            cs_access_token: String::new(),
            cs_access_key: Bytes::new(),
            cs_access_issued: 0,
            cs_access_valid_for: 0,
        })
    }

    async fn truncate(&self, req: TruncateRequest) -> FsResult<()> {
        let mut state = self.0.lock().unwrap();
        state.truncates.push(req);
        match state.truncate_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct ChunkOp {
    kind: &'static str,
    offset: i64,
    len: usize,
}

struct ChunkState {
    ops: Vec<ChunkOp>,
    write_failures: VecDeque<FsError>,
    close_failures: VecDeque<FsError>,
    write_prep_reply_supported: bool,
    next_write_id: i64,
}

struct TestChunk(Mutex<ChunkState>);

impl TestChunk {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(ChunkState {
            ops: Vec::new(),
            write_failures: VecDeque::new(),
            close_failures: VecDeque::new(),
            write_prep_reply_supported: true,
            next_write_id: 0,
        })))
    }

    fn ops(&self) -> Vec<ChunkOp> {
        self.0.lock().unwrap().ops.clone()
    }

    fn ops_of(&self, kind: &str) -> Vec<ChunkOp> {
        self.ops().into_iter().filter(|op| op.kind == kind).collect()
    }

    fn fail_next_write(&self, error: FsError) {
        self.0.lock().unwrap().write_failures.push_back(error);
    }
}

#[async_trait]
impl ChunkTransport for TestChunk {
    async fn submit(&self, _server: &ServerLocation, req: ChunkRequest) -> FsResult<ChunkResponse> {
        let mut state = self.0.lock().unwrap();
        match req {
            ChunkRequest::WriteIdAlloc(r) => {
                state.ops.push(ChunkOp {
                    kind: "write_id_alloc",
                    offset: 0,
                    len: r.servers.len(),
                });
                let ids: Vec<WriteIdEntry> = r
                    .servers
                    .iter()
                    .map(|server| {
                        state.next_write_id += 1;
                        WriteIdEntry::new(server.clone(), state.next_write_id)
                    })
                    .collect();
                Ok(ChunkResponse::WriteIdAlloc(WriteIdAllocResponse {
                    write_prep_reply_supported: state.write_prep_reply_supported,
                    write_ids: format_write_ids(&ids),
                    access: Default::default(),
                }))
            }
            ChunkRequest::WritePrepare(r) => {
                assert_eq!(r.data.len(), r.len);
                if r.len == 0 {
                    state.ops.push(ChunkOp {
                        kind: "lease_renew",
                        offset: 0,
                        len: 0,
                    });
                } else {
                    state.ops.push(ChunkOp {
                        kind: "write_prepare",
                        offset: r.offset,
                        len: r.len,
                    });
                    if let Some(error) = state.write_failures.pop_front() {
                        return Err(error);
                    }
                }
                Ok(ChunkResponse::WritePrepare(WritePrepareResponse::default()))
            }
            ChunkRequest::WriteSync(r) => {
                state.ops.push(ChunkOp {
                    kind: "write_sync",
                    offset: r.offset,
                    len: r.len,
                });
                Ok(ChunkResponse::WriteSync)
            }
            ChunkRequest::Close(_) => {
                state.ops.push(ChunkOp {
                    kind: "close",
                    offset: 0,
                    len: 0,
                });
                match state.close_failures.pop_front() {
                    Some(error) => Err(error),
                    None => Ok(ChunkResponse::Close),
                }
            }
        }
    }
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(i32, i64, i64)>>>);

impl Completion for Recorder {
    fn done(&mut self, error_code: i32, offset: i64, size: i64) {
        self.0.lock().unwrap().push((error_code, offset, size));
    }
}

impl Recorder {
    fn all(&self) -> Vec<(i32, i64, i64)> {
        self.0.lock().unwrap().clone()
    }

    fn acked_bytes(&self) -> i64 {
        self.all()
            .iter()
            .filter(|(e, _, _)| *e == 0)
            .map(|(_, _, s)| s)
            .sum()
    }
}

fn new_writer(meta: Arc<TestMeta>, chunk: Arc<TestChunk>, conf: WriterConf) -> (Writer, Recorder) {
    let recorder = Recorder::default();
    let writer = Writer::new(
        meta,
        chunk,
        Some(Box::new(recorder.clone())),
        conf,
        "test",
    );
    (writer, recorder)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn replicated_write_flush_close() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer
        .open(OpenSpec::replicated(1, "/a", 3))
        .await
        .unwrap();
    let data = vec![0xabu8; 102_400];
    let accepted = writer.write_slice(&data, 0, true).await.unwrap();
    assert_eq!(accepted, 102_400);

    wait_until(|| writer.pending_size() == 0).await;
    assert_eq!(recorder.acked_bytes(), 102_400);

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;

    assert_eq!(meta.allocates().len(), 1);
    let id_allocs = chunk.ops_of("write_id_alloc");
    assert_eq!(id_allocs.len(), 1);
    assert_eq!(id_allocs[0].len, 3);

    let mut prepares = chunk.ops_of("write_prepare");
    prepares.sort_by_key(|op| op.offset);
    let total: usize = prepares.iter().map(|op| op.len).sum();
    assert_eq!(total, 102_400);
    // Every op but the flushed tail ends on a checksum block boundary.
    for op in &prepares[..prepares.len() - 1] {
        assert_eq!((op.offset + op.len as i64) % CHECKSUM_BLOCK_SIZE, 0);
    }

    assert_eq!(chunk.ops_of("close").len(), 1);
    let truncates = meta.truncates();
    assert_eq!(truncates.len(), 1);
    assert_eq!(truncates[0].file_offset, 102_400);

    let done = recorder.all();
    assert_eq!(done.last(), Some(&(0, 0, 0)));
    assert_eq!(writer.error_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn small_appends_compact_once() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let mut conf = WriterConf::default();
    conf.max_partial_buffers = 2;
    conf.fragment_size = 512;
    let (writer, _recorder) = new_writer(meta.clone(), chunk.clone(), conf);

    writer
        .open(OpenSpec::replicated(2, "/b", 3))
        .await
        .unwrap();
    for i in 0..3i64 {
        let data = vec![i as u8; 1024];
        writer.write_slice(&data, i * 1024, false).await.unwrap();
    }

    let stats = writer.stats().await.unwrap();
    assert_eq!(stats.buffer_compaction_count, 1);
    // Everything below the write threshold stays staged.
    assert_eq!(writer.pending_size(), 3 * 1024);
    assert!(meta.allocates().is_empty());

    writer.stop().await.unwrap();
    assert_eq!(writer.pending_size(), 0);
}

#[tokio::test(start_paused = true)]
async fn chunk_boundary_write_splits_between_workers() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer
        .open(OpenSpec::replicated(3, "/c", 3))
        .await
        .unwrap();
    let data = vec![7u8; 8192];
    writer
        .write_slice(&data, CHUNK_SIZE - 4096, true)
        .await
        .unwrap();

    wait_until(|| writer.pending_size() == 0).await;
    assert_eq!(recorder.acked_bytes(), 8192);

    let mut offsets: Vec<i64> = meta.allocates().iter().map(|a| a.file_offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, CHUNK_SIZE]);

    let mut prepares = chunk.ops_of("write_prepare");
    prepares.sort_by_key(|op| op.offset);
    assert_eq!(prepares.len(), 2);
    // Chunk relative offsets: the tail of chunk 0 and the head of chunk 1.
    assert_eq!(
        (prepares[0].offset, prepares[0].len),
        (CHUNK_SIZE - 4096, 4096)
    );
    assert_eq!((prepares[1].offset, prepares[1].len), (0, 4096));

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;
    assert_eq!(meta.truncates().len(), 1);
    assert_eq!(meta.truncates()[0].file_offset, CHUNK_SIZE + 4096);
}

#[tokio::test(start_paused = true)]
async fn retryable_write_failure_is_resent() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    chunk.fail_next_write(FsError::io("injected"));
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer
        .open(OpenSpec::replicated(4, "/d", 3))
        .await
        .unwrap();
    let data = vec![1u8; CHECKSUM_BLOCK_SIZE as usize];
    writer.write_slice(&data, 0, true).await.unwrap();

    wait_until(|| writer.pending_size() == 0).await;
    assert_eq!(recorder.acked_bytes(), CHECKSUM_BLOCK_SIZE);
    assert_eq!(writer.error_code(), 0);

    // The failed op restarted from allocation and was re-sent unchanged.
    assert_eq!(meta.allocates().len(), 2);
    assert_eq!(chunk.ops_of("write_id_alloc").len(), 2);
    let prepares = chunk.ops_of("write_prepare");
    assert_eq!(prepares.len(), 2);
    assert_eq!(prepares[0].offset, prepares[1].offset);
    assert_eq!(prepares[0].len, prepares[1].len);

    let stats = writer.stats().await.unwrap();
    assert_eq!(stats.retries_count, 1);
    assert_eq!(
        stats.sleep_time_sec,
        WriterConf::default().time_between_retries.as_secs()
    );

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;
}

#[tokio::test(start_paused = true)]
async fn lease_expiry_restarts_from_allocation() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer
        .open(OpenSpec::replicated(5, "/e", 3))
        .await
        .unwrap();
    let block = vec![2u8; CHECKSUM_BLOCK_SIZE as usize];
    writer.write_slice(&block, 0, true).await.unwrap();
    wait_until(|| writer.pending_size() == 0).await;
    assert_eq!(meta.allocates().len(), 1);

    // Push the clock past the lease renewal edge; the worker must restart
    // from chunk allocation with fresh write ids.
    tokio::time::advance(Duration::from_secs(250)).await;

    writer
        .write_slice(&block, CHECKSUM_BLOCK_SIZE, true)
        .await
        .unwrap();
    wait_until(|| writer.pending_size() == 0).await;

    assert_eq!(recorder.acked_bytes(), 2 * CHECKSUM_BLOCK_SIZE);
    assert_eq!(meta.allocates().len(), 2);
    assert_eq!(chunk.ops_of("write_id_alloc").len(), 2);
    assert_eq!(chunk.ops_of("write_prepare").len(), 2);

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_latches_fatal_error() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    chunk.fail_next_write(FsError::io("injected"));
    chunk.fail_next_write(FsError::io("injected"));
    let mut conf = WriterConf::default();
    conf.max_retry = 1;
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), conf);

    writer
        .open(OpenSpec::replicated(15, "/o", 3))
        .await
        .unwrap();
    writer
        .write_slice(&[1u8; 4096], 0, true)
        .await
        .unwrap();

    // One retry is allowed; the second failure is fatal.
    wait_until(|| writer.error_code() != 0).await;
    assert_eq!(writer.error_code(), CODE_IO);
    assert!(recorder.all().contains(&(CODE_IO, 0, 0)));

    let err = writer.write_slice(&[2u8; 16], 4096, false).await.unwrap_err();
    assert_eq!(err.code(), CODE_IO);

    let stats = writer.stats().await.unwrap();
    assert_eq!(stats.retries_count, 1);

    writer.stop().await.unwrap();
}

/// Striper that forwards bytes unchanged and refuses write retries.
struct NoRetryStriper {
    size: i64,
    pending: i64,
}

impl Striper for NoRetryStriper {
    fn process(
        &mut self,
        sink: &mut dyn StriperSink,
        buf: &mut ByteQueue,
        offset: &mut i64,
        write_threshold: usize,
    ) -> FsResult<()> {
        while !buf.is_empty() {
            let size = buf.bytes_available() as i64;
            let queued = sink.queue_write(buf, size, *offset, write_threshold);
            if queued <= 0 {
                break;
            }
            *offset += queued;
            self.size = self.size.max(*offset);
            sink.start_queued_write(queued);
        }
        Ok(())
    }

    fn file_size(&self) -> i64 {
        self.size
    }

    fn pending_size(&self) -> i64 {
        self.pending
    }

    fn is_write_retry_needed(
        &self,
        _file_offset: i64,
        _retry_count: i32,
        _max_retry: i32,
        _status: i32,
    ) -> bool {
        false
    }
}

#[tokio::test(start_paused = true)]
async fn striper_invalidation_reports_pending_with_error() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    chunk.fail_next_write(FsError::io("injected"));
    let mut conf = WriterConf::default();
    conf.max_retry = 0;
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), conf);

    let mut spec = OpenSpec::replicated(6, "/f", 3);
    spec.stripe_count = 1;
    let striper = Box::new(NoRetryStriper {
        size: 0,
        pending: 0,
    });
    writer
        .open_with_striper(spec, striper, CHUNK_SIZE)
        .await
        .unwrap();

    let data = vec![3u8; CHECKSUM_BLOCK_SIZE as usize];
    writer.write_slice(&data, 0, true).await.unwrap();

    wait_until(|| writer.error_code() != 0).await;
    wait_until(|| writer.pending_size() == 0).await;

    // The failed allocate sequence ends with an invalidation allocate.
    let allocates = meta.allocates();
    assert_eq!(allocates.len(), 2);
    assert!(!allocates[0].invalidate_all);
    assert!(allocates[1].invalidate_all);

    // All pending bytes are reported as completed with the error latched.
    assert!(recorder
        .all()
        .contains(&(CODE_IO, 0, CHECKSUM_BLOCK_SIZE)));
    assert_eq!(writer.error_code(), CODE_IO);

    writer.shutdown().await.unwrap();
    assert!(!writer.is_open());
}

#[tokio::test(start_paused = true)]
async fn object_store_rejects_non_sequential_writes() {
    let meta = TestMeta::new(1, true);
    let chunk = TestChunk::new();
    let (writer, _recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer.open(OpenSpec::object_store(7, "/g")).await.unwrap();
    let err = writer
        .write_slice(&[1, 2, 3], 100, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), CODE_SEEK);
    assert!(meta.allocates().is_empty());

    // Overwrite via open is rejected the same way.
    let mut spec = OpenSpec::object_store(8, "/h");
    spec.file_size = 10;
    let writer2 = Writer::new(
        meta.clone(),
        chunk.clone(),
        None,
        WriterConf::default(),
        "test2",
    );
    assert_eq!(writer2.open(spec).await.unwrap_err().code(), CODE_SEEK);
}

#[tokio::test(start_paused = true)]
async fn object_store_commits_on_close_without_truncate() {
    let meta = TestMeta::new(1, true);
    let chunk = TestChunk::new();
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer.open(OpenSpec::object_store(9, "/i")).await.unwrap();
    let data = vec![5u8; 4096];
    writer.write_slice(&data, 0, true).await.unwrap();
    wait_until(|| writer.pending_size() == 0).await;

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;

    assert_eq!(chunk.ops_of("close").len(), 1);
    assert!(meta.truncates().is_empty());
    assert_eq!(recorder.all().last(), Some(&(0, 0, 0)));
}

#[tokio::test(start_paused = true)]
async fn object_store_lease_is_renewed_while_idle() {
    let meta = TestMeta::new(1, true);
    let chunk = TestChunk::new();
    let (writer, _recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer.open(OpenSpec::object_store(10, "/j")).await.unwrap();
    writer
        .write_slice(&[9u8; 1024], 0, true)
        .await
        .unwrap();
    wait_until(|| writer.pending_size() == 0).await;

    // The worker holds the block lease while idle and renews it with a
    // zero-byte write prepare before it expires.
    tokio::time::sleep(Duration::from_secs(210)).await;
    wait_until(|| !chunk.ops_of("lease_renew").is_empty()).await;

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;
    assert_eq!(chunk.ops_of("close").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sub_threshold_tail_stays_staged_until_flush() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let mut conf = WriterConf::default();
    conf.write_threshold = CHECKSUM_BLOCK_SIZE as usize;
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), conf);

    writer
        .open(OpenSpec::replicated(11, "/k", 3))
        .await
        .unwrap();
    let len = 3 * CHECKSUM_BLOCK_SIZE as usize + 3392;
    let data = vec![4u8; len];
    writer.write_slice(&data, 0, false).await.unwrap();

    wait_until(|| writer.pending_size() == 3392).await;
    let prepares = chunk.ops_of("write_prepare");
    assert_eq!(prepares.len(), 1);
    assert_eq!(prepares[0].len, 3 * CHECKSUM_BLOCK_SIZE as usize);

    writer.flush().await.unwrap();
    wait_until(|| writer.pending_size() == 0).await;
    assert_eq!(recorder.acked_bytes(), len as i64);
    let prepares = chunk.ops_of("write_prepare");
    assert_eq!(prepares.len(), 2);
    assert_eq!(prepares[1].offset, 3 * CHECKSUM_BLOCK_SIZE);
    assert_eq!(prepares[1].len, 3392);

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;
}

#[tokio::test(start_paused = true)]
async fn truncate_failure_is_retried() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    meta.fail_next_truncate(FsError::io("injected"));
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer
        .open(OpenSpec::replicated(12, "/l", 3))
        .await
        .unwrap();
    writer
        .write_slice(&[6u8; 8192], 0, true)
        .await
        .unwrap();
    wait_until(|| writer.pending_size() == 0).await;

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;

    assert_eq!(meta.truncates().len(), 2);
    assert_eq!(meta.truncates()[1].file_offset, 8192);
    assert_eq!(writer.error_code(), 0);
    assert_eq!(recorder.all().last(), Some(&(0, 0, 0)));
}

#[tokio::test(start_paused = true)]
async fn striped_file_spreads_units_across_chunks() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let (writer, recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    let mut spec = OpenSpec::replicated(14, "/n", 3);
    spec.striper_type = StriperType::Striped;
    spec.stripe_count = 2;
    spec.stripe_size = 4096;
    writer.open(spec).await.unwrap();

    let data = vec![0x5au8; 8192];
    writer.write_slice(&data, 0, true).await.unwrap();
    wait_until(|| writer.pending_size() == 0).await;
    assert_eq!(recorder.acked_bytes(), 8192);

    // One stripe unit lands in each data chunk of the chunk block.
    let mut offsets: Vec<i64> = meta.allocates().iter().map(|a| a.file_offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, CHUNK_SIZE]);

    writer.close().await.unwrap();
    wait_until(|| !writer.is_open()).await;

    // Truncate targets the logical size, not the physical layout.
    assert_eq!(meta.truncates().len(), 1);
    assert_eq!(meta.truncates()[0].file_offset, 8192);
    assert_eq!(recorder.all().last(), Some(&(0, 0, 0)));
}

#[tokio::test(start_paused = true)]
async fn write_id_alloc_goes_to_all_replicas_in_order() {
    let meta = TestMeta::new(3, false);
    let chunk = TestChunk::new();
    let (writer, _recorder) = new_writer(meta.clone(), chunk.clone(), WriterConf::default());

    writer
        .open(OpenSpec::replicated(13, "/m", 3))
        .await
        .unwrap();
    writer
        .write_slice(&[8u8; 1024], 0, true)
        .await
        .unwrap();
    wait_until(|| writer.pending_size() == 0).await;

    let id_allocs = chunk.ops_of("write_id_alloc");
    assert_eq!(id_allocs.len(), 1);
    assert_eq!(id_allocs[0].len, 3);

    writer.stop().await.unwrap();
}
