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

use crate::rpc::{ChunkRequest, ChunkResponse, ChunkTransport, WritePrepareRequest, WriteSyncRequest};
use bytes::Bytes;
use log::debug;
use marlin_common::state::ServerLocation;
use marlin_common::{FsError, FsResult};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcFormat {
    Short,
    Long,
}

/// Cumulative per-connection counters, merged into the writer stats when the
/// owning worker is torn down.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkServerStats {
    pub ops_enqueued: u64,
    pub ops_failed: u64,
    pub bytes_sent: u64,
}

impl ChunkServerStats {
    pub fn add(&mut self, other: &ChunkServerStats) {
        self.ops_enqueued += other.ops_enqueued;
        self.ops_failed += other.ops_failed;
        self.bytes_sent += other.bytes_sent;
    }
}

/// One chunk server connection. Holds the target location, key material, and
/// per-op timeout; every `enqueue_*` delivers exactly one completion through
/// the supplied callback. There is no retry here: a failed op is reported as
/// failed and the owning worker decides what to do.
pub struct ChunkServerClient {
    transport: Arc<dyn ChunkTransport>,
    server: Option<ServerLocation>,
    op_timeout: Duration,
    default_op_timeout: Duration,
    /// Connection idle disconnect budget, honored by the transport.
    idle_timeout: Duration,
    shutdown_ssl: bool,
    rpc_format: RpcFormat,
    key: Option<(String, Bytes)>,
    session_key: Bytes,
    retry_connect_only: bool,
    stats: ChunkServerStats,
}

impl ChunkServerClient {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        op_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            server: None,
            op_timeout,
            default_op_timeout: op_timeout,
            idle_timeout,
            shutdown_ssl: false,
            rpc_format: RpcFormat::Long,
            key: None,
            session_key: Bytes::new(),
            retry_connect_only: false,
            stats: ChunkServerStats::default(),
        }
    }

    /// Point the connection at a server. Pending op cancellation is the
    /// caller's job (it owns completion routing); this only swaps the target.
    pub fn set_server(&mut self, server: ServerLocation, _cancel_pending: bool) -> bool {
        if !server.is_valid() {
            return false;
        }
        self.session_key = Bytes::from(format!("session-{}", server.connect_addr()));
        self.server = Some(server);
        true
    }

    pub fn server(&self) -> Option<&ServerLocation> {
        self.server.as_ref()
    }

    pub fn stop(&mut self) {
        self.server = None;
    }

    pub fn set_key(&mut self, id: impl Into<String>, key: Bytes) {
        self.key = Some((id.into(), key));
    }

    pub fn clear_key(&mut self) {
        self.key = None;
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn set_shutdown_ssl(&mut self, shutdown: bool) {
        self.shutdown_ssl = shutdown;
    }

    pub fn is_shutdown_ssl(&self) -> bool {
        self.shutdown_ssl
    }

    pub fn set_rpc_format(&mut self, format: RpcFormat) {
        self.rpc_format = format;
    }

    pub fn rpc_format(&self) -> RpcFormat {
        self.rpc_format
    }

    pub fn set_retry_connect_only(&mut self, value: bool) {
        self.retry_connect_only = value;
    }

    pub fn retry_connect_only(&self) -> bool {
        self.retry_connect_only
    }

    pub fn set_op_timeout(&mut self, timeout: Duration) {
        self.op_timeout = timeout;
    }

    pub fn restore_op_timeout(&mut self) {
        self.op_timeout = self.default_op_timeout;
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// TLS session key of the current connection, used to wrap access key
    /// material when the server downgrades to clear text after handshake.
    pub fn session_key(&self) -> Bytes {
        self.session_key.clone()
    }

    pub fn stats(&self) -> ChunkServerStats {
        self.stats
    }

    pub fn note_op_failed(&mut self) {
        self.stats.ops_failed += 1;
    }

    /// Enqueue a single-exchange operation. Returns false without invoking
    /// the callback when no server is configured.
    pub fn enqueue<F>(&mut self, req: ChunkRequest, done: F) -> bool
    where
        F: FnOnce(FsResult<ChunkResponse>) + Send + 'static,
    {
        let Some(server) = self.server.clone() else {
            return false;
        };
        self.stats.ops_enqueued += 1;
        let transport = self.transport.clone();
        let timeout = self.op_timeout;
        tokio::spawn(async move {
            done(Self::submit(transport, server, timeout, req).await);
        });
        true
    }

    /// Enqueue a write. In reply-requested mode the prepare is the whole
    /// exchange; otherwise a sync follows the prepare on the same connection
    /// and the pair completes as one operation.
    pub fn enqueue_write<F>(
        &mut self,
        prepare: WritePrepareRequest,
        sync: Option<WriteSyncRequest>,
        done: F,
    ) -> bool
    where
        F: FnOnce(FsResult<ChunkResponse>) + Send + 'static,
    {
        let Some(server) = self.server.clone() else {
            return false;
        };
        self.stats.ops_enqueued += 1;
        self.stats.bytes_sent += prepare.len as u64;
        let transport = self.transport.clone();
        let timeout = self.op_timeout;
        tokio::spawn(async move {
            let prep_result =
                Self::submit(transport.clone(), server.clone(), timeout, ChunkRequest::WritePrepare(prepare))
                    .await;
            let result = match (prep_result, sync) {
                (Ok(rep), None) => Ok(rep),
                (Ok(_), Some(sync)) => {
                    Self::submit(transport, server, timeout, ChunkRequest::WriteSync(sync)).await
                }
                (Err(e), _) => Err(e),
            };
            done(result);
        });
        true
    }

    async fn submit(
        transport: Arc<dyn ChunkTransport>,
        server: ServerLocation,
        timeout: Duration,
        req: ChunkRequest,
    ) -> FsResult<ChunkResponse> {
        debug!("cs +> {} {:?}", server, op_name(&req));
        match tokio::time::timeout(timeout, transport.submit(&server, req)).await {
            Ok(res) => res.map_err(|e| e.ctx(format!("chunk server {}", server))),
            Err(_) => Err(FsError::io(format!(
                "chunk op to {} timed out after {:?}",
                server, timeout
            ))),
        }
    }
}

fn op_name(req: &ChunkRequest) -> &'static str {
    match req {
        ChunkRequest::WriteIdAlloc(_) => "write_id_alloc",
        ChunkRequest::WritePrepare(_) => "write_prepare",
        ChunkRequest::WriteSync(_) => "write_sync",
        ChunkRequest::Close(_) => "close",
    }
}
