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

use crate::rpc::{AllocateChunkRequest, AllocateChunkResponse, TruncateRequest};
use async_trait::async_trait;
use log::debug;
use marlin_common::{FsError, FsResult};
use std::sync::Arc;
use std::time::Duration;

/// Meta server operations the write pipeline depends on. Implementations own
/// connection management and leader discovery; one call is one logical
/// operation with exactly one outcome.
#[async_trait]
pub trait MetaTransport: Send + Sync {
    async fn allocate(&self, req: AllocateChunkRequest) -> FsResult<AllocateChunkResponse>;

    async fn truncate(&self, req: TruncateRequest) -> FsResult<()>;
}

/// Timeout-bounded wrapper over a [`MetaTransport`]. Completion delivery is a
/// callback so callers can route results into their own dispatch loop.
pub struct MetaServerClient {
    transport: Arc<dyn MetaTransport>,
    op_timeout: Duration,
}

impl MetaServerClient {
    pub fn new(transport: Arc<dyn MetaTransport>, op_timeout: Duration) -> Self {
        Self {
            transport,
            op_timeout,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Enqueue an allocate. `extra_timeout` widens the budget for operations
    /// that may trigger a chunk version change on the server side.
    pub fn enqueue_allocate<F>(&self, req: AllocateChunkRequest, extra_timeout: Duration, done: F)
    where
        F: FnOnce(FsResult<AllocateChunkResponse>) + Send + 'static,
    {
        let transport = self.transport.clone();
        let timeout = self.op_timeout + extra_timeout;
        tokio::spawn(async move {
            debug!(
                "meta +> allocate fid: {} offset: {} invalidate: {}",
                req.fid, req.file_offset, req.invalidate_all
            );
            let result = match tokio::time::timeout(timeout, transport.allocate(req)).await {
                Ok(res) => res,
                Err(_) => Err(FsError::io(format!(
                    "meta allocate timed out after {:?}",
                    timeout
                ))),
            };
            done(result);
        });
    }

    pub fn enqueue_truncate<F>(&self, req: TruncateRequest, done: F)
    where
        F: FnOnce(FsResult<()>) + Send + 'static,
    {
        let transport = self.transport.clone();
        let timeout = self.op_timeout;
        tokio::spawn(async move {
            debug!("meta +> truncate fid: {} size: {}", req.fid, req.file_offset);
            let result = match tokio::time::timeout(timeout, transport.truncate(req)).await {
                Ok(res) => res,
                Err(_) => Err(FsError::io(format!(
                    "meta truncate timed out after {:?}",
                    timeout
                ))),
            };
            done(result);
        });
    }
}
