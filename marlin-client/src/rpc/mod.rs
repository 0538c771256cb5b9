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

mod chunk_client;
mod message;
mod meta_client;

pub use chunk_client::{ChunkServerClient, ChunkServerStats, RpcFormat};
pub use message::*;
pub use meta_client::{MetaServerClient, MetaTransport};

use async_trait::async_trait;
use marlin_common::state::ServerLocation;
use marlin_common::FsResult;

/// One connection worth of chunk server transport. Implementations perform a
/// single request/response exchange; all retry policy lives above.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn submit(&self, server: &ServerLocation, req: ChunkRequest) -> FsResult<ChunkResponse>;
}
