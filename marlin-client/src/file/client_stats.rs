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

use crate::rpc::ChunkServerStats;

/// Cumulative writer counters. Reset on open; chunk server counters are
/// folded in whenever a worker is retired.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    /// Application write calls reaching a chunk worker and their bytes.
    pub write_count: u64,
    pub write_byte_count: u64,
    /// Write RPCs issued and their bytes.
    pub ops_write_count: u64,
    pub ops_write_byte_count: u64,
    pub chunk_alloc_count: u64,
    pub alloc_retries_count: u64,
    pub retries_count: u64,
    pub meta_ops_cancelled_count: u64,
    pub sleep_time_sec: u64,
    /// Staging queue compactions forced by reference-moved buffers.
    pub buffer_compaction_count: u64,
    pub chunk_servers: ChunkServerStats,
}
