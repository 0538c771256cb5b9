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

mod server_location;

pub use server_location::ServerLocation;

use serde::{Deserialize, Serialize};

/// Fixed chunk geometry. A chunk is the unit of allocation and lease
/// ownership; a checksum block is the unit over which a single CRC is
/// maintained and therefore the unit of write alignment.
pub const CHUNK_SIZE: i64 = 64 * 1024 * 1024;
pub const CHECKSUM_BLOCK_SIZE: i64 = 64 * 1024;
pub const CHECKSUM_BLOCKS_PER_CHUNK: usize = (CHUNK_SIZE / CHECKSUM_BLOCK_SIZE) as usize;

pub const LEASE_INTERVAL_SECS: i64 = 300;
pub const LEASE_RENEW_TIME_SECS: i64 = LEASE_INTERVAL_SECS / 3;

/// Per chunk-server write grant. Obtained once per (chunk, server) before the
/// first write and carried on every subsequent write RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIdEntry {
    pub server: ServerLocation,
    pub write_id: i64,
}

impl WriteIdEntry {
    pub fn new(server: ServerLocation, write_id: i64) -> Self {
        Self { server, write_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StriperType {
    #[default]
    None,
    Striped,
}

impl StriperType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(StriperType::None),
            1 => Some(StriperType::Striped),
            _ => None,
        }
    }
}
