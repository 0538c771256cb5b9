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

use bytes::Bytes;
use marlin_common::state::{ServerLocation, WriteIdEntry};

#[derive(Debug, Clone, Default)]
pub struct AllocateChunkRequest {
    pub fid: i64,
    pub path: String,
    pub file_offset: i64,
    /// Ask the meta server to drop the chunk instead of allocating it; used
    /// when a striper decided the stripe is not worth retrying.
    pub invalidate_all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AllocateChunkResponse {
    pub chunk_id: i64,
    /// Negative versions denote object store blocks (append-only,
    /// commit-on-close).
    pub chunk_version: i64,
    /// Ordered; element 0 is the write master.
    pub servers: Vec<ServerLocation>,
    /// Seconds; negative when the server did not grant a bounded lease.
    pub lease_duration: i64,
    pub allow_cs_clear_text: bool,
    pub all_cs_short_rpc: bool,
    pub chunk_access: String,
    pub cs_access_token: String,
    pub cs_access_key: Bytes,
    pub cs_access_issued: i64,
    pub cs_access_valid_for: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TruncateRequest {
    pub fid: i64,
    pub path: String,
    pub file_offset: i64,
}

/// Access token material attached to every chunk server operation.
#[derive(Debug, Clone, Default)]
pub struct AccessFields {
    pub access: String,
    pub create_chunk_access: bool,
    pub create_cs_access: bool,
    /// First write id of the chunk, when known; token subjects include it.
    pub subject_id: Option<i64>,
    pub decrypt_key: Option<Bytes>,
}

/// Refreshed access material a chunk server may return on any operation.
#[derive(Debug, Clone, Default)]
pub struct AccessUpdate {
    /// Empty when the response carried no new chunk access.
    pub chunk_access: String,
    pub issued: i64,
    pub valid_for: i64,
    /// Empty when the response carried no new chunk server access.
    pub cs_access_id: String,
    pub cs_access_key: Bytes,
}

impl AccessUpdate {
    pub fn has_chunk_access(&self) -> bool {
        !self.chunk_access.is_empty()
    }

    pub fn has_cs_access(&self) -> bool {
        self.valid_for > 0 && !self.cs_access_id.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteIdAllocRequest {
    pub chunk_id: i64,
    pub chunk_version: i64,
    pub servers: Vec<ServerLocation>,
    pub access: AccessFields,
}

#[derive(Debug, Clone, Default)]
pub struct WriteIdAllocResponse {
    pub write_prep_reply_supported: bool,
    /// Whitespace separated `host port write_id` triples, one per chunk
    /// server, in request order.
    pub write_ids: String,
    pub access: AccessUpdate,
}

#[derive(Debug, Clone, Default)]
pub struct WritePrepareRequest {
    pub chunk_id: i64,
    pub chunk_version: i64,
    pub offset: i64,
    pub len: usize,
    /// Combined prepare+sync: the master replies directly and no separate
    /// sync is sent.
    pub reply_requested: bool,
    /// Aggregate checksum in reply-requested mode.
    pub checksum: Option<u32>,
    /// Per checksum-block CRCs otherwise.
    pub checksums: Vec<u32>,
    pub write_ids: Vec<WriteIdEntry>,
    pub access: AccessFields,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct WritePrepareResponse {
    pub access: AccessUpdate,
}

#[derive(Debug, Clone, Default)]
pub struct WriteSyncRequest {
    pub chunk_id: i64,
    pub chunk_version: i64,
    pub offset: i64,
    pub len: usize,
    pub checksums: Vec<u32>,
    pub write_ids: Vec<WriteIdEntry>,
    pub access: AccessFields,
}

#[derive(Debug, Clone, Default)]
pub struct CloseChunkRequest {
    pub chunk_id: i64,
    pub chunk_version: i64,
    pub write_ids: Vec<WriteIdEntry>,
    /// Targets when no write ids were ever allocated.
    pub servers: Vec<ServerLocation>,
    pub access: AccessFields,
}

#[derive(Debug)]
pub enum ChunkRequest {
    WriteIdAlloc(WriteIdAllocRequest),
    WritePrepare(WritePrepareRequest),
    WriteSync(WriteSyncRequest),
    Close(CloseChunkRequest),
}

#[derive(Debug)]
pub enum ChunkResponse {
    WriteIdAlloc(WriteIdAllocResponse),
    WritePrepare(WritePrepareResponse),
    WriteSync,
    Close,
}

impl ChunkResponse {
    pub fn access_update(&self) -> Option<&AccessUpdate> {
        match self {
            ChunkResponse::WriteIdAlloc(r) => Some(&r.access),
            ChunkResponse::WritePrepare(r) => Some(&r.access),
            ChunkResponse::WriteSync | ChunkResponse::Close => None,
        }
    }
}

/// Parse a write-id allocation reply body. Every chunk server contributes one
/// `host port write_id` triple; a count mismatch is a protocol failure the
/// caller turns into a retry.
pub fn parse_write_ids(reply: &str, expected: usize) -> Option<Vec<WriteIdEntry>> {
    let mut fields = reply.split_ascii_whitespace();
    let mut out = Vec::with_capacity(expected);
    for _ in 0..expected {
        let host = fields.next()?;
        let port: u32 = fields.next()?.parse().ok()?;
        let write_id: i64 = fields.next()?.parse().ok()?;
        out.push(WriteIdEntry::new(ServerLocation::new(host, port), write_id));
    }
    Some(out)
}

/// Render write ids in the wire form consumed by `parse_write_ids`.
pub fn format_write_ids(ids: &[WriteIdEntry]) -> String {
    let mut out = String::new();
    for entry in ids {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!(
            "{} {} {}",
            entry.server.hostname, entry.server.port, entry.write_id
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_id_round_trip() {
        let ids = vec![
            WriteIdEntry::new(ServerLocation::new("cs1", 20000), 101),
            WriteIdEntry::new(ServerLocation::new("cs2", 20001), 102),
        ];
        let wire = format_write_ids(&ids);
        assert_eq!(parse_write_ids(&wire, 2).unwrap(), ids);
    }

    #[test]
    fn write_id_count_mismatch() {
        let ids = vec![WriteIdEntry::new(ServerLocation::new("cs1", 20000), 101)];
        let wire = format_write_ids(&ids);
        assert!(parse_write_ids(&wire, 2).is_none());
        assert!(parse_write_ids("cs1 notaport 3", 1).is_none());
    }
}
