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

//! Client write pipeline for a chunk file system. Application bytes are
//! staged, split into checksum-block-aligned operations, and pushed to chunk
//! servers by per-chunk workers under meta-server-issued leases.

pub mod chunk;
pub mod file;
pub mod rpc;

pub use file::{Completion, OpenSpec, Writer, WriterStats};
