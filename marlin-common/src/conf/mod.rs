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

use crate::state::{CHECKSUM_BLOCK_SIZE, CHUNK_SIZE};
use crate::utils::DurationUnit;
use crate::FsResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-side write pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConf {
    // Retries of a single logical operation before the writer gives up.
    pub max_retry: i32,

    #[serde(skip)]
    pub time_between_retries: Duration,
    #[serde(alias = "time_between_retries")]
    pub time_between_retries_str: String,

    // Timeout of one chunk server operation.
    #[serde(skip)]
    pub op_timeout: Duration,
    #[serde(alias = "op_timeout")]
    pub op_timeout_str: String,

    #[serde(skip)]
    pub meta_op_timeout: Duration,
    #[serde(alias = "meta_op_timeout")]
    pub meta_op_timeout_str: String,

    // Connection idle disconnect.
    #[serde(skip)]
    pub idle_timeout: Duration,
    #[serde(alias = "idle_timeout")]
    pub idle_timeout_str: String,

    // Bytes buffered before write RPCs start. A flush always drains.
    pub write_threshold: usize,

    // Upper bound of a single write RPC payload. Rounded up to a checksum
    // block multiple and capped at the chunk size.
    pub max_write_size: usize,

    // Reference-moved application buffers tolerated before the staging queue
    // is compacted. Negative disables compaction.
    pub max_partial_buffers: i32,

    // Allocation unit of the staging queue.
    pub fragment_size: usize,

    pub allow_cs_clear_text: bool,
}

impl WriterConf {
    pub fn init(&mut self) -> FsResult<()> {
        self.time_between_retries =
            DurationUnit::from_str(&self.time_between_retries_str)?.as_duration();
        self.op_timeout = DurationUnit::from_str(&self.op_timeout_str)?.as_duration();
        self.meta_op_timeout = DurationUnit::from_str(&self.meta_op_timeout_str)?.as_duration();
        self.idle_timeout = DurationUnit::from_str(&self.idle_timeout_str)?.as_duration();

        let block = CHECKSUM_BLOCK_SIZE as usize;
        self.max_write_size = self
            .max_write_size
            .max(1)
            .div_ceil(block)
            .saturating_mul(block)
            .min(CHUNK_SIZE as usize);
        self.fragment_size = self.fragment_size.max(512);
        Ok(())
    }
}

impl Default for WriterConf {
    fn default() -> Self {
        let mut conf = Self {
            max_retry: 6,

            time_between_retries: Duration::default(),
            time_between_retries_str: "15s".to_string(),

            op_timeout: Duration::default(),
            op_timeout_str: "30s".to_string(),

            meta_op_timeout: Duration::default(),
            meta_op_timeout_str: "30s".to_string(),

            idle_timeout: Duration::default(),
            idle_timeout_str: "150s".to_string(),

            write_threshold: 1024 * 1024,
            max_write_size: 1024 * 1024,
            max_partial_buffers: 16,
            fragment_size: 16 * 1024,
            allow_cs_clear_text: true,
        };
        conf.init().expect("default writer conf");
        conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rounds_max_write_size() {
        let mut conf = WriterConf {
            max_write_size: CHECKSUM_BLOCK_SIZE as usize + 1,
            ..Default::default()
        };
        conf.init().unwrap();
        assert_eq!(conf.max_write_size, 2 * CHECKSUM_BLOCK_SIZE as usize);

        conf.max_write_size = usize::MAX;
        conf.init().unwrap();
        assert_eq!(conf.max_write_size, CHUNK_SIZE as usize);
    }

    #[test]
    fn duration_fields_parse() {
        let conf = WriterConf::default();
        assert_eq!(conf.time_between_retries, Duration::from_secs(15));
        assert_eq!(conf.idle_timeout, Duration::from_secs(150));
    }
}
