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

use crate::{err_box, FsResult};
use std::time::Duration;

/// Duration literal with a unit suffix: "500ms", "30s", "10m", "6h", "2d".
/// A bare number is read as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationUnit {
    millis: u64,
}

impl DurationUnit {
    pub fn from_str(s: &str) -> FsResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return err_box!("empty duration");
        }
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let value: u64 = match num.parse() {
            Ok(v) => v,
            Err(_) => return err_box!("invalid duration {}", s),
        };
        let factor = match unit.trim() {
            "" | "ms" => 1,
            "s" => 1000,
            "m" => 60 * 1000,
            "h" => 60 * 60 * 1000,
            "d" => 24 * 60 * 60 * 1000,
            other => return err_box!("unknown duration unit {}", other),
        };
        Ok(Self {
            millis: value.saturating_mul(factor),
        })
    }

    pub fn as_millis(&self) -> u64 {
        self.millis
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_units() {
        assert_eq!(DurationUnit::from_str("250").unwrap().as_millis(), 250);
        assert_eq!(DurationUnit::from_str("250ms").unwrap().as_millis(), 250);
        assert_eq!(DurationUnit::from_str("30s").unwrap().as_millis(), 30_000);
        assert_eq!(DurationUnit::from_str("10m").unwrap().as_millis(), 600_000);
        assert_eq!(
            DurationUnit::from_str("6h").unwrap().as_duration(),
            Duration::from_secs(6 * 3600)
        );
        assert!(DurationUnit::from_str("10x").is_err());
        assert!(DurationUnit::from_str("").is_err());
    }
}
