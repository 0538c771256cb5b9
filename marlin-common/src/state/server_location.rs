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

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Network location of a chunk server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ServerLocation {
    pub hostname: String,
    pub port: u32,
}

impl ServerLocation {
    pub fn new(hostname: impl Into<String>, port: u32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port > 0
    }

    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl Display for ServerLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}
