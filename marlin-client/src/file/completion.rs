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

/// Application-visible write acknowledgement sink.
///
/// `done` fires for every acknowledged byte range (`offset` is the byte
/// offset within the file), for stripe invalidation (with the writer error
/// code latched), and exactly once with `(0, 0)` when the file finishes
/// closing.
pub trait Completion: Send {
    fn done(&mut self, error_code: i32, offset: i64, size: i64);

    /// Called when another completion sink replaces this one.
    fn unregistered(&mut self) {}
}
