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

use crate::rpc::{AccessFields, AccessUpdate};
use bytes::Bytes;
use marlin_common::state::LEASE_INTERVAL_SECS;

const FORCE_EXPIRED_SECS: i64 = 60 * 60 * 24;
const UNLIMITED_SECS: i64 = 60 * 60 * 24 * 365;

/// Chunk access and chunk-server access tokens with clock-skew-aware expiry
/// arithmetic. All times are epoch seconds supplied by the caller, which
/// keeps the arithmetic a pure function of its inputs.
#[derive(Debug, Default)]
pub struct LeaseCredentials {
    chunk_access: String,
    has_subject_id: bool,
    chunk_access_expire: i64,
    cs_access_expire: i64,
}

impl LeaseCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiry of access material issued at `issued` for `valid_for` seconds.
    /// When the issuer clock is more than three lease intervals away from
    /// ours, its timestamp is not trusted and `now` is used instead.
    pub fn expire_time(now: i64, issued: i64, valid_for: i64) -> i64 {
        let base = if (issued - now).abs() > 3 * LEASE_INTERVAL_SECS {
            now
        } else {
            issued
        };
        base + valid_for - LEASE_INTERVAL_SECS
    }

    pub fn reset_access(&mut self) {
        self.chunk_access.clear();
        self.has_subject_id = false;
        self.chunk_access_expire = 0;
        self.cs_access_expire = 0;
    }

    pub fn has_chunk_access(&self) -> bool {
        !self.chunk_access.is_empty()
    }

    /// Authentication is off: nothing ever needs refreshing.
    pub fn set_unlimited(&mut self, now: i64) {
        self.chunk_access_expire = now + UNLIMITED_SECS;
        self.cs_access_expire = self.chunk_access_expire;
    }

    /// Install the access material from an allocate reply. The allocate-issued
    /// chunk access is short lived, so its expiry is forced into the past to
    /// request a write-id-scoped token on the first chunk server op.
    pub fn init_from_allocate(
        &mut self,
        now: i64,
        chunk_access: String,
        cs_issued: i64,
        cs_valid_for: i64,
    ) {
        self.chunk_access = chunk_access;
        self.has_subject_id = false;
        self.chunk_access_expire = now - FORCE_EXPIRED_SECS;
        self.cs_access_expire = Self::expire_time(now, cs_issued, cs_valid_for);
    }

    pub fn cs_access_expired(&self, now: i64) -> bool {
        self.cs_access_expire <= now
    }

    /// Populate the access fields of an outgoing op. Expiries of requested
    /// refreshes are rolled forward to mark the request in flight; if the op
    /// fails or times out the write restarts from write id allocation, which
    /// re-seeds everything.
    pub fn fill_access(
        &mut self,
        now: i64,
        can_request: bool,
        first_write_id: Option<i64>,
    ) -> AccessFields {
        let mut fields = AccessFields {
            access: self.chunk_access.clone(),
            create_chunk_access: can_request && self.chunk_access_expire <= now,
            create_cs_access: can_request && self.cs_access_expire <= now,
            subject_id: None,
            decrypt_key: None,
        };
        if self.has_subject_id {
            fields.subject_id = first_write_id;
        }
        if fields.create_chunk_access {
            self.chunk_access_expire = now + LEASE_INTERVAL_SECS * 3 / 2;
        }
        if fields.create_cs_access {
            self.cs_access_expire = now + LEASE_INTERVAL_SECS * 3 / 2;
        }
        fields
    }

    /// Absorb refreshed access material from a response. Returns the chunk
    /// server key to install on the connection, when one was returned.
    pub fn update_access(&mut self, now: i64, update: &AccessUpdate) -> Option<(String, Bytes)> {
        if update.has_chunk_access() {
            self.has_subject_id = true;
            self.chunk_access = update.chunk_access.clone();
            self.chunk_access_expire = Self::expire_time(now, update.issued, update.valid_for);
        }
        if !update.has_cs_access() {
            return None;
        }
        self.cs_access_expire = if update.has_chunk_access() {
            self.chunk_access_expire
        } else {
            Self::expire_time(now, update.issued, update.valid_for)
        };
        Some((update.cs_access_id.clone(), update.cs_access_key.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expire_time_trusts_close_clocks() {
        let now = 10_000;
        let issued = now + 2 * LEASE_INTERVAL_SECS;
        assert_eq!(
            LeaseCredentials::expire_time(now, issued, 600),
            issued + 600 - LEASE_INTERVAL_SECS
        );
    }

    #[test]
    fn expire_time_falls_back_on_skew() {
        let now = 10_000;
        for issued in [now + 3 * LEASE_INTERVAL_SECS + 1, now - 3 * LEASE_INTERVAL_SECS - 1] {
            assert_eq!(
                LeaseCredentials::expire_time(now, issued, 600),
                now + 600 - LEASE_INTERVAL_SECS
            );
        }
    }

    #[test]
    fn fill_access_rolls_expiry_forward() {
        let now = 50_000;
        let mut lease = LeaseCredentials::new();
        lease.init_from_allocate(now, "token".into(), now, 2 * LEASE_INTERVAL_SECS);

        let fields = lease.fill_access(now, true, None);
        assert!(fields.create_chunk_access);
        assert!(!fields.create_cs_access);
        assert_eq!(fields.access, "token");
        assert_eq!(fields.subject_id, None);

        // The refresh is in flight now; the next op must not request again.
        let fields = lease.fill_access(now, true, None);
        assert!(!fields.create_chunk_access);
    }

    #[test]
    fn update_access_marks_subject_id() {
        let now = 50_000;
        let mut lease = LeaseCredentials::new();
        lease.init_from_allocate(now, "token".into(), now, 2 * LEASE_INTERVAL_SECS);

        let update = AccessUpdate {
            chunk_access: "fresh".into(),
            issued: now,
            valid_for: 2 * LEASE_INTERVAL_SECS,
            cs_access_id: "cs-id".into(),
            cs_access_key: Bytes::from_static(b"key"),
        };
        let key = lease.update_access(now, &update);
        assert_eq!(key, Some(("cs-id".into(), Bytes::from_static(b"key"))));

        let fields = lease.fill_access(now, true, Some(42));
        assert!(!fields.create_chunk_access);
        assert_eq!(fields.subject_id, Some(42));
        assert_eq!(fields.access, "fresh");
    }
}
