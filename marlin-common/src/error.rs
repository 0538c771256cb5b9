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

use std::fmt::{Display, Formatter};

/// Error codes follow the negated-errno convention carried on the wire, so a
/// status received from a server round-trips through `code`/`from_code`
/// without loss.
pub const CODE_PARAMETERS: i32 = -22;
pub const CODE_TRY_AGAIN: i32 = -11;
pub const CODE_FAULT: i32 = -14;
pub const CODE_NO_ENTRY: i32 = -2;
pub const CODE_READ_ONLY: i32 = -30;
pub const CODE_SEEK: i32 = -29;
pub const CODE_IO: i32 = -5;
/// Reported by a transport when it exhausted its own connection attempts.
/// Never surfaced to the application; the write pipeline re-maps it.
pub const CODE_MAX_RETRY_REACHED: i32 = -10010;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    Parameters(String),
    TryAgain(String),
    Fault(String),
    NoEntry(String),
    ReadOnly(String),
    Seek(String),
    Io(String),
    /// Transport gave up on its own; `last_error` is the last wire status it
    /// observed before doing so.
    MaxRetryReached { last_error: i32, msg: String },
    Common(String),
}

impl FsError {
    pub fn common(msg: impl Into<String>) -> Self {
        FsError::Common(msg.into())
    }

    pub fn parameters(msg: impl Into<String>) -> Self {
        FsError::Parameters(msg.into())
    }

    pub fn try_again(msg: impl Into<String>) -> Self {
        FsError::TryAgain(msg.into())
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        FsError::Fault(msg.into())
    }

    pub fn no_entry(msg: impl Into<String>) -> Self {
        FsError::NoEntry(msg.into())
    }

    pub fn read_only(msg: impl Into<String>) -> Self {
        FsError::ReadOnly(msg.into())
    }

    pub fn seek(msg: impl Into<String>) -> Self {
        FsError::Seek(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        FsError::Io(msg.into())
    }

    pub fn max_retry_reached(last_error: i32, msg: impl Into<String>) -> Self {
        FsError::MaxRetryReached {
            last_error,
            msg: msg.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FsError::Parameters(_) => CODE_PARAMETERS,
            FsError::TryAgain(_) => CODE_TRY_AGAIN,
            FsError::Fault(_) => CODE_FAULT,
            FsError::NoEntry(_) => CODE_NO_ENTRY,
            FsError::ReadOnly(_) => CODE_READ_ONLY,
            FsError::Seek(_) => CODE_SEEK,
            FsError::Io(_) => CODE_IO,
            FsError::MaxRetryReached { .. } => CODE_MAX_RETRY_REACHED,
            FsError::Common(_) => CODE_IO,
        }
    }

    pub fn from_code(code: i32, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            CODE_PARAMETERS => FsError::Parameters(msg),
            CODE_TRY_AGAIN => FsError::TryAgain(msg),
            CODE_FAULT => FsError::Fault(msg),
            CODE_NO_ENTRY => FsError::NoEntry(msg),
            CODE_READ_ONLY => FsError::ReadOnly(msg),
            CODE_SEEK => FsError::Seek(msg),
            CODE_IO => FsError::Io(msg),
            CODE_MAX_RETRY_REACHED => FsError::MaxRetryReached {
                last_error: 0,
                msg,
            },
            _ => FsError::Common(msg),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FsError::Parameters(m)
            | FsError::TryAgain(m)
            | FsError::Fault(m)
            | FsError::NoEntry(m)
            | FsError::ReadOnly(m)
            | FsError::Seek(m)
            | FsError::Io(m)
            | FsError::MaxRetryReached { msg: m, .. }
            | FsError::Common(m) => m,
        }
    }

    /// Prepend calling context, keeping the error kind.
    pub fn ctx(self, context: impl Display) -> Self {
        let msg = format!("{}: {}", context, self.message());
        match self {
            FsError::Parameters(_) => FsError::Parameters(msg),
            FsError::TryAgain(_) => FsError::TryAgain(msg),
            FsError::Fault(_) => FsError::Fault(msg),
            FsError::NoEntry(_) => FsError::NoEntry(msg),
            FsError::ReadOnly(_) => FsError::ReadOnly(msg),
            FsError::Seek(_) => FsError::Seek(msg),
            FsError::Io(_) => FsError::Io(msg),
            FsError::MaxRetryReached { last_error, .. } => FsError::MaxRetryReached {
                last_error,
                msg,
            },
            FsError::Common(_) => FsError::Common(msg),
        }
    }
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status {})", self.message(), self.code())
    }
}

impl std::error::Error for FsError {}

/// Shorthand for returning a formatted `FsError::Common` error.
#[macro_export]
macro_rules! err_box {
    ($($arg:tt)*) => {
        Err($crate::FsError::common(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in [
            CODE_PARAMETERS,
            CODE_TRY_AGAIN,
            CODE_FAULT,
            CODE_NO_ENTRY,
            CODE_READ_ONLY,
            CODE_SEEK,
            CODE_IO,
        ] {
            assert_eq!(FsError::from_code(code, "m").code(), code);
        }
    }

    #[test]
    fn ctx_keeps_kind() {
        let e = FsError::seek("non sequential write").ctx("fid 7");
        assert_eq!(e.code(), CODE_SEEK);
        assert_eq!(e.message(), "fid 7: non sequential write");
    }
}
