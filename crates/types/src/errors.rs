// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::borrow::Cow;
use std::fmt;

pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error codes carried by [`OperationError`]. Values follow HTTP semantics
/// where one exists.
#[derive(Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const fn new(code: u16) -> Self {
        ErrorCode(code)
    }
}

pub mod codes {
    use super::ErrorCode;

    pub const BAD_REQUEST: ErrorCode = ErrorCode::new(400);
    pub const NOT_FOUND: ErrorCode = ErrorCode::new(404);
    pub const TIMED_OUT: ErrorCode = ErrorCode::new(408);
    pub const CONFLICT: ErrorCode = ErrorCode::new(409);
    pub const ABORTED: ErrorCode = ErrorCode::new(499);
    pub const INTERNAL: ErrorCode = ErrorCode::new(500);
    /// A re-executed orchestration body issued a different sequence of calls
    /// than its journal recorded. Always a bug in the orchestration logic
    /// (non-determinism); fatal during recovery.
    pub const REPLAY_DIVERGENCE: ErrorCode = ErrorCode::new(570);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        ErrorCode(value)
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.0
    }
}

/// This struct represents errors that cross partition boundaries: a failed
/// read/update/orchestration is delivered back to its caller as one of these
/// inside the response message.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperationError {
    code: ErrorCode,
    message: Cow<'static, str>,
}

pub const STATE_NOT_FOUND_ERROR: OperationError = OperationError::new_static(
    codes::NOT_FOUND,
    "state instance does not exist and the operation is not marked create-if-not-exists",
);

pub const ABORTED_ERROR: OperationError =
    OperationError::new_static(codes::ABORTED, "orchestration aborted");

impl OperationError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<Cow<'static, str>>) -> Self {
        OperationError {
            code: code.into(),
            message: message.into(),
        }
    }

    pub const fn new_static(code: ErrorCode, message: &'static str) -> Self {
        OperationError {
            code,
            message: Cow::Borrowed(message),
        }
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    pub fn from_error(error: impl std::error::Error) -> Self {
        Self::internal(error.to_string())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl fmt::Debug for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for OperationError {}
