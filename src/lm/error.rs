// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Lock-manager backend error types.

use crate::action::LockError;

/// Errors returned by a lock-manager backend.
///
/// All lock operations are non-blocking: a backend must refuse a conflicting
/// request with `Again` rather than queue it internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LmError {
    /// The lock is held by another host. `transient` is the backend's hint
    /// that the conflict is expected to clear shortly.
    #[error("lock held by another host")]
    Again { transient: bool },

    /// The global lock was forcibly disabled by another host.
    #[error("global lock disabled")]
    Disabled,

    /// The lockspace or resource is unknown to the backend.
    #[error("unknown lockspace or resource")]
    NotFound,

    /// The lockspace is already joined.
    #[error("lockspace already joined")]
    Exists,

    /// Opaque backend failure, carrying the backend's return code.
    #[error("backend failure {0}")]
    Backend(i32),
}

impl LmError {
    /// Returns the signed code reported as `lm_result` (always negative).
    pub fn code(self) -> i32 {
        match self {
            LmError::Again { .. } => -11,
            LmError::Disabled => -49,
            LmError::NotFound => -2,
            LmError::Exists => -17,
            LmError::Backend(rv) => {
                if rv < 0 {
                    rv
                } else {
                    -rv
                }
            }
        }
    }
}

impl From<LmError> for LockError {
    fn from(err: LmError) -> LockError {
        match err {
            LmError::Again { .. } => LockError::Again,
            LmError::Disabled => LockError::NoLockspace,
            LmError::NotFound => LockError::NotFound,
            LmError::Exists => LockError::Exists,
            LmError::Backend(rv) => LockError::Manager(rv),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(LmError::Again { transient: true }.code(), -11);
        assert_eq!(LmError::Disabled.code(), -49);
        assert_eq!(LmError::Backend(212).code(), -212);
    }

    #[test]
    fn test_into_lock_error() {
        assert_eq!(
            LockError::from(LmError::Again { transient: false }),
            LockError::Again
        );
        assert_eq!(LockError::from(LmError::Disabled), LockError::NoLockspace);
        assert_eq!(LockError::from(LmError::Backend(-5)), LockError::Manager(-5));
    }
}
