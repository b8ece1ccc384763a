// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Action result codes.

/// Daemon-specific result codes carried alongside the standard errno set.
///
/// These occupy a private range above the errno space, mirroring how the
/// wire protocol reports them (negated, e.g. `-210` for a missing lockspace).
pub const ENOLS: i32 = 210;
pub const ESTARTING: i32 = 211;
pub const ELOCALVG: i32 = 212;
pub const EOTHERVG: i32 = 213;

/// Errors that can complete an action.
///
/// Every failed action carries exactly one of these; `code()` maps it to the
/// signed integer reported as `op_result` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("no matching lock or action")]
    NotFound,

    #[error("out of memory")]
    NoMem,

    #[error("lock held elsewhere, try again")]
    Again,

    #[error("resource busy")]
    Busy,

    #[error("lock already exists")]
    Exists,

    #[error("invalid request")]
    Invalid,

    #[error("lock already held")]
    Already,

    #[error("stale lock state")]
    Stale,

    #[error("request canceled")]
    Canceled,

    #[error("lockspace not found")]
    NoLockspace,

    #[error("lockspace still starting")]
    Starting,

    #[error("volume group is local")]
    LocalVg,

    #[error("volume group owned by another host")]
    OtherVg,

    #[error("lock manager error {0}")]
    Manager(i32),
}

impl LockError {
    /// Returns the signed wire code for this error (always negative).
    pub fn code(self) -> i32 {
        match self {
            LockError::NotFound => -2,
            LockError::NoMem => -12,
            LockError::Again => -11,
            LockError::Busy => -16,
            LockError::Exists => -17,
            LockError::Invalid => -22,
            LockError::Already => -114,
            LockError::Stale => -116,
            LockError::Canceled => -125,
            LockError::NoLockspace => -ENOLS,
            LockError::Starting => -ESTARTING,
            LockError::LocalVg => -ELOCALVG,
            LockError::OtherVg => -EOTHERVG,
            LockError::Manager(rv) => {
                if rv < 0 {
                    rv
                } else {
                    -rv
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_negative() {
        let all = [
            LockError::NotFound,
            LockError::NoMem,
            LockError::Again,
            LockError::Busy,
            LockError::Exists,
            LockError::Invalid,
            LockError::Already,
            LockError::Stale,
            LockError::Canceled,
            LockError::NoLockspace,
            LockError::Starting,
            LockError::LocalVg,
            LockError::OtherVg,
            LockError::Manager(5),
        ];
        for e in all {
            assert!(e.code() < 0, "{:?} must map to a negative code", e);
        }
    }

    #[test]
    fn test_daemon_specific_codes() {
        assert_eq!(LockError::NoLockspace.code(), -210);
        assert_eq!(LockError::Starting.code(), -211);
        assert_eq!(LockError::LocalVg.code(), -212);
        assert_eq!(LockError::OtherVg.code(), -213);
    }

    #[test]
    fn test_manager_code_passthrough() {
        assert_eq!(LockError::Manager(-49).code(), -49);
        assert_eq!(LockError::Manager(49).code(), -49);
    }
}
