// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! vglockd: distributed lock coordination core for shared volume groups
//!
//! This crate provides the in-memory lock-state machine of a volume-group
//! lock daemon: the lockspace/resource/lock/action data model, the
//! per-lockspace worker protocol, and the resource-processing algorithm
//! that reconciles queued lock requests against held locks and forwards
//! non-conflicting requests to a cluster lock-manager backend (dlm or
//! sanlock) behind a small capability interface.

pub mod action;
pub mod daemon;
pub mod lm;
pub mod lockspace;
pub mod meta;

pub use action::{
    ActFlags, Action, LockError, LockType, Mode, Op, Request, ResKind, Response, ResultFlags,
    DEFAULT_MAX_RETRIES,
};
pub use daemon::{Daemon, DaemonConfig};
pub use lm::{
    LmError, LmGrant, LockManager, LsDef, MemoryLockManager, ResDef, VersionBlock,
};
pub use lockspace::{
    InactiveLs, LockSt, Lockspace, LsState, Registry, Resource, GL_LS_NAME, R_NAME_GL, R_NAME_VG,
};
pub use meta::{MetaCache, NullMetaCache, VgDef};
