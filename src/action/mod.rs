// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Request/result envelope types.
//!
//! An [`Action`] represents one request, either parsed from a client or
//! synthesized internally for cleanup and maintenance. Actions carry no
//! logic of their own: they are allocated when a request arrives, queued on
//! exactly one list at a time (a lockspace's pending list, a resource's
//! pending list, the maintenance worker's inbox, or a results list), and
//! freed once their result has been delivered.
//!
//! The [`Request`] and [`Response`] types mirror the logical name=value
//! property sets exchanged with clients; the wire encoding itself is the
//! connection layer's concern.

mod error;

pub use error::{LockError, ELOCALVG, ENOLS, EOTHERVG, ESTARTING};

use std::fmt;

/// Default bound on lock-grant retries after a transient conflict.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Lock-manager type recorded for a volume group or lockspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockType {
    /// Local volume group, no distributed locking.
    #[default]
    None,
    Dlm,
    Sanlock,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::None => "none",
            LockType::Dlm => "dlm",
            LockType::Sanlock => "sanlock",
        }
    }

    /// Parses a `vg_lock_type` value. Empty means no lock type.
    pub fn parse(s: &str) -> Result<LockType, LockError> {
        match s {
            "" | "none" => Ok(LockType::None),
            "dlm" => Ok(LockType::Dlm),
            "sanlock" => Ok(LockType::Sanlock),
            _ => Err(LockError::Invalid),
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested or held lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No lock / release the lock.
    #[default]
    Unlock,
    /// Null mode, kept for wire compatibility; not grantable.
    Null,
    Shared,
    Exclusive,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Unlock => "un",
            Mode::Null => "nl",
            Mode::Shared => "sh",
            Mode::Exclusive => "ex",
        }
    }

    pub fn parse(s: &str) -> Result<Mode, LockError> {
        match s {
            "" | "un" => Ok(Mode::Unlock),
            "nl" => Ok(Mode::Null),
            "sh" => Ok(Mode::Shared),
            "ex" => Ok(Mode::Exclusive),
            _ => Err(LockError::Invalid),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of lockable object an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResKind {
    Global,
    #[default]
    Vg,
    Lv,
}

impl ResKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResKind::Global => "gl",
            ResKind::Vg => "vg",
            ResKind::Lv => "lv",
        }
    }
}

impl fmt::Display for ResKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Hello,
    Quit,
    Info,
    Dump,
    Start,
    Stop,
    StartWait,
    StopAll,
    Lock,
    Update,
    EnableGl,
    DisableGl,
    InitVg,
    InitLv,
    FreeVg,
    FreeLv,
    AddLocal,
    RemLocal,
    UpdateLocal,
    Close,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Hello => "hello",
            Op::Quit => "quit",
            Op::Info => "info",
            Op::Dump => "dump",
            Op::Start => "start",
            Op::Stop => "stop",
            Op::StartWait => "start_wait",
            Op::StopAll => "stop_all",
            Op::Lock => "lock",
            Op::Update => "update",
            Op::EnableGl => "enable_gl",
            Op::DisableGl => "disable_gl",
            Op::InitVg => "init_vg",
            Op::InitLv => "init_lv",
            Op::FreeVg => "free_vg",
            Op::FreeLv => "free_lv",
            Op::AddLocal => "add_local",
            Op::RemLocal => "rem_local",
            Op::UpdateLocal => "update_local",
            Op::Close => "close",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Op {
    fn default() -> Self {
        Op::Hello
    }
}

/// Parses a request name into an operation code and resource kind.
pub fn parse_request_name(name: &str) -> Result<(Op, ResKind), LockError> {
    let pair = match name {
        "hello" => (Op::Hello, ResKind::Vg),
        "quit" => (Op::Quit, ResKind::Vg),
        "info" => (Op::Info, ResKind::Vg),
        "dump" => (Op::Dump, ResKind::Vg),
        "lock_gl" => (Op::Lock, ResKind::Global),
        "lock_vg" => (Op::Lock, ResKind::Vg),
        "lock_lv" => (Op::Lock, ResKind::Lv),
        "start_vg" => (Op::Start, ResKind::Vg),
        "stop_vg" => (Op::Stop, ResKind::Vg),
        "start_wait" => (Op::StartWait, ResKind::Vg),
        "stop_all" => (Op::StopAll, ResKind::Vg),
        "init_vg" => (Op::InitVg, ResKind::Vg),
        "init_lv" => (Op::InitLv, ResKind::Lv),
        "free_vg" => (Op::FreeVg, ResKind::Vg),
        "free_lv" => (Op::FreeLv, ResKind::Lv),
        "vg_update" => (Op::Update, ResKind::Vg),
        "enable_gl" => (Op::EnableGl, ResKind::Global),
        "disable_gl" => (Op::DisableGl, ResKind::Global),
        "add_local" => (Op::AddLocal, ResKind::Vg),
        "rem_local" => (Op::RemLocal, ResKind::Vg),
        "update_local" => (Op::UpdateLocal, ResKind::Vg),
        _ => return Err(LockError::Invalid),
    };
    Ok(pair)
}

/// Option flags attached to an action.
///
/// The first group arrives on the wire as the `opts` comma list; the
/// remainder are set internally while the action is routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActFlags {
    pub persistent: bool,
    pub unlock_cancel: bool,
    pub next_version: bool,
    pub wait: bool,
    pub force: bool,
    pub ex_disable: bool,
    pub enable: bool,
    pub disable: bool,
    pub update_names: bool,
    pub adopt: bool,
    /// Handled by the local-VG fast path.
    pub local: bool,
    /// Routed to a stopped/failed lockspace record.
    pub inactive_ls: bool,
    /// The inactive lockspace failed to start.
    pub add_ls_error: bool,
}

impl ActFlags {
    /// Parses the wire `opts` comma list. Unknown keywords are rejected.
    pub fn parse(opts: &str) -> Result<ActFlags, LockError> {
        let mut flags = ActFlags::default();
        for word in opts.split(',') {
            match word.trim() {
                "" => {}
                "persistent" => flags.persistent = true,
                "unlock_cancel" => flags.unlock_cancel = true,
                "next_version" => flags.next_version = true,
                "wait" => flags.wait = true,
                "force" => flags.force = true,
                "ex_disable" => flags.ex_disable = true,
                "enable" => flags.enable = true,
                "disable" => flags.disable = true,
                "update_names" => flags.update_names = true,
                "adopt" => flags.adopt = true,
                _ => return Err(LockError::Invalid),
            }
        }
        Ok(flags)
    }
}

/// Flags attached to a completed result, reported as a comma list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultFlags {
    pub no_lockspaces: bool,
    pub no_gl_ls: bool,
    pub local_ls: bool,
    pub dup_gl_ls: bool,
    pub inactive_ls: bool,
    pub add_ls_error: bool,
}

impl fmt::Display for ResultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(s)
        };
        if self.no_lockspaces {
            put(f, "NO_LOCKSPACES")?;
        }
        if self.no_gl_ls {
            put(f, "NO_GL_LS")?;
        }
        if self.local_ls {
            put(f, "LOCAL_LS")?;
        }
        if self.dup_gl_ls {
            put(f, "DUP_GL_LS")?;
        }
        if self.inactive_ls {
            put(f, "INACTIVE_LS")?;
        }
        if self.add_ls_error {
            put(f, "ADD_LS_ERROR")?;
        }
        Ok(())
    }
}

/// One request in flight.
///
/// Owned by exactly one queue at any time; the owning queue frees it by
/// completing it into a results list or discarding it.
#[derive(Debug, Clone, Default)]
pub struct Action {
    /// Unique id, used to match results back to waiting callers.
    pub id: u64,
    /// Owning client, 0 for internally synthesized actions.
    pub client_id: u32,
    pub op: Op,
    pub rt: ResKind,
    pub mode: Mode,
    pub lm_type: LockType,
    pub flags: ActFlags,
    pub vg_name: String,
    pub vg_uuid: String,
    pub vg_sysid: String,
    pub lv_name: String,
    pub vg_args: String,
    pub lv_args: String,
    pub version: u32,
    pub host_id: u64,
    pub retries: u32,
    pub max_retries: u32,
    /// Raw return code from the lock-manager backend, for diagnostics.
    pub lm_rv: i32,
    /// Set exactly once, when processing completes.
    pub result: Option<Result<(), LockError>>,
}

impl Action {
    pub fn new(id: u64, client_id: u32, op: Op, rt: ResKind) -> Action {
        Action {
            id,
            client_id,
            op,
            rt,
            max_retries: DEFAULT_MAX_RETRIES,
            ..Action::default()
        }
    }

    /// Builds an action from a logical request.
    pub fn from_request(id: u64, client_id: u32, req: &Request) -> Result<Action, LockError> {
        let (op, mut rt) = parse_request_name(&req.request)?;
        let flags = ActFlags::parse(&req.opts)?;
        let mode = Mode::parse(&req.mode)?;
        let lm_type = LockType::parse(&req.vg_lock_type)?;

        // A names-version update targets the global resource.
        if op == Op::Update && flags.update_names {
            rt = ResKind::Global;
        }

        Ok(Action {
            id,
            client_id,
            op,
            rt,
            mode,
            lm_type,
            flags,
            vg_name: req.vg_name.clone(),
            vg_uuid: req.vg_uuid.clone(),
            vg_sysid: req.vg_sysid.clone(),
            lv_name: req.lv_name.clone(),
            vg_args: req.vg_lock_args.clone(),
            lv_args: req.lv_lock_args.clone(),
            version: req.version,
            host_id: req.host_id,
            retries: 0,
            max_retries: req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            lm_rv: 0,
            result: None,
        })
    }

    /// Marks the action complete with a success result.
    pub fn succeed(&mut self) {
        self.result = Some(Ok(()));
    }

    /// Marks the action complete with an error result.
    pub fn fail(&mut self, err: LockError) {
        self.result = Some(Err(err));
    }

    /// Signed wire result, 0 on success. Incomplete actions report 0.
    pub fn op_result(&self) -> i32 {
        match self.result {
            Some(Ok(())) => 0,
            Some(Err(e)) => e.code(),
            None => 0,
        }
    }

    /// True for an unlock request (a lock op releasing its lock).
    pub fn is_unlock(&self) -> bool {
        self.op == Op::Lock && self.mode == Mode::Unlock
    }
}

/// Logical request fields consumed by the core.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Operation name, e.g. `lock_vg`, `start_vg`, `init_lv`.
    pub request: String,
    /// Requested mode: `un`, `nl`, `sh`, `ex`.
    pub mode: String,
    /// Comma list of option keywords.
    pub opts: String,
    pub vg_name: String,
    pub vg_uuid: String,
    pub vg_sysid: String,
    pub lv_name: String,
    pub vg_lock_type: String,
    pub vg_lock_args: String,
    pub lv_lock_args: String,
    pub version: u32,
    pub host_id: u64,
    pub max_retries: Option<u32>,
}

impl Request {
    pub fn new(request: &str) -> Request {
        Request {
            request: request.to_string(),
            ..Request::default()
        }
    }

    pub fn with_mode(mut self, mode: &str) -> Request {
        self.mode = mode.to_string();
        self
    }

    pub fn with_opts(mut self, opts: &str) -> Request {
        self.opts = opts.to_string();
        self
    }

    pub fn with_vg(mut self, vg_name: &str) -> Request {
        self.vg_name = vg_name.to_string();
        self
    }

    pub fn with_vg_uuid(mut self, vg_uuid: &str) -> Request {
        self.vg_uuid = vg_uuid.to_string();
        self
    }

    pub fn with_vg_sysid(mut self, vg_sysid: &str) -> Request {
        self.vg_sysid = vg_sysid.to_string();
        self
    }

    pub fn with_lv(mut self, lv_name: &str) -> Request {
        self.lv_name = lv_name.to_string();
        self
    }

    pub fn with_lock_type(mut self, lock_type: &str) -> Request {
        self.vg_lock_type = lock_type.to_string();
        self
    }

    pub fn with_vg_args(mut self, args: &str) -> Request {
        self.vg_lock_args = args.to_string();
        self
    }

    pub fn with_version(mut self, version: u32) -> Request {
        self.version = version;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Request {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Logical response fields produced for a completed action.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Signed result, negative on error.
    pub op_result: i32,
    /// Raw lock-manager return code.
    pub lm_result: i32,
    /// Lock-manager type that handled the request.
    pub lock_type: LockType,
    pub result_flags: ResultFlags,
    /// Initialization output, persisted in volume-group metadata.
    pub vg_lock_args: String,
    pub lv_lock_args: String,
    /// Free-form text for info/dump requests.
    pub data: String,
}
