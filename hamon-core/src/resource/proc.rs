// hamon-core: supervised process entries

use std::sync::Arc;
use std::time::Instant;

use hamon_proto::{LogSequence, ProcState, ProcType};

use crate::context::ControlConn;

/// Restarting a child sooner than this after its first registration is a
/// crash loop; PROC_START waits the remainder out.
pub const PROC_RECOVERY_DELAY_MS: u64 = 30_000;

/// Consecutive unacknowledged change-mode cycles before SIGTERM / SIGKILL.
pub const CHANGEMODE_GAP_TERM: u32 = 12;
pub const CHANGEMODE_GAP_KILL: u32 = 24;

/// One supervised child process. Identity is the argv string: at most one
/// entry per distinct argv.
pub struct ProcEntry {
    pub state: ProcState,
    pub ptype: ProcType,

    pub pid: i32,
    pub exec_path: String,
    /// argv joined by spaces, preserved verbatim for re-exec.
    pub args: String,
    pub argv: Vec<String>,

    /// first registered / registered / deregistered / killed / started
    pub frtime: Option<Instant>,
    pub rtime: Option<Instant>,
    pub dtime: Option<Instant>,
    pub ktime: Option<Instant>,
    pub stime: Option<Instant>,

    pub changemode_gap: u32,

    pub prev_eof: LogSequence,
    pub curr_eof: LogSequence,
    pub curr_eof_received: bool,

    pub conn: Option<Arc<dyn ControlConn>>,

    pub being_shutdown: bool,
    pub server_hang: bool,
    pub knows_master_hostname: bool,
}

impl ProcEntry {
    pub fn new() -> Self {
        Self {
            state: ProcState::Unknown,
            ptype: ProcType::Server,
            pid: 0,
            exec_path: String::new(),
            args: String::new(),
            argv: Vec::new(),
            frtime: None,
            rtime: None,
            dtime: None,
            ktime: None,
            stime: None,
            changemode_gap: 0,
            prev_eof: LogSequence::NULL,
            curr_eof: LogSequence::NULL,
            curr_eof_received: false,
            conn: None,
            being_shutdown: false,
            server_hang: false,
            knows_master_hostname: false,
        }
    }

    pub fn is_server(&self) -> bool {
        self.ptype == ProcType::Server
    }

    /// Active or on the way to active; the states the demote shutdown and
    /// the disk-hang paths care about.
    pub fn is_active_side(&self) -> bool {
        matches!(
            self.state,
            ProcState::RegisteredAndActive | ProcState::RegisteredAndToBeActive
        )
    }

    pub fn conn_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }
}

impl Default for ProcEntry {
    fn default() -> Self {
        Self::new()
    }
}
