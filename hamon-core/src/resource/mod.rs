// hamon-core: resource supervisor
// Registers the local HA children over the control socket, restarts them on
// crash and drives their standby/active role in lockstep with the cluster.

pub mod disk;
pub mod jobs;
pub mod proc;

use std::sync::Arc;
use std::time::{Duration, Instant};

use hamon_proto::{HaServerState, LogSequence, NodeState, ProcRegister, ProcState, ProcType};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::{ControlConn, HaContext};
use crate::jobs::{TIMER_IMMEDIATELY, TIMER_WAIT_A_SECOND};
use jobs::{ProcJobArg, ResourceJob};
use proc::ProcEntry;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no process entry matches {0}")]
    NoSuchProcess(String),

    #[error("process entry is in an unexpected state")]
    BadState,

    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// The resource root: one per daemon, guarded by its mutex in `HaContext`.
pub struct Resource {
    /// Mirrors the cluster role for the local node.
    pub state: NodeState,
    pub procs: Vec<ProcEntry>,
    pub shutdown: bool,
}

impl Resource {
    pub fn new() -> Self {
        Self {
            state: NodeState::Slave,
            procs: Vec::new(),
            shutdown: false,
        }
    }

    pub fn find_by_args(&self, args: &str) -> Option<usize> {
        self.procs.iter().position(|p| p.args == args)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        self.procs.iter().position(|p| p.pid == pid)
    }

    pub fn find_by_conn_id(&self, conn_id: u64) -> Option<usize> {
        self.procs.iter().position(|p| p.conn_id() == Some(conn_id))
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::new()
    }
}

/// kill(pid, 0) probe: is the process still around (or just unreachable)?
pub fn probe_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM and friends: it exists, we just cannot signal it
        Err(_) => true,
    }
}

/// Deliver a signal, reporting whether the process was still there.
pub fn send_signal(pid: i32, signal: Signal) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

const KILL_LIST_MAX_RETRIES: u32 = 20;
const KILL_LIST_WAIT: Duration = Duration::from_secs(3);

/// SIGTERM a pid list, re-probe every 3 s for up to 20 rounds, then SIGKILL
/// the survivors. Blocks the calling worker for the whole ladder.
pub fn kill_process_list(mut pids: Vec<i32>) {
    let mut first_round = true;

    for _ in 0..KILL_LIST_MAX_RETRIES {
        let mut finished = true;
        for pid in pids.iter_mut() {
            if *pid <= 0 {
                continue;
            }
            let alive = if first_round {
                send_signal(*pid, Signal::SIGTERM)
            } else {
                probe_alive(*pid)
            };
            if alive {
                finished = false;
            } else {
                *pid = 0;
            }
        }
        first_round = false;

        if finished {
            return;
        }
        std::thread::sleep(KILL_LIST_WAIT);
    }

    for pid in pids {
        if pid > 0 {
            warn!(pid, "no response to shutdown request; process killed");
            send_signal(pid, Signal::SIGKILL);
        }
    }
}

/// Re-exec a child from its stored argv. Returns the new pid. The outer
/// daemon reaps children; we only track pids.
pub fn spawn_process(exec_path: &str, argv: &[String]) -> std::io::Result<i32> {
    let mut command = std::process::Command::new(exec_path);
    if argv.len() > 1 {
        command.args(&argv[1..]);
    }
    if let Some(arg0) = argv.first() {
        // argv[0] as announced by the child, not the exec path
        use std::os::unix::process::CommandExt;
        command.arg0(arg0);
    }
    let child = command.spawn()?;
    Ok(child.id() as i32)
}

impl HaContext {
    /// Is this argv string already a roster entry?
    pub fn is_registered_process(&self, args: &str) -> bool {
        let resource = self.resource.lock();
        if resource.shutdown {
            return false;
        }
        resource.find_by_args(args).is_some()
    }

    /// Registration path (§4.4.4). A fresh argv allocates an entry; an
    /// entry we just spawned must match by pid. Returns false when the
    /// registration is rejected and the caller should close the connection.
    pub fn register_process(&self, conn: Arc<dyn ControlConn>, register: &ProcRegister) -> bool {
        let mut resource = self.resource.lock();
        if resource.shutdown {
            return false;
        }

        let args = register.args_string();
        let Some(ptype) = ProcType::from_u32(register.proc_type) else {
            warn!(pid = register.pid, ptype = register.proc_type, "registration with unknown process type");
            return false;
        };

        let (idx, new_state) = match resource.find_by_args(&args) {
            None => {
                let mut entry = ProcEntry::new();
                entry.frtime = Some(Instant::now());
                resource.procs.push(entry);
                (resource.procs.len() - 1, ProcState::Registered)
            }
            Some(idx) => {
                let state = if resource.procs[idx].state == ProcState::Started {
                    // restarted by the supervisor, awaiting confirmation
                    ProcState::NotRegistered
                } else {
                    ProcState::Unknown // already registered
                };
                (idx, state)
            }
        };

        let accepted = new_state == ProcState::Registered
            || (new_state == ProcState::NotRegistered
                && resource.procs[idx].pid == register.pid
                && probe_alive(register.pid));

        if !accepted {
            let expected_pid = resource.procs[idx].pid;
            warn!(
                expected_pid,
                pid = register.pid,
                args = %args,
                "failure: registration rejected"
            );
            return false;
        }

        let entry = &mut resource.procs[idx];
        entry.state = new_state;
        entry.conn = Some(conn);
        entry.rtime = Some(Instant::now());
        entry.changemode_gap = 0;
        entry.server_hang = false;

        if entry.state == ProcState::Registered {
            entry.pid = register.pid;
            entry.ptype = ptype;
            if entry.ptype == ProcType::Server {
                entry.state = ProcState::REGISTERED_AND_STANDBY;
            }
            entry.exec_path = register.exec_path.clone();
            entry.args = args.clone();
            entry.argv = register.argv.clone();
        }

        info!(
            pid = register.pid,
            state = entry.state.display_for(entry.ptype),
            args = %args,
            "registered as local process entry"
        );
        true
    }

    /// Change-mode acknowledgement from a server child.
    pub fn receive_changemode_ack(&self, conn_id: u64, state: HaServerState) {
        let mut cluster = self.cluster.lock();
        let mut resource = self.resource.lock();

        let Some(idx) = resource.find_by_conn_id(conn_id) else {
            return;
        };
        if resource.procs[idx].state == ProcState::Deregistered {
            return;
        }

        {
            let entry = &mut resource.procs[idx];
            info!(
                state = state.as_str(),
                args = %entry.args,
                pid = entry.pid,
                "receive changemode response from the server"
            );

            match state {
                HaServerState::Active => {
                    entry.state = ProcState::RegisteredAndActive;
                    entry.knows_master_hostname = true;
                }
                HaServerState::ToBeActive => {
                    entry.state = ProcState::RegisteredAndToBeActive;
                    entry.knows_master_hostname = true;
                }
                HaServerState::Standby => {
                    entry.state = ProcState::REGISTERED_AND_STANDBY;
                    entry.knows_master_hostname = false;
                }
                HaServerState::ToBeStandby => {
                    entry.state = ProcState::RegisteredAndToBeStandby;
                    entry.knows_master_hostname = false;
                }
                _ => {}
            }
            entry.changemode_gap = 0;
        }

        // a server that settled into standby pulls the whole node to slave
        if state == HaServerState::Standby {
            cluster.state = NodeState::Slave;
            resource.state = NodeState::Slave;
        }
    }

    /// EOF LSN reply for the disk-hang detector.
    pub fn receive_eof_reply(&self, conn_id: u64, eof: LogSequence) {
        let mut resource = self.resource.lock();
        let Some(idx) = resource.find_by_conn_id(conn_id) else {
            debug!(conn_id, "eof reply from unknown connection");
            return;
        };

        let entry = &mut resource.procs[idx];
        if entry.state == ProcState::RegisteredAndActive {
            entry.curr_eof = eof;
            entry.curr_eof_received = true;
        }
    }

    /// A child's control connection died: mark the entry dead and schedule
    /// its restart. A server dying on a non-isolated master inside the
    /// unacceptable-restart window demotes the node first.
    pub fn cleanup_conn_and_start_process(&self, conn_id: u64) {
        let config = self.config();
        let mut resource = self.resource.lock();

        let Some(idx) = resource.find_by_conn_id(conn_id) else {
            debug!(conn_id, "connection close for unknown process");
            return;
        };

        resource.procs[idx].conn = None;
        resource.procs[idx].knows_master_hostname = false;

        if resource.procs[idx].state < ProcState::Registered {
            // entry is mid-transition; the pending resource job owns it
            return;
        }

        let now = Instant::now();
        resource.procs[idx].ktime = Some(now);

        if resource.procs[idx].being_shutdown {
            info!(pid = resource.procs[idx].pid, args = %resource.procs[idx].args, "process shutdown detected");
        } else {
            warn!(pid = resource.procs[idx].pid, args = %resource.procs[idx].args, "process failure detected");
        }

        let repeated_failure = match resource.procs[idx].rtime {
            Some(rtime) => {
                now.duration_since(rtime)
                    < Duration::from_millis(config.unacceptable_proc_restart_timediff_ms)
            }
            None => false,
        };
        if resource.state == NodeState::Master
            && resource.procs[idx].is_server()
            && !self.is_isolated()
            && repeated_failure
        {
            resource.state = NodeState::Slave;
            warn!(
                args = %resource.procs[idx].args,
                "process failure repeated within a short period of time; the current node will be demoted"
            );
            self.resource_jobs
                .enqueue(ResourceJob::DemoteStartShutdown, TIMER_IMMEDIATELY);
        }

        let entry = &mut resource.procs[idx];
        let arg = ProcJobArg {
            pid: entry.pid,
            args: entry.args.clone(),
            retries: 0,
            max_retries: config.max_process_start_confirm,
        };

        entry.state = ProcState::Dead;
        entry.server_hang = false;
        entry.curr_eof_received = false;
        entry.prev_eof = LogSequence::NULL;
        entry.curr_eof = LogSequence::NULL;

        drop(resource);
        self.resource_jobs
            .enqueue(ResourceJob::ProcStart(arg), TIMER_WAIT_A_SECOND);
    }

    /// Admin deregistration by pid.
    pub fn deregister_by_pid(&self, pid: i32) -> Result<(), ResourceError> {
        let mut resource = self.resource.lock();
        let Some(idx) = resource.find_by_pid(pid) else {
            warn!(pid, "failure: cannot find process to deregister");
            return Err(ResourceError::NoSuchProcess(format!("pid:{}", pid)));
        };
        let arg = deregister_entry(self, &mut resource, idx)?;
        drop(resource);

        self.resource_jobs
            .enqueue(ResourceJob::ProcDereg(arg), TIMER_IMMEDIATELY);
        info!(pid, "success: deregister");
        Ok(())
    }

    /// Admin deregistration by argv string.
    pub fn deregister_by_args(&self, args: &str) -> Result<(), ResourceError> {
        let mut resource = self.resource.lock();
        let Some(idx) = resource.find_by_args(args) else {
            warn!(args, "failure: cannot find process to deregister");
            return Err(ResourceError::NoSuchProcess(format!("args:{}", args)));
        };
        let arg = deregister_entry(self, &mut resource, idx)?;
        drop(resource);

        self.resource_jobs
            .enqueue(ResourceJob::ProcDereg(arg), TIMER_IMMEDIATELY);
        info!(args, "success: deregister");
        Ok(())
    }

    /// Deregister every copylogdb / applylogdb child.
    pub fn kill_all_ha_processes(&self) {
        let pids: Vec<i32> = {
            let resource = self.resource.lock();
            resource
                .procs
                .iter()
                .filter(|p| matches!(p.ptype, ProcType::Copylogdb | ProcType::Applylogdb))
                .map(|p| p.pid)
                .collect()
        };

        for pid in pids {
            let _ = self.deregister_by_pid(pid);
        }
    }

    /// Start a one-shot utility process unless its argv is already owned by
    /// a roster entry. The utility is not supervised.
    pub fn start_util_process(&self, args: &str) -> Result<(), ResourceError> {
        let resource = self.resource.lock();
        if resource.find_by_args(args).is_some() {
            warn!(args, "failure: process already running");
            return Err(ResourceError::BadState);
        }
        drop(resource);

        let argv: Vec<String> = args.split_whitespace().map(|s| s.to_string()).collect();
        let Some(exec_path) = argv.first().cloned() else {
            return Err(ResourceError::NoSuchProcess("empty argv".to_string()));
        };

        let pid = spawn_process(&exec_path, &argv)?;
        info!(pid, args, "utility process started");
        Ok(())
    }

    /// State of the process bound to a control connection; hang-flagged
    /// servers report DEAD so the router stops using them.
    pub fn proc_state_by_conn_id(&self, conn_id: u64) -> ProcState {
        let resource = self.resource.lock();
        match resource.find_by_conn_id(conn_id) {
            Some(idx) if resource.procs[idx].server_hang => ProcState::Dead,
            Some(idx) => resource.procs[idx].state,
            None => ProcState::Dead,
        }
    }

    pub fn is_hang_process(&self, conn_id: u64) -> bool {
        let resource = self.resource.lock();
        resource
            .find_by_conn_id(conn_id)
            .map(|idx| resource.procs[idx].server_hang)
            .unwrap_or(false)
    }
}

/// Mark an entry deregistered and build the dereg job argument.
fn deregister_entry(
    ctx: &HaContext,
    resource: &mut Resource,
    idx: usize,
) -> Result<ProcJobArg, ResourceError> {
    let entry = &mut resource.procs[idx];
    if entry.state < ProcState::Dead || entry.pid < 0 {
        warn!(
            state = entry.state.display_for(entry.ptype),
            pid = entry.pid,
            "failure: unexpected process status or invalid pid"
        );
        return Err(ResourceError::BadState);
    }

    entry.dtime = Some(Instant::now());
    entry.state = ProcState::Deregistered;

    Ok(ProcJobArg {
        pid: entry.pid,
        args: entry.args.clone(),
        retries: 0,
        max_retries: ctx.config().max_process_dereg_confirm,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hamon_config::HaConfig;
    use hamon_proto::ControlCommand;
    use parking_lot::Mutex as PlMutex;

    pub(crate) struct MockConn {
        id: u64,
        pub sent: PlMutex<Vec<ControlCommand>>,
        pub data: PlMutex<Vec<Vec<u8>>>,
    }

    impl MockConn {
        pub fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                sent: PlMutex::new(Vec::new()),
                data: PlMutex::new(Vec::new()),
            })
        }
    }

    impl ControlConn for MockConn {
        fn id(&self) -> u64 {
            self.id
        }

        fn send_command(&self, command: ControlCommand) -> std::io::Result<()> {
            self.sent.lock().push(command);
            Ok(())
        }

        fn send_data(&self, data: &[u8]) -> std::io::Result<()> {
            self.data.lock().push(data.to_vec());
            Ok(())
        }
    }

    pub(crate) fn test_ctx() -> Arc<HaContext> {
        let config = HaConfig {
            node_list: "demo@alpha,beta".to_string(),
            ..HaConfig::default()
        };
        let ctx = Arc::new(HaContext::with_host_name(config.clone(), "beta"));
        ctx.cluster.lock().load(&config).unwrap();
        ctx
    }

    pub(crate) fn server_register(pid: i32) -> ProcRegister {
        ProcRegister {
            pid,
            proc_type: ProcType::Server as u32,
            exec_path: "/usr/local/bin/db_server".to_string(),
            argv: vec!["db_server".to_string(), "testdb".to_string()],
        }
    }

    #[test]
    fn test_first_registration_becomes_standby() {
        let ctx = test_ctx();
        let conn = MockConn::new(1);

        assert!(ctx.register_process(conn, &server_register(100)));

        let resource = ctx.resource.lock();
        assert_eq!(resource.procs.len(), 1);
        let entry = &resource.procs[0];
        assert_eq!(entry.state, ProcState::REGISTERED_AND_STANDBY);
        assert_eq!(entry.pid, 100);
        assert_eq!(entry.args, "db_server testdb");
        assert!(entry.conn.is_some());
        assert!(entry.frtime.is_some());
    }

    #[test]
    fn test_auxiliary_registration_stays_registered() {
        let ctx = test_ctx();
        let reg = ProcRegister {
            proc_type: ProcType::Copylogdb as u32,
            ..server_register(200)
        };
        assert!(ctx.register_process(MockConn::new(1), &reg));
        assert_eq!(ctx.resource.lock().procs[0].state, ProcState::Registered);
    }

    #[test]
    fn test_reregistration_with_pid_mismatch_rejected() {
        let ctx = test_ctx();
        assert!(ctx.register_process(MockConn::new(1), &server_register(std::process::id() as i32)));

        // simulate a supervisor restart awaiting confirmation
        ctx.resource.lock().procs[0].state = ProcState::Started;
        ctx.resource.lock().procs[0].pid = std::process::id() as i32;

        let wrong_pid = server_register(1);
        assert!(!ctx.register_process(MockConn::new(2), &wrong_pid));
    }

    #[test]
    fn test_reregistration_after_start_matches_pid() {
        let ctx = test_ctx();
        let own_pid = std::process::id() as i32; // a pid that is certainly alive
        assert!(ctx.register_process(MockConn::new(1), &server_register(own_pid)));
        {
            let mut resource = ctx.resource.lock();
            resource.procs[0].state = ProcState::Started;
        }

        assert!(ctx.register_process(MockConn::new(2), &server_register(own_pid)));
        assert_eq!(ctx.resource.lock().procs[0].state, ProcState::NotRegistered);
    }

    #[test]
    fn test_registration_refused_while_shutdown() {
        let ctx = test_ctx();
        ctx.resource.lock().shutdown = true;
        assert!(!ctx.register_process(MockConn::new(1), &server_register(100)));
    }

    #[test]
    fn test_changemode_ack_active() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(1), &server_register(100));

        ctx.receive_changemode_ack(1, HaServerState::Active);

        let resource = ctx.resource.lock();
        assert_eq!(resource.procs[0].state, ProcState::RegisteredAndActive);
        assert!(resource.procs[0].knows_master_hostname);
        assert_eq!(resource.procs[0].changemode_gap, 0);
    }

    #[test]
    fn test_changemode_ack_standby_pulls_node_to_slave() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(1), &server_register(100));
        ctx.cluster.lock().state = NodeState::ToBeSlave;
        ctx.resource.lock().state = NodeState::ToBeSlave;

        ctx.receive_changemode_ack(1, HaServerState::Standby);

        assert_eq!(ctx.resource.lock().procs[0].state, ProcState::REGISTERED_AND_STANDBY);
        assert_eq!(ctx.cluster.lock().state, NodeState::Slave);
        assert_eq!(ctx.resource.lock().state, NodeState::Slave);
    }

    #[test]
    fn test_eof_reply_only_counts_for_active_server() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(1), &server_register(100));

        let eof = LogSequence { page_id: 10, offset: 0 };
        ctx.receive_eof_reply(1, eof);
        assert!(ctx.resource.lock().procs[0].curr_eof.is_null());

        ctx.resource.lock().procs[0].state = ProcState::RegisteredAndActive;
        ctx.receive_eof_reply(1, eof);
        let resource = ctx.resource.lock();
        assert_eq!(resource.procs[0].curr_eof, eof);
        assert!(resource.procs[0].curr_eof_received);
    }

    #[test]
    fn test_conn_death_marks_dead_and_schedules_restart() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(1), &server_register(100));

        ctx.cleanup_conn_and_start_process(1);

        let resource = ctx.resource.lock();
        assert_eq!(resource.procs[0].state, ProcState::Dead);
        assert!(resource.procs[0].conn.is_none());
        assert!(resource.procs[0].ktime.is_some());
        assert!(resource.procs[0].curr_eof.is_null());
        drop(resource);

        let pending = ctx.resource_jobs.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, jobs::LABEL_PROC_START);
    }

    #[test]
    fn test_server_crash_on_master_demotes() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(1), &server_register(100));
        ctx.resource.lock().state = NodeState::Master;
        ctx.set_isolated(false);

        // registered moments ago: well inside the unacceptable window
        ctx.cleanup_conn_and_start_process(1);

        assert_eq!(ctx.resource.lock().state, NodeState::Slave);
        let labels: Vec<_> = ctx.resource_jobs.pending().iter().map(|(l, _)| *l).collect();
        assert!(labels.contains(&jobs::LABEL_DEMOTE_START_SHUTDOWN));
        assert!(labels.contains(&jobs::LABEL_PROC_START));
    }

    #[test]
    fn test_deregister_by_pid() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(1), &server_register(100));

        ctx.deregister_by_pid(100).unwrap();

        let resource = ctx.resource.lock();
        assert_eq!(resource.procs[0].state, ProcState::Deregistered);
        assert!(resource.procs[0].dtime.is_some());
        drop(resource);

        let pending = ctx.resource_jobs.pending();
        assert_eq!(pending[0].0, jobs::LABEL_PROC_DEREG);

        assert!(ctx.deregister_by_pid(4242).is_err());
    }

    #[test]
    fn test_queries_by_conn_id() {
        let ctx = test_ctx();
        ctx.register_process(MockConn::new(7), &server_register(100));

        assert!(ctx.is_registered_process("db_server testdb"));
        assert_eq!(ctx.proc_state_by_conn_id(7), ProcState::REGISTERED_AND_STANDBY);
        assert_eq!(ctx.proc_state_by_conn_id(9), ProcState::Dead);
        assert!(!ctx.is_hang_process(7));

        ctx.resource.lock().procs[0].server_hang = true;
        assert!(ctx.is_hang_process(7));
        assert_eq!(ctx.proc_state_by_conn_id(7), ProcState::Dead);
    }

    #[test]
    fn test_probe_alive_on_own_and_bogus_pid() {
        assert!(probe_alive(std::process::id() as i32));
        assert!(!probe_alive(0));
        // pid beyond any realistic pid_max
        assert!(!probe_alive(i32::MAX - 1));
    }
}
