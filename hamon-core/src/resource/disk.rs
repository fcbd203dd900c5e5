// hamon-core: disk-hang detector
// A dedicated thread samples the EOF LSN of every active server. A stalled
// EOF on a non-isolated master demotes the node; error logging is turned
// off first so nothing more is written to the failed disk.

use std::sync::Arc;
use std::time::Duration;

use hamon_proto::{ControlCommand, NodeState, ProcState};
use tracing::debug;

use crate::context::HaContext;
use crate::jobs::TIMER_IMMEDIATELY;
use crate::log_gate::NologReason;
use crate::resource::jobs::ResourceJob;
use crate::resource::Resource;

/// Detector wake-up tick.
pub const DISK_CHECK_TICK: Duration = Duration::from_millis(100);

/// One sampling pass: an active server whose EOF did not advance since the
/// previous pass is hung. Returns false when any server hung.
pub fn check_server_log_grow(resource: &mut Resource) -> bool {
    let mut dead = 0;

    for entry in &mut resource.procs {
        if !entry.is_server() || entry.state != ProcState::RegisteredAndActive || entry.server_hang
        {
            continue;
        }
        if entry.curr_eof.is_null() {
            continue;
        }

        if entry.curr_eof > entry.prev_eof {
            entry.prev_eof = entry.curr_eof;
        } else {
            entry.server_hang = true;
            dead += 1;

            if entry.curr_eof_received {
                debug!(pid = entry.pid, eof = %entry.curr_eof, "no change to eof received");
            } else {
                debug!(pid = entry.pid, "no response to eof request");
            }
        }
    }

    dead == 0
}

/// Ask every active server for a fresh EOF sample.
pub fn send_get_eof(resource: &mut Resource) {
    if resource.state != NodeState::Master {
        return;
    }

    for entry in &mut resource.procs {
        if entry.state != ProcState::RegisteredAndActive {
            continue;
        }
        if let Some(conn) = entry.conn.clone() {
            if conn.send_command(ControlCommand::GetEof).is_ok() {
                entry.curr_eof_received = false;
            }
        }
    }
}

/// Detector thread body. Wakes every 100 ms, samples every configured
/// interval, exits when the resource root shuts down.
pub fn run(ctx: Arc<HaContext>) {
    let mut remaining_ms: i64 = 0;

    loop {
        if ctx.resource.lock().shutdown {
            break;
        }

        let interval_secs = ctx.config().effective_disk_check_interval_secs();
        if interval_secs > 0 && remaining_ms <= 0 {
            if check_disk_failure(&ctx) {
                continue;
            }
            remaining_ms = (interval_secs * 1000) as i64;
        }

        std::thread::sleep(DISK_CHECK_TICK);
        if interval_secs > 0 {
            remaining_ms -= DISK_CHECK_TICK.as_millis() as i64;
        }
    }
}

/// One detector pass under both locks. Returns true when the node demoted
/// (the caller restarts its countdown bookkeeping).
pub fn check_disk_failure(ctx: &Arc<HaContext>) -> bool {
    let cluster = ctx.cluster.lock();
    let mut resource = ctx.resource.lock();

    if !cluster.is_isolated && resource.state == NodeState::Master {
        if !check_server_log_grow(&mut resource) {
            // be silent from here on to avoid blocking on the failed disk
            ctx.log_gate
                .disable(NologReason::DemoteOnDiskFail, Some("server eof stalled"));
            resource.state = NodeState::Slave;

            drop(resource);
            drop(cluster);

            ctx.resource_jobs
                .enqueue(ResourceJob::DemoteStartShutdown, TIMER_IMMEDIATELY);
            return true;
        }
    }

    if resource.state == NodeState::Master {
        send_get_eof(&mut resource);
    }

    false
}
