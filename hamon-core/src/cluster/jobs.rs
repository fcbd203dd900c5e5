// hamon-core: cluster jobs
// The election engine. Every non-terminal job re-enqueues a successor, so
// the cluster queue is a perpetual clock driven by one worker thread.

use std::sync::Arc;
use std::time::Duration;

use hamon_proto::NodeState;
use tracing::{info, warn};

use crate::context::HaContext;
use crate::jobs::{JobLabel, TIMER_IMMEDIATELY, TIMER_WAIT_100_MS, TIMER_WAIT_500_MS, TIMER_WAIT_A_SECOND};
use crate::resource;
use crate::resource::jobs::LABEL_CHANGE_MODE;

/// Ping rounds before a failover / failback decision is committed.
pub const MAX_PING_CHECK: u32 = 3;

/// Demote iterations (one per second) waiting for a peer to take over.
pub const MAX_WAIT_FOR_NEW_MASTER: u32 = 60;

/// Valid-ping-server probe period, and the shorter one used while no ping
/// host answers.
pub const CHECK_VALID_PING_SERVER_PERIOD: Duration = Duration::from_secs(3600);
pub const CHECK_VALID_PING_SERVER_PERIOD_INVALID: Duration = Duration::from_secs(300);

pub const LABEL_INIT: &str = "init";
pub const LABEL_HEARTBEAT: &str = "heartbeat";
pub const LABEL_CALC_SCORE: &str = "calc_score";
pub const LABEL_CHECK_PING: &str = "check_ping";
pub const LABEL_FAILOVER: &str = "failover";
pub const LABEL_FAILBACK: &str = "failback";
pub const LABEL_CHECK_VALID_PING_SERVER: &str = "check_valid_ping_server";
pub const LABEL_DEMOTE: &str = "demote";

/// Cluster-queue job set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterJob {
    Init,
    Heartbeat,
    CalcScore,
    CheckPing { ping_check_count: u32 },
    Failover,
    Failback,
    CheckValidPingServer,
    Demote { retries: u32 },
}

impl JobLabel for ClusterJob {
    fn label(&self) -> &'static str {
        match self {
            ClusterJob::Init => LABEL_INIT,
            ClusterJob::Heartbeat => LABEL_HEARTBEAT,
            ClusterJob::CalcScore => LABEL_CALC_SCORE,
            ClusterJob::CheckPing { .. } => LABEL_CHECK_PING,
            ClusterJob::Failover => LABEL_FAILOVER,
            ClusterJob::Failback => LABEL_FAILBACK,
            ClusterJob::CheckValidPingServer => LABEL_CHECK_VALID_PING_SERVER,
            ClusterJob::Demote { .. } => LABEL_DEMOTE,
        }
    }
}

/// Dispatch one dequeued cluster job.
pub fn run(ctx: &Arc<HaContext>, job: ClusterJob) {
    match job {
        ClusterJob::Init => job_init(ctx),
        ClusterJob::Heartbeat => job_heartbeat(ctx),
        ClusterJob::CalcScore => job_calc_score(ctx),
        ClusterJob::CheckPing { ping_check_count } => job_check_ping(ctx, ping_check_count),
        ClusterJob::Failover => job_failover(ctx),
        ClusterJob::Failback => job_failback(ctx),
        ClusterJob::CheckValidPingServer => job_check_valid_ping_server(ctx),
        ClusterJob::Demote { retries } => job_demote(ctx, retries),
    }
}

fn calc_score_interval(ctx: &HaContext) -> Duration {
    Duration::from_millis(ctx.config().calc_score_interval_ms)
}

/// 500 ms when every peer heartbeated this round, the configured wait when
/// some peer was silent.
fn failover_wait_time(ctx: &HaContext, cluster: &super::Cluster) -> Duration {
    let config = ctx.config();
    if cluster.received_heartbeat_from_all(Duration::from_millis(config.heartbeat_interval_ms)) {
        TIMER_WAIT_500_MS
    } else {
        Duration::from_millis(config.failover_wait_time_ms)
    }
}

fn job_init(ctx: &Arc<HaContext>) {
    ctx.cluster_jobs.enqueue(ClusterJob::Heartbeat, TIMER_IMMEDIATELY);
    ctx.cluster_jobs
        .enqueue(ClusterJob::CheckValidPingServer, TIMER_IMMEDIATELY);
    ctx.cluster_jobs.enqueue(
        ClusterJob::CalcScore,
        Duration::from_millis(ctx.config().init_timer_ms),
    );
}

fn job_heartbeat(ctx: &Arc<HaContext>) {
    {
        let mut cluster = ctx.cluster.lock();
        if !cluster.hide_to_demote {
            cluster.request_heartbeat_to_all();
        }
    }

    ctx.cluster_jobs.enqueue(
        ClusterJob::Heartbeat,
        Duration::from_millis(ctx.config().heartbeat_interval_ms),
    );
}

fn job_calc_score(ctx: &Arc<HaContext>) {
    let config = ctx.config();
    let mut cluster = ctx.cluster.lock();

    let num_master = cluster.calc_score(
        config.max_heartbeat_gap,
        Duration::from_millis(config.calc_score_interval_ms),
    );
    cluster.is_isolated = cluster.compute_is_isolated();
    ctx.set_isolated(cluster.is_isolated);

    if cluster.state != NodeState::Replica && !cluster.hide_to_demote {
        // a master that lost sight of every peer must pass the ping gate
        if cluster.state == NodeState::Master && cluster.is_isolated {
            drop(cluster);
            ctx.cluster_jobs.enqueue(
                ClusterJob::CheckPing { ping_check_count: 0 },
                TIMER_IMMEDIATELY,
            );
            return;
        }

        // split brain: someone with a stronger priority also claims master
        let myself_is_master = cluster.state == NodeState::Master;
        if num_master > 1
            && myself_is_master
            && cluster.master.is_some()
            && cluster.master != cluster.myself
        {
            warn!("more than one master detected and failback will be initiated");
            drop(cluster);
            ctx.cluster_jobs.enqueue(ClusterJob::Failback, TIMER_IMMEDIATELY);
            return;
        }

        // this node won the election
        if cluster.state == NodeState::Slave
            && cluster.master.is_some()
            && cluster.master == cluster.myself
        {
            cluster.state = NodeState::ToBeMaster;
            cluster.request_heartbeat_to_all();
            drop(cluster);

            info!("a failover attempted to make the current node a master");
            ctx.cluster_jobs.enqueue(
                ClusterJob::CheckPing { ping_check_count: 0 },
                TIMER_WAIT_100_MS,
            );
            return;
        }

        drop(cluster);
    } else {
        drop(cluster);
    }

    ctx.cluster_jobs
        .enqueue(ClusterJob::CalcScore, calc_score_interval(ctx));
}

fn job_check_ping(ctx: &Arc<HaContext>, ping_check_count: u32) {
    let mut cluster = ctx.cluster.lock();

    let skip_gate = cluster.ping_hosts.is_empty() || !cluster.is_ping_check_enabled;
    if skip_gate {
        // without a usable ping gate a master stays master; a slave goes
        // straight to failover, split brain risk accepted
        if cluster.state == NodeState::Master {
            return check_ping_cancel(ctx, cluster);
        }
    } else {
        let ping_ok = cluster.probe_ping_hosts();
        let probed_any = cluster
            .ping_hosts
            .iter()
            .any(|h| matches!(h.result, hamon_proto::PingResult::Success | hamon_proto::PingResult::Failure));

        if cluster.state == NodeState::Master {
            if !probed_any || ping_ok {
                return check_ping_cancel(ctx, cluster);
            }
        } else if probed_any && !ping_ok {
            return check_ping_cancel(ctx, cluster);
        }

        let next_count = ping_check_count + 1;
        if next_count < MAX_PING_CHECK {
            drop(cluster);
            ctx.cluster_jobs.enqueue(
                ClusterJob::CheckPing { ping_check_count: next_count },
                TIMER_IMMEDIATELY,
            );
            return;
        }
    }

    // the gate held over every round: commit
    cluster.request_heartbeat_to_all();
    let state = cluster.state;
    let wait = failover_wait_time(ctx, &cluster);
    drop(cluster);

    if state == NodeState::Master {
        ctx.cluster_jobs.enqueue(ClusterJob::Failback, TIMER_IMMEDIATELY);
    } else {
        ctx.cluster_jobs.enqueue(ClusterJob::Failover, wait);
    }
}

fn check_ping_cancel(
    ctx: &Arc<HaContext>,
    mut cluster: parking_lot::MutexGuard<'_, super::Cluster>,
) {
    if cluster.state != NodeState::Master {
        info!("Failover cancelled by ping check");
        cluster.state = NodeState::Slave;
    }
    cluster.request_heartbeat_to_all();
    drop(cluster);

    ctx.cluster_jobs
        .enqueue(ClusterJob::CalcScore, calc_score_interval(ctx));
}

fn job_failover(ctx: &Arc<HaContext>) {
    let config = ctx.config();
    let mut cluster = ctx.cluster.lock();

    cluster.calc_score(
        config.max_heartbeat_gap,
        Duration::from_millis(config.calc_score_interval_ms),
    );

    if cluster.master.is_some() && cluster.master == cluster.myself {
        info!("failover completed");
        cluster.state = NodeState::Master;
        ctx.resource.lock().state = NodeState::Master;
        ctx.resource_jobs.reschedule(LABEL_CHANGE_MODE, TIMER_IMMEDIATELY);
    } else {
        info!("failover cancelled");
        cluster.state = NodeState::Slave;
    }

    cluster.request_heartbeat_to_all();
    drop(cluster);

    ctx.cluster_jobs
        .enqueue(ClusterJob::CalcScore, calc_score_interval(ctx));
}

fn job_failback(ctx: &Arc<HaContext>) {
    {
        let mut cluster = ctx.cluster.lock();
        cluster.state = NodeState::Slave;
        if let Some(myself) = cluster.myself {
            cluster.nodes[myself].state = NodeState::Slave;
        }
        cluster.request_heartbeat_to_all();
        warn!("this master will become a slave and its server processes will be restarted");
    }

    let server_pids: Vec<i32> = {
        let mut res = ctx.resource.lock();
        res.state = NodeState::Slave;
        res.procs
            .iter()
            .filter(|p| p.is_server())
            .map(|p| p.pid)
            .collect()
    };

    // SIGTERM the servers and wait them out; survivors get SIGKILL.
    // This deliberately stalls the cluster worker until the servers exit.
    resource::kill_process_list(server_pids);

    ctx.cluster_jobs
        .enqueue(ClusterJob::CalcScore, calc_score_interval(ctx));
}

fn job_demote(ctx: &Arc<HaContext>, retries: u32) {
    let mut cluster = ctx.cluster.lock();

    if retries == 0 {
        // announce UNKNOWN once so the peers stop seeing a master
        cluster.state = NodeState::Unknown;
        cluster.request_heartbeat_to_all();
        warn!("waiting for a new node to be elected as master");
    }

    cluster.hide_to_demote = true;
    cluster.state = NodeState::Slave;
    if let Some(myself) = cluster.myself {
        cluster.nodes[myself].state = NodeState::Slave;
    }

    if cluster.is_isolated || retries + 1 > MAX_WAIT_FOR_NEW_MASTER {
        warn!("failed to find a new master node; changing the role back to master");
        cluster.hide_to_demote = false;
        cluster.state = NodeState::Master;
        if let Some(myself) = cluster.myself {
            cluster.nodes[myself].state = NodeState::Master;
        }
        return;
    }

    let found_master = cluster
        .nodes
        .iter()
        .enumerate()
        .any(|(idx, n)| Some(idx) != cluster.myself && n.state == NodeState::Master);
    if found_master {
        info!("found a new master node");
        cluster.hide_to_demote = false;
        return;
    }

    drop(cluster);
    ctx.cluster_jobs
        .enqueue(ClusterJob::Demote { retries: retries + 1 }, TIMER_WAIT_A_SECOND);
}

fn job_check_valid_ping_server(ctx: &Arc<HaContext>) {
    let mut interval = CHECK_VALID_PING_SERVER_PERIOD;

    {
        let mut cluster = ctx.cluster.lock();
        if !cluster.ping_hosts.is_empty() {
            let valid_exists = cluster.probe_ping_hosts();
            let isolated = cluster.compute_is_isolated();

            if !valid_exists && !isolated {
                interval = CHECK_VALID_PING_SERVER_PERIOD_INVALID;
                if cluster.is_ping_check_enabled {
                    cluster.is_ping_check_enabled = false;
                    warn!("validity check for PING failed on all hosts and PING check is now temporarily disabled");
                }
            } else if valid_exists && !cluster.is_ping_check_enabled {
                cluster.is_ping_check_enabled = true;
                info!("validity check for PING succeeded and PING check is now enabled");
            }
        }
    }

    ctx.cluster_jobs
        .enqueue(ClusterJob::CheckValidPingServer, interval);
}
