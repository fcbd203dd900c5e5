// hamon-core: lifecycle and control surface
// Activation wires the state machines and spawns the four background
// threads; deactivation is two-phase (prepare shuts the children down,
// finalize tears the engine apart once every connection is gone).

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hamon_config::HaConfig;
use hamon_proto::NodeState;
use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::jobs::ClusterJob;
use crate::cluster::net::{resolve_host, HeartbeatChannel};
use crate::cluster::{ClusterError, UI_NODE_CACHE_AGE};
use crate::context::HaContext;
use crate::jobs::TIMER_IMMEDIATELY;
use crate::resource::jobs::ResourceJob;
use crate::resource::{probe_alive, ResourceError};
use crate::{cluster, resource};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("HA is being deactivated")]
    DeactivationInProgress,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of an inbound admin/control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Local Unix-domain peer.
    EligibleLocal,
    /// TCP peer whose address matches a cluster node.
    EligibleRemote,
    Unauthorized,
    /// Some node address could not be resolved for comparison.
    Failed,
}

/// The HA control surface the daemon drives.
pub struct HaMaster {
    ctx: Arc<HaContext>,
    is_activated: AtomicBool,
}

impl HaMaster {
    pub fn new(config: HaConfig) -> std::io::Result<Self> {
        Ok(Self {
            ctx: Arc::new(HaContext::new(config)?),
            is_activated: AtomicBool::new(false),
        })
    }

    /// Wrap an existing context; used by tests.
    pub fn with_context(ctx: Arc<HaContext>) -> Self {
        Self {
            ctx,
            is_activated: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<HaContext> {
        &self.ctx
    }

    pub fn is_activated(&self) -> bool {
        self.is_activated.load(Ordering::SeqCst)
    }

    /// Bring the whole HA stack up: cluster state, cluster jobs, resource
    /// state, resource jobs, threads, in that order. Any failure unwinds in
    /// reverse order and leaves nothing running.
    pub fn activate(&self) -> Result<(), MasterError> {
        if self.ctx.deactivate.lock().info_started {
            warn!("failure: HA is being deactivated");
            return Err(MasterError::DeactivationInProgress);
        }
        if self.is_activated() {
            warn!("failure: HA already activated");
            return Ok(());
        }

        match self.master_init() {
            Ok(()) => {
                self.is_activated.store(true, Ordering::SeqCst);
                info!("success: activate");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "failure: activate");
                self.unwind_partial_init();
                Err(err)
            }
        }
    }

    fn master_init(&self) -> Result<(), MasterError> {
        self.ctx.log_gate.enable();
        info!("HA heartbeat started");

        let config = self.ctx.config();

        // cluster state
        let channel = {
            let mut cluster = self.ctx.cluster.lock();
            cluster.shutdown = false;
            cluster.hide_to_demote = false;
            cluster.is_isolated = false;
            cluster.is_ping_check_enabled = true;
            cluster.ui_nodes.clear();
            cluster.load(&config)?;

            if !cluster.check_valid_ping_server() {
                return Err(MasterError::Cluster(ClusterError::NoValidPingHost));
            }

            let channel = Arc::new(HeartbeatChannel::bind(config.port)?);
            cluster.channel = Some(channel.clone());
            channel
        };

        // cluster jobs
        self.ctx.cluster_jobs.reset();
        self.ctx
            .cluster_jobs
            .enqueue(ClusterJob::Init, TIMER_IMMEDIATELY);

        // resource state
        {
            let mut res = self.ctx.resource.lock();
            res.shutdown = false;
            res.state = NodeState::Slave;
            res.procs.clear();
        }

        // resource jobs
        self.ctx.resource_jobs.reset();
        self.ctx.resource_jobs.enqueue(
            ResourceJob::ChangeMode,
            Duration::from_millis(config.init_timer_ms + config.failover_wait_time_ms),
        );
        self.ctx.resource_jobs.enqueue(
            ResourceJob::SendMasterHostname,
            Duration::from_millis(config.update_hostname_interval_ms),
        );

        self.spawn_threads(channel)?;

        self.ctx
            .deactivate_immediately
            .store(false, Ordering::Relaxed);

        Ok(())
    }

    fn spawn_threads(&self, channel: Arc<HeartbeatChannel>) -> std::io::Result<()> {
        let ctx = self.ctx.clone();
        std::thread::Builder::new()
            .name("hamon-udp-reader".to_string())
            .spawn(move || cluster::net::reader_loop(ctx, channel))?;

        let ctx = self.ctx.clone();
        std::thread::Builder::new()
            .name("hamon-cluster-worker".to_string())
            .spawn(move || {
                crate::jobs::run_worker(&ctx.cluster_jobs, |job| cluster::jobs::run(&ctx, job))
            })?;

        let ctx = self.ctx.clone();
        std::thread::Builder::new()
            .name("hamon-resource-worker".to_string())
            .spawn(move || {
                crate::jobs::run_worker(&ctx.resource_jobs, |job| resource::jobs::run(&ctx, job))
            })?;

        let ctx = self.ctx.clone();
        std::thread::Builder::new()
            .name("hamon-disk-checker".to_string())
            .spawn(move || resource::disk::run(ctx))?;

        Ok(())
    }

    fn unwind_partial_init(&self) {
        if !self.ctx.cluster.lock().shutdown {
            self.cluster_cleanup();
        }
        if !self.ctx.cluster_jobs.is_shutdown() {
            self.ctx.cluster_jobs.shutdown();
        }
        if !self.ctx.resource.lock().shutdown {
            self.resource_cleanup();
        }
        if !self.ctx.resource_jobs.is_shutdown() {
            self.ctx.resource_jobs.shutdown();
        }
    }

    /// Deactivation, prepare phase: stop accepting registrations and shut
    /// every child down. Idempotent.
    pub fn prepare_deactivate(&self) -> Result<(), MasterError> {
        {
            let mut res = self.ctx.resource.lock();
            if res.shutdown {
                // resources are already being cleaned up
                return Ok(());
            }
            res.shutdown = true;
        }

        self.ctx
            .resource_jobs
            .enqueue(ResourceJob::CleanupAll, TIMER_IMMEDIATELY);
        info!("HA starts to shut down all HA processes");
        Ok(())
    }

    /// Deactivation, finalize phase. The control surface calls this only
    /// after `is_deactivation_ready()` reports every connection gone.
    pub fn deactivate(&self) -> Result<(), MasterError> {
        if !self.is_activated() {
            warn!("failure: HA already deactivated");
            return Ok(());
        }

        self.ctx.resource_jobs.shutdown();
        self.resource_cleanup();

        self.ctx.cluster_jobs.shutdown();
        self.cluster_cleanup();

        self.is_activated.store(false, Ordering::SeqCst);
        info!("success: deactivate");
        Ok(())
    }

    fn resource_cleanup(&self) {
        let mut res = self.ctx.resource.lock();
        resource::jobs::shutdown_all_ha_procs(&mut res);

        for entry in &res.procs {
            if entry.conn.is_some() && entry.pid > 0 {
                resource::send_signal(entry.pid, nix::sys::signal::Signal::SIGKILL);
            }
        }

        res.procs.clear();
        res.state = NodeState::Unknown;
        res.shutdown = true;
    }

    fn cluster_cleanup(&self) {
        let mut cluster = self.ctx.cluster.lock();
        cluster.state = NodeState::Unknown;

        // one last announcement so the peers elect a new master promptly
        cluster.request_heartbeat_to_all();

        cluster.nodes.clear();
        cluster.myself = None;
        cluster.master = None;
        cluster.shutdown = true;
        cluster.channel = None;
        cluster.ping_hosts.clear();
        cluster.ui_nodes.clear();
    }

    /// Reload node lists and ping hosts from a freshly loaded configuration.
    /// The roster rebuild is atomic: on failure the old state stays.
    pub fn reconfigure(&self, new_config: HaConfig) -> Result<String, MasterError> {
        {
            let mut cluster = self.ctx.cluster.lock();
            cluster.reload(&new_config)?;
        }
        self.ctx.set_config(new_config);
        self.ctx
            .cluster_jobs
            .reschedule(cluster::jobs::LABEL_CHECK_VALID_PING_SERVER, TIMER_IMMEDIATELY);

        info!("success: reload");
        Ok(self.node_info(false))
    }

    pub fn set_deactivate_immediately(&self, immediately: bool) {
        self.ctx
            .deactivate_immediately
            .store(immediately, Ordering::Relaxed);
    }

    // deactivation bookkeeping

    pub fn start_deactivate_server_info(&self) {
        let mut info = self.ctx.deactivate.lock();
        info.server_pids.clear();
        info.info_started = true;
    }

    pub fn is_deactivation_started(&self) -> bool {
        self.ctx.deactivate.lock().info_started
    }

    /// Every process entry has lost its control connection.
    pub fn is_deactivation_ready(&self) -> bool {
        let res = self.ctx.resource.lock();
        res.procs.iter().all(|p| p.conn.is_none())
    }

    /// Captured servers still alive; exited pids are forgotten.
    pub fn deactivating_server_count(&self) -> usize {
        let mut info = self.ctx.deactivate.lock();
        if !info.info_started {
            return 0;
        }

        let mut alive = 0;
        for pid in info.server_pids.iter_mut() {
            if *pid > 0 {
                if probe_alive(*pid) {
                    alive += 1;
                } else {
                    *pid = 0;
                }
            }
        }
        alive
    }

    pub fn finish_deactivate_server_info(&self) {
        let mut info = self.ctx.deactivate.lock();
        info.server_pids.clear();
        info.info_started = false;
    }

    // admin queries

    /// Node roster dump, with scores and missed heartbeats when verbose.
    pub fn node_info(&self, verbose: bool) -> String {
        let mut cluster = self.ctx.cluster.lock();
        let mut out = String::new();

        out.push_str(&format!(
            " HA-Node Info (current {}, state {})\n",
            cluster.host_name, cluster.state
        ));
        for node in &cluster.nodes {
            out.push_str(&format!(
                "   Node {} (priority {}, state {})\n",
                node.host_name, node.priority, node.state
            ));
            if verbose {
                out.push_str(&format!("    - score {}\n", node.score));
                out.push_str(&format!("    - missed heartbeat {}\n", node.heartbeat_gap));
            }
        }

        cluster.cleanup_ui_nodes();
        let now = Instant::now();
        for ui in &cluster.ui_nodes {
            if now.duration_since(ui.last_recv_time) > UI_NODE_CACHE_AGE {
                continue;
            }
            out.push_str(&format!(
                "   Unidentified Node {} (ip {}, group {}, reason {})\n",
                ui.host_name,
                ui.addr,
                ui.group_id,
                ui.reason.as_str()
            ));
        }

        out
    }

    /// Supervised process dump.
    pub fn process_info(&self, verbose: bool) -> String {
        let res = self.ctx.resource.lock();
        let mut out = String::new();

        out.push_str(&format!(
            " HA-Process Info (master {}, state {})\n",
            std::process::id(),
            res.state
        ));
        for entry in &res.procs {
            if entry.state == hamon_proto::ProcState::Unknown {
                continue;
            }
            out.push_str(&format!(
                "   {} (pid {}, state {})\n",
                entry.ptype,
                entry.pid,
                entry.state.display_for(entry.ptype)
            ));
            if verbose {
                out.push_str(&format!("    - exec-path [{}]\n", entry.exec_path));
                out.push_str(&format!("    - argv      [{}]\n", entry.args));
                out.push_str(&format!(
                    "    - registered-time   {}\n",
                    format_instant(entry.rtime)
                ));
                out.push_str(&format!(
                    "    - deregistered-time {}\n",
                    format_instant(entry.dtime)
                ));
                out.push_str(&format!(
                    "    - shutdown-time     {}\n",
                    format_instant(entry.ktime)
                ));
                out.push_str(&format!(
                    "    - start-time        {}\n",
                    format_instant(entry.stime)
                ));
            }
        }

        out
    }

    /// Ping host dump; refreshes the probe results first the way the
    /// periodic check does.
    pub fn ping_host_info(&self) -> String {
        let mut cluster = self.ctx.cluster.lock();
        if cluster.ping_hosts.is_empty() {
            return String::new();
        }

        let valid_exists = cluster.probe_ping_hosts();
        let enabled_now = valid_exists || cluster.compute_is_isolated();
        if enabled_now != cluster.is_ping_check_enabled {
            self.ctx
                .cluster_jobs
                .reschedule(cluster::jobs::LABEL_CHECK_VALID_PING_SERVER, TIMER_IMMEDIATELY);
        }

        let mut out = String::new();
        out.push_str(&format!(
            " HA-Ping Host Info (PING check {})\n",
            if enabled_now { "enabled" } else { "disabled" }
        ));
        for host in &cluster.ping_hosts {
            if host.is_tcp() {
                out.push_str(&format!(
                    "   {}:{} ({})\n",
                    host.host_name,
                    host.port,
                    host.result.as_str()
                ));
            } else {
                out.push_str(&format!(
                    "   {} ({})\n",
                    host.host_name,
                    host.result.as_str()
                ));
            }
        }

        out
    }

    /// Error-logging suppression state; empty while logging is on.
    pub fn admin_info(&self) -> String {
        match self.ctx.log_gate.event_message() {
            Some(msg) if !self.ctx.log_gate.is_enabled() => {
                format!(" HA-Admin Info\n  - error logging is disabled\n  - {}\n", msg)
            }
            _ => String::new(),
        }
    }

    /// Pending jobs of both queues.
    pub fn jobs_info(&self) -> String {
        let mut out = String::new();

        out.push_str(" HA-Job Info (cluster queue)\n");
        for (label, remaining) in self.ctx.cluster_jobs.pending() {
            out.push_str(&format!("   {} (in {} ms)\n", label, remaining.as_millis()));
        }
        out.push_str(" HA-Job Info (resource queue)\n");
        for (label, remaining) in self.ctx.resource_jobs.pending() {
            out.push_str(&format!("   {} (in {} ms)\n", label, remaining.as_millis()));
        }

        out
    }

    /// Classify an inbound connection: local Unix peers are always allowed,
    /// TCP peers must resolve to a cluster node address.
    pub fn check_request_eligibility(&self, peer: Option<IpAddr>) -> Eligibility {
        let Some(peer) = peer else {
            return Eligibility::EligibleLocal;
        };

        let cluster = self.ctx.cluster.lock();
        let mut result = Eligibility::Unauthorized;
        for node in &cluster.nodes {
            match resolve_host(&node.host_name) {
                Ok(addr) if addr == peer => return Eligibility::EligibleRemote,
                Ok(_) => {}
                Err(_) => {
                    warn!(host = %node.host_name, "failed to resolve node address");
                    result = Eligibility::Failed;
                }
            }
        }
        result
    }
}

fn format_instant(at: Option<Instant>) -> String {
    match at {
        Some(at) => {
            let elapsed = chrono::Duration::from_std(at.elapsed()).unwrap_or_default();
            let wall = chrono::Local::now() - elapsed;
            wall.format("%m/%d/%y %H:%M:%S%.3f").to_string()
        }
        None => "00/00/00 00:00:00.000".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::{server_register, test_ctx, MockConn};

    fn master() -> HaMaster {
        HaMaster::with_context(test_ctx())
    }

    #[test]
    fn test_node_info_lists_roster() {
        let master = master();
        let info = master.node_info(true);
        assert!(info.contains("HA-Node Info (current beta, state slave)"));
        assert!(info.contains("Node alpha (priority 1, state unknown)"));
        assert!(info.contains("score"));
        assert!(info.contains("missed heartbeat"));
    }

    #[test]
    fn test_process_info_lists_children() {
        let master = master();
        master
            .context()
            .register_process(MockConn::new(1), &server_register(321));

        let info = master.process_info(true);
        assert!(info.contains("HA-server (pid 321, state registered_and_standby)"));
        assert!(info.contains("argv      [db_server testdb]"));
    }

    #[test]
    fn test_admin_info_renders_only_when_gated() {
        let master = master();
        assert!(master.admin_info().is_empty());

        master
            .context()
            .log_gate
            .disable(crate::log_gate::NologReason::DemoteOnDiskFail, Some("stall"));
        let info = master.admin_info();
        assert!(info.contains("error logging is disabled"));
        assert!(info.contains("DEMOTE ON DISK FAILURE"));
    }

    #[test]
    fn test_prepare_deactivate_is_idempotent() {
        let master = master();
        master.prepare_deactivate().unwrap();
        assert!(master.context().resource.lock().shutdown);
        assert_eq!(master.context().resource_jobs.len(), 1);

        // second call must not enqueue another cleanup
        master.prepare_deactivate().unwrap();
        assert_eq!(master.context().resource_jobs.len(), 1);
    }

    #[test]
    fn test_deactivation_readiness_follows_connections() {
        let master = master();
        master
            .context()
            .register_process(MockConn::new(1), &server_register(100));
        assert!(!master.is_deactivation_ready());

        master.context().resource.lock().procs[0].conn = None;
        assert!(master.is_deactivation_ready());
    }

    #[test]
    fn test_deactivate_server_bookkeeping() {
        let master = master();
        assert_eq!(master.deactivating_server_count(), 0);

        master.start_deactivate_server_info();
        assert!(master.is_deactivation_started());

        // one live pid (ourselves), one stale
        master.context().deactivate.lock().server_pids = vec![std::process::id() as i32, i32::MAX - 1];
        assert_eq!(master.deactivating_server_count(), 1);
        // the dead pid was zeroed
        assert_eq!(master.context().deactivate.lock().server_pids[1], 0);

        master.finish_deactivate_server_info();
        assert!(!master.is_deactivation_started());
        assert_eq!(master.deactivating_server_count(), 0);
    }

    #[test]
    fn test_activate_refused_during_deactivation() {
        let master = master();
        master.start_deactivate_server_info();
        assert!(matches!(
            master.activate(),
            Err(MasterError::DeactivationInProgress)
        ));
    }

    #[test]
    fn test_eligibility_local_peer() {
        let master = master();
        assert_eq!(
            master.check_request_eligibility(None),
            Eligibility::EligibleLocal
        );
    }

    #[test]
    fn test_eligibility_unknown_peer() {
        let master = master();
        // node names alpha/beta do not resolve in the test environment, so
        // the classification degrades to Failed rather than Unauthorized
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let result = master.check_request_eligibility(Some(peer));
        assert!(matches!(
            result,
            Eligibility::Failed | Eligibility::Unauthorized
        ));
    }

    #[test]
    fn test_reconfigure_rejects_master_loss() {
        let master = master();
        {
            let mut cluster = master.context().cluster.lock();
            cluster.nodes[0].state = hamon_proto::NodeState::Master;
            cluster.master = Some(0);
        }

        let bad = HaConfig {
            node_list: "demo@beta,gamma".to_string(),
            ..HaConfig::default()
        };
        assert!(master.reconfigure(bad).is_err());
        // old config still in force
        assert_eq!(master.context().config().node_list, "demo@alpha,beta");
    }

    #[test]
    fn test_reconfigure_applies_new_config() {
        let master = master();
        let new = HaConfig {
            node_list: "demo@alpha,beta,gamma".to_string(),
            heartbeat_interval_ms: 250,
            ..HaConfig::default()
        };
        let info = master.reconfigure(new).unwrap();
        assert!(info.contains("gamma"));
        assert_eq!(master.context().config().heartbeat_interval_ms, 250);
    }
}
