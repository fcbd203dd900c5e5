// hamon-core: cluster state and membership
// Owns the node roster, the ping-host set and the unidentified-node cache.
// The leader-election jobs in `jobs` drive the transitions.

pub mod jobs;
pub mod net;
pub mod node;
pub mod ping;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hamon_config::{HaConfig, HaMode};
use hamon_proto::{are_hostnames_equal, HeartbeatMessage, NodeState, PingResult};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::HaContext;
use crate::jobs::TIMER_IMMEDIATELY;
use net::HeartbeatChannel;
use node::{NodeEntry, PingHost, UiNode, ValidationFailure, REPLICA_PRIORITY, SCORE_TO_BE_MASTER, SCORE_UNKNOWN};

/// Unidentified senders older than this are reaped.
pub const UI_NODE_CLEANUP_AGE: Duration = Duration::from_secs(3600);

/// Unidentified senders older than this are hidden from the node dump.
pub const UI_NODE_CACHE_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid node list: {0}")]
    BadNodeList(String),

    #[error("local host '{0}' does not appear in the configured node lists")]
    LocalNodeMissing(String),

    #[error("a replica-mode node must be listed in replica_list, not node_list")]
    ReplicaInNodeList,

    #[error("no valid ping host responded")]
    NoValidPingHost,

    #[error("heartbeat socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("master node would not survive the reload")]
    MasterLost,
}

/// Snapshot taken before a reload so a failed rebuild can be rolled back.
pub struct ClusterSnapshot {
    nodes: Vec<NodeEntry>,
    ping_hosts: Vec<PingHost>,
    state: NodeState,
    myself: Option<usize>,
    master: Option<usize>,
}

/// The cluster root: one per daemon, guarded by its mutex in `HaContext`.
pub struct Cluster {
    pub state: NodeState,
    pub group_id: String,
    /// Local hostname; exactly one roster entry matches it.
    pub host_name: String,

    pub nodes: Vec<NodeEntry>,
    pub myself: Option<usize>,
    pub master: Option<usize>,

    pub shutdown: bool,
    pub hide_to_demote: bool,
    pub is_isolated: bool,
    pub is_ping_check_enabled: bool,

    pub ping_hosts: Vec<PingHost>,
    pub ui_nodes: Vec<UiNode>,

    pub channel: Option<Arc<HeartbeatChannel>>,
}

impl Cluster {
    pub fn new(host_name: String) -> Self {
        Self {
            state: NodeState::Unknown,
            group_id: String::new(),
            host_name,
            nodes: Vec::new(),
            myself: None,
            master: None,
            shutdown: false,
            hide_to_demote: false,
            is_isolated: false,
            is_ping_check_enabled: true,
            ping_hosts: Vec::new(),
            ui_nodes: Vec::new(),
            channel: None,
        }
    }

    /// Build roster and ping hosts from configuration. The roster is
    /// immutable until the next reload.
    pub fn load(&mut self, config: &HaConfig) -> Result<(), ClusterError> {
        self.state = match config.ha_mode {
            HaMode::Replica => NodeState::Replica,
            HaMode::Node => NodeState::Slave,
        };
        self.master = None;
        self.myself = None;
        self.nodes.clear();
        self.ping_hosts.clear();

        self.load_group_and_node_list(config)?;
        self.load_ping_hosts(config)?;

        Ok(())
    }

    fn load_group_and_node_list(&mut self, config: &HaConfig) -> Result<(), ClusterError> {
        let spec = hamon_config::parse_node_list(&config.node_list)
            .map_err(|e| ClusterError::BadNodeList(e.to_string()))?;

        self.group_id = spec.group;
        for (index, host) in spec.hosts.iter().enumerate() {
            self.add_node(host, index as u16 + 1);
        }

        if self.state == NodeState::Replica && self.myself.is_some() {
            return Err(ClusterError::ReplicaInNodeList);
        }

        if let Some(replicas) = &config.replica_list {
            let spec = hamon_config::parse_node_list(replicas)
                .map_err(|e| ClusterError::BadNodeList(e.to_string()))?;
            if spec.group != self.group_id {
                return Err(ClusterError::BadNodeList(
                    "group id differs between node_list and replica_list".to_string(),
                ));
            }
            let before = self.myself;
            for host in &spec.hosts {
                self.add_node(host, REPLICA_PRIORITY);
            }
            if self.myself != before {
                // self lives in the replica list
                self.state = NodeState::Replica;
            }
        }

        match self.myself {
            Some(_) => Ok(()),
            None => Err(ClusterError::LocalNodeMissing(self.host_name.clone())),
        }
    }

    fn add_node(&mut self, host_name: &str, priority: u16) {
        // `localhost` is rewritten so one roster entry matches self
        let host_name = if are_hostnames_equal(host_name, "localhost") {
            self.host_name.clone()
        } else {
            host_name.to_string()
        };

        let is_self = are_hostnames_equal(&host_name, &self.host_name);
        self.nodes.push(NodeEntry::new(host_name, priority));
        if is_self {
            self.myself = Some(self.nodes.len() - 1);
        }
    }

    fn load_ping_hosts(&mut self, config: &HaConfig) -> Result<(), ClusterError> {
        if let Some(list) = &config.ping_hosts {
            let hosts = hamon_config::parse_ping_host_list(list)
                .map_err(|e| ClusterError::BadNodeList(e.to_string()))?;
            self.ping_hosts = hosts.into_iter().map(PingHost::icmp).collect();
            return Ok(());
        }

        // TCP targets only apply while no ICMP host is configured
        if let Some(list) = &config.tcp_ping_hosts {
            let hosts = hamon_config::parse_tcp_ping_host_list(list)
                .map_err(|e| ClusterError::BadNodeList(e.to_string()))?;
            self.ping_hosts = hosts
                .into_iter()
                .map(|h| PingHost::tcp(h.host, h.port))
                .collect();
        }

        Ok(())
    }

    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| are_hostnames_equal(name, &n.host_name))
    }

    pub fn find_node_except_me(&self, name: &str) -> Option<usize> {
        if are_hostnames_equal(name, &self.host_name) {
            return None;
        }
        self.find_node(name)
    }

    /// Every non-replica peer except self is in state UNKNOWN.
    pub fn compute_is_isolated(&self) -> bool {
        self.nodes.iter().enumerate().all(|(idx, node)| {
            node.is_replica() || Some(idx) == self.myself || node.state == NodeState::Unknown
        })
    }

    /// A heartbeat arrived from every peer within the last interval.
    pub fn received_heartbeat_from_all(&self, heartbeat_interval: Duration) -> bool {
        let now = Instant::now();
        self.nodes.iter().enumerate().all(|(idx, node)| {
            if Some(idx) == self.myself {
                return true;
            }
            match node.last_recv_hbtime {
                Some(at) => now.duration_since(at) <= heartbeat_interval,
                None => false,
            }
        })
    }

    /// Recompute every score, reset silent peers to UNKNOWN, elect the
    /// lowest score as the tentative master. Returns the number of nodes
    /// whose score carries a master bit.
    pub fn calc_score(&mut self, max_heartbeat_gap: u32, calc_interval: Duration) -> i32 {
        // the externally announced state always wins over the roster entry
        if let Some(myself) = self.myself {
            self.nodes[myself].state = self.state;
        }

        let now = Instant::now();
        let mut num_master = 0;
        let mut min_score = SCORE_UNKNOWN as i16;
        let mut master = self.master;

        for (idx, node) in self.nodes.iter_mut().enumerate() {
            let silent_too_long = match node.last_recv_hbtime {
                Some(at) => now.duration_since(at) > calc_interval,
                None => false,
            };
            if node.heartbeat_gap > max_heartbeat_gap as i32 || silent_too_long {
                node.heartbeat_gap = 0;
                node.last_recv_hbtime = None;
                node.state = NodeState::Unknown;
            }

            node.score = node.compute_score();
            if node.score < min_score {
                min_score = node.score;
                master = Some(idx);
            }
            if node.score < SCORE_TO_BE_MASTER as i16 {
                num_master += 1;
            }
        }

        self.master = master;
        num_master
    }

    /// Unicast a heartbeat request to every peer and charge their gap.
    pub fn request_heartbeat_to_all(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        let group_id = self.group_id.clone();
        let host_name = self.host_name.clone();
        let state = self.state;

        for node in &mut self.nodes {
            if are_hostnames_equal(&host_name, &node.host_name) {
                continue;
            }
            if let Err(err) = channel.send_request(&group_id, &host_name, &node.host_name, state) {
                debug!(dest = %node.host_name, %err, "heartbeat request failed");
            }
            node.heartbeat_gap += 1;
        }
    }

    /// Classify a received heartbeat against the roster.
    pub fn validate_heartbeat(
        &self,
        orig_host: &str,
        group_id: &str,
        from: IpAddr,
    ) -> Result<usize, ValidationFailure> {
        let Some(idx) = self.find_node_except_me(orig_host) else {
            return Err(ValidationFailure::UnidentifiedNode);
        };

        if group_id != self.group_id {
            return Err(ValidationFailure::GroupNameMismatch);
        }

        match net::resolve_host(orig_host) {
            Ok(addr) if addr == from => Ok(idx),
            Ok(_) => Err(ValidationFailure::IpAddrMismatch),
            Err(_) => Err(ValidationFailure::CannotResolveHost),
        }
    }

    pub fn find_ui_node(&self, host_name: &str, group_id: &str, addr: IpAddr) -> Option<usize> {
        self.ui_nodes.iter().position(|n| {
            are_hostnames_equal(&n.host_name, host_name) && n.group_id == group_id && n.addr == addr
        })
    }

    /// Record a rejected sender. A re-appearing triple with a different
    /// reason replaces the old record instead of updating it.
    pub fn note_ui_node(
        &mut self,
        host_name: &str,
        group_id: &str,
        addr: IpAddr,
        reason: ValidationFailure,
    ) {
        if let Some(idx) = self.find_ui_node(host_name, group_id, addr) {
            if self.ui_nodes[idx].reason == reason {
                self.ui_nodes[idx].last_recv_time = Instant::now();
                return;
            }
            self.ui_nodes.remove(idx);
        }

        warn!(
            host = host_name,
            group = group_id,
            ip = %addr,
            reason = reason.as_str(),
            "receive heartbeat from unidentified host"
        );
        self.ui_nodes.push(UiNode {
            host_name: host_name.to_string(),
            group_id: group_id.to_string(),
            addr,
            last_recv_time: Instant::now(),
            reason,
        });
    }

    /// Reap unidentified-node records unseen for an hour.
    pub fn cleanup_ui_nodes(&mut self) {
        let now = Instant::now();
        self.ui_nodes
            .retain(|n| now.duration_since(n.last_recv_time) <= UI_NODE_CLEANUP_AGE);
    }

    /// Probe every ping host, remembering each result. Returns true when at
    /// least one host answered. Hosts that coincide with a cluster node are
    /// marked useless once and stay skipped.
    pub fn probe_ping_hosts(&mut self) -> bool {
        let mut any_success = false;

        let node_names: Vec<String> = self.nodes.iter().map(|n| n.host_name.clone()).collect();
        for host in &mut self.ping_hosts {
            if host.result == PingResult::UselessHost {
                continue;
            }
            if node_names
                .iter()
                .any(|n| are_hostnames_equal(n, &host.host_name))
            {
                warn!(host = %host.host_name, "useless PING host name");
                host.result = PingResult::UselessHost;
                continue;
            }

            host.result = if host.is_tcp() {
                ping::check_tcp_ping(&host.host_name, host.port)
            } else {
                ping::check_ping(&host.host_name)
            };

            if host.result == PingResult::Success {
                any_success = true;
            }
        }

        any_success
    }

    /// "Ping check is usable": some host answered, or none are configured.
    pub fn check_valid_ping_server(&mut self) -> bool {
        if self.ping_hosts.is_empty() {
            return true;
        }
        self.probe_ping_hosts()
    }

    /// Take a rollback snapshot for reload.
    pub fn snapshot(&mut self) -> ClusterSnapshot {
        ClusterSnapshot {
            nodes: std::mem::take(&mut self.nodes),
            ping_hosts: std::mem::take(&mut self.ping_hosts),
            state: self.state,
            myself: self.myself.take(),
            master: self.master.take(),
        }
    }

    /// Restore a snapshot after a failed reload.
    pub fn restore(&mut self, snapshot: ClusterSnapshot) {
        self.nodes = snapshot.nodes;
        self.ping_hosts = snapshot.ping_hosts;
        self.state = snapshot.state;
        self.myself = snapshot.myself;
        self.master = snapshot.master;
    }

    /// Rebuild from new configuration, carrying peer state over for nodes
    /// that survive and keeping the master pointer on the same hostname.
    /// Fails without touching self when the current master is gone from the
    /// new list.
    pub fn reload(&mut self, config: &HaConfig) -> Result<(), ClusterError> {
        let old = self.snapshot();
        let old_master_host = old.master.map(|idx| old.nodes[idx].host_name.clone());

        if let Err(err) = self.load(config) {
            self.restore(old);
            return Err(err);
        }

        // the master must survive a reload
        if let Some(master_host) = &old_master_host {
            match self.find_node(master_host) {
                Some(idx) => self.master = Some(idx),
                None => {
                    self.restore(old);
                    return Err(ClusterError::MasterLost);
                }
            }
        }

        for node in &mut self.nodes {
            if let Some(prev) = old
                .nodes
                .iter()
                .find(|o| are_hostnames_equal(&o.host_name, &node.host_name))
            {
                node.state = prev.state;
                node.score = prev.score;
                node.heartbeat_gap = prev.heartbeat_gap;
                node.last_recv_hbtime = prev.last_recv_hbtime;
            }
        }
        // the announced local state survives as well
        self.state = old.state;

        Ok(())
    }
}

/// Handle one parsed heartbeat datagram from the UDP reader.
pub fn receive_heartbeat(
    ctx: &Arc<HaContext>,
    channel: &HeartbeatChannel,
    msg: HeartbeatMessage,
    from: SocketAddr,
) {
    let mut master_state_changed = false;

    {
        let mut cluster = ctx.cluster.lock();
        if cluster.shutdown {
            return;
        }

        // wrong destination: not ours, drop silently
        if !are_hostnames_equal(&cluster.host_name, &msg.dest_host) {
            debug!(dest = %msg.dest_host, "heartbeat for another destination dropped");
            return;
        }

        let valid = cluster.validate_heartbeat(&msg.orig_host, &msg.group_id, from.ip());
        if let Err(reason) = valid {
            cluster.note_ui_node(&msg.orig_host, &msg.group_id, from.ip(), reason);
        }

        // a group mismatch never mutates peer state nor produces a reply
        if msg.group_id != cluster.group_id {
            return;
        }

        // reply even to senders that failed validation, so a reconfigured
        // peer still sees us and does not elect a second master
        if msg.is_request && !cluster.hide_to_demote {
            let group_id = cluster.group_id.clone();
            let host_name = cluster.host_name.clone();
            let state = cluster.state;
            if let Err(err) = channel.send_reply(from, &group_id, &host_name, &msg.orig_host, state)
            {
                debug!(%err, "heartbeat reply failed");
            }
        }

        // only a fully validated heartbeat touches peer state
        match valid {
            Ok(idx) => {
                let node = &mut cluster.nodes[idx];
                if node.state == NodeState::Master && node.state != msg.state {
                    master_state_changed = true;
                }
                node.state = msg.state;
                node.heartbeat_gap = (node.heartbeat_gap - 1).max(0);
                node.last_recv_hbtime = Some(Instant::now());
            }
            Err(_) => {
                debug!(host = %msg.orig_host, "rejected heartbeat left peer state untouched");
            }
        }
    }

    if master_state_changed {
        info!("peer node state has changed; recomputing scores");
        ctx.cluster_jobs.reschedule(jobs::LABEL_CALC_SCORE, TIMER_IMMEDIATELY);
    }
}
