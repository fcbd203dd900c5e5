// hamon-core: cluster roster entries

use std::net::IpAddr;
use std::time::Instant;

use hamon_proto::{NodeState, PingResult};

/// Priority assigned to replica nodes; replicas never win an election.
pub const REPLICA_PRIORITY: u16 = 0x7FFF;

// Score bit patterns. Scores compare as signed 16-bit values, so the
// MASTER pattern (sign bit set) always beats any SLAVE score.
pub const SCORE_MASTER: u16 = 0x8000;
pub const SCORE_TO_BE_MASTER: u16 = 0xF000;
pub const SCORE_SLAVE: u16 = 0x0000;
pub const SCORE_UNKNOWN: u16 = 0x7FFF;

/// One member of the statically configured cluster.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub host_name: String,
    pub priority: u16,
    pub state: NodeState,
    pub score: i16,
    pub heartbeat_gap: i32,
    pub last_recv_hbtime: Option<Instant>,
}

impl NodeEntry {
    pub fn new(host_name: String, priority: u16) -> Self {
        Self {
            host_name,
            priority,
            state: NodeState::Unknown,
            score: 0,
            heartbeat_gap: 0,
            last_recv_hbtime: None,
        }
    }

    pub fn is_replica(&self) -> bool {
        self.state == NodeState::Replica
    }

    /// Election score: priority OR'ed with the state bit pattern, compared
    /// as a signed 16-bit value (lower wins).
    pub fn compute_score(&self) -> i16 {
        let bits = match self.state {
            NodeState::Master | NodeState::ToBeSlave => SCORE_MASTER,
            NodeState::ToBeMaster => SCORE_TO_BE_MASTER,
            NodeState::Slave => SCORE_SLAVE,
            NodeState::Replica | NodeState::Unknown => SCORE_UNKNOWN,
        };
        (self.priority | bits) as i16
    }
}

/// An external liveness probe target. Port 0 means ICMP ping.
#[derive(Debug, Clone)]
pub struct PingHost {
    pub host_name: String,
    pub port: u16,
    pub result: PingResult,
}

impl PingHost {
    pub fn icmp(host_name: String) -> Self {
        Self {
            host_name,
            port: 0,
            result: PingResult::Unknown,
        }
    }

    pub fn tcp(host_name: String, port: u16) -> Self {
        Self {
            host_name,
            port,
            result: PingResult::Unknown,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.port != 0
    }
}

/// Why a received heartbeat failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    UnidentifiedNode,
    GroupNameMismatch,
    IpAddrMismatch,
    CannotResolveHost,
}

impl ValidationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationFailure::UnidentifiedNode => "unidentified_node",
            ValidationFailure::GroupNameMismatch => "group_name_mismatch",
            ValidationFailure::IpAddrMismatch => "ip_addr_mismatch",
            ValidationFailure::CannotResolveHost => "cannot_resolve_host_name",
        }
    }
}

/// Ephemeral record of a rejected heartbeat sender, kept for diagnostics
/// only; never promoted into the roster.
#[derive(Debug, Clone)]
pub struct UiNode {
    pub host_name: String,
    pub group_id: String,
    pub addr: IpAddr,
    pub last_recv_time: Instant,
    pub reason: ValidationFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(priority: u16, state: NodeState) -> NodeEntry {
        let mut n = NodeEntry::new("n".to_string(), priority);
        n.state = state;
        n
    }

    #[test]
    fn test_score_is_priority_or_state_bits() {
        assert_eq!(
            node(1, NodeState::Master).compute_score(),
            (1u16 | SCORE_MASTER) as i16
        );
        assert_eq!(
            node(2, NodeState::ToBeSlave).compute_score(),
            (2u16 | SCORE_MASTER) as i16
        );
        assert_eq!(
            node(3, NodeState::ToBeMaster).compute_score(),
            (3u16 | SCORE_TO_BE_MASTER) as i16
        );
        assert_eq!(node(4, NodeState::Slave).compute_score(), 4);
        assert_eq!(
            node(5, NodeState::Unknown).compute_score(),
            SCORE_UNKNOWN as i16
        );
    }

    #[test]
    fn test_master_score_beats_slave_score() {
        // signed comparison: MASTER bit drives the score negative
        let master = node(2, NodeState::Master).compute_score();
        let slave = node(1, NodeState::Slave).compute_score();
        assert!(master < slave);
    }

    #[test]
    fn test_lower_priority_wins_within_same_state() {
        let strong = node(1, NodeState::Slave).compute_score();
        let weak = node(2, NodeState::Slave).compute_score();
        assert!(strong < weak);
    }
}
