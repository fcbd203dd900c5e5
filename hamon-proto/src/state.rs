// hamon-proto: Node, process and ping state enums

/// Cluster-level state of a node.
///
/// The numeric values travel in the heartbeat payload and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum NodeState {
    Unknown = 0,
    Slave = 1,
    ToBeMaster = 2,
    ToBeSlave = 3,
    Master = 4,
    Replica = 5,
}

impl NodeState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NodeState::Unknown),
            1 => Some(NodeState::Slave),
            2 => Some(NodeState::ToBeMaster),
            3 => Some(NodeState::ToBeSlave),
            4 => Some(NodeState::Master),
            5 => Some(NodeState::Replica),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Unknown => "unknown",
            NodeState::Slave => "slave",
            NodeState::ToBeMaster => "to-be-master",
            NodeState::ToBeSlave => "to-be-slave",
            NodeState::Master => "master",
            NodeState::Replica => "replica",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcType {
    Server = 0,
    Copylogdb = 1,
    Applylogdb = 2,
}

impl ProcType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ProcType::Server),
            1 => Some(ProcType::Copylogdb),
            2 => Some(ProcType::Applylogdb),
            _ => None,
        }
    }

    /// Connection-name prefix the router tags HA connections with.
    pub fn from_name_prefix(prefix: u8) -> Option<Self> {
        match prefix {
            b'#' => Some(ProcType::Server),
            b'$' => Some(ProcType::Copylogdb),
            b'%' => Some(ProcType::Applylogdb),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcType::Server => "HA-server",
            ProcType::Copylogdb => "HA-copylogdb",
            ProcType::Applylogdb => "HA-applylogdb",
        }
    }
}

impl std::fmt::Display for ProcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a supervised process entry.
///
/// Registered-and-standby shares the plain registered value: an auxiliary
/// process is simply "registered" while a server process in the same state
/// is a standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProcState {
    Unknown = 0,
    Dead = 1,
    Deregistered = 2,
    Started = 3,
    NotRegistered = 4,
    Registered = 5,
    RegisteredAndToBeStandby = 6,
    RegisteredAndActive = 7,
    RegisteredAndToBeActive = 8,
}

impl ProcState {
    pub const REGISTERED_AND_STANDBY: ProcState = ProcState::Registered;

    pub fn is_registered(&self) -> bool {
        *self >= ProcState::Registered
    }

    pub fn display_for(&self, ptype: ProcType) -> &'static str {
        match self {
            ProcState::Unknown => "unknown",
            ProcState::Dead => "dead",
            ProcState::Deregistered => "deregistered",
            ProcState::Started => "started",
            ProcState::NotRegistered => "not_registered",
            ProcState::Registered => {
                if ptype == ProcType::Server {
                    "registered_and_standby"
                } else {
                    "registered"
                }
            }
            ProcState::RegisteredAndToBeStandby => "registered_and_to_be_standby",
            ProcState::RegisteredAndActive => "registered_and_active",
            ProcState::RegisteredAndToBeActive => "registered_and_to_be_active",
        }
    }
}

/// HA mode the server child reports / is told to assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HaServerState {
    Idle = 0,
    Active = 1,
    ToBeActive = 2,
    Standby = 3,
    ToBeStandby = 4,
    Maintenance = 5,
    Dead = 6,
}

impl HaServerState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(HaServerState::Idle),
            1 => Some(HaServerState::Active),
            2 => Some(HaServerState::ToBeActive),
            3 => Some(HaServerState::Standby),
            4 => Some(HaServerState::ToBeStandby),
            5 => Some(HaServerState::Maintenance),
            6 => Some(HaServerState::Dead),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HaServerState::Idle => "idle",
            HaServerState::Active => "active",
            HaServerState::ToBeActive => "to-be-active",
            HaServerState::Standby => "standby",
            HaServerState::ToBeStandby => "to-be-standby",
            HaServerState::Maintenance => "maintenance",
            HaServerState::Dead => "dead",
        }
    }
}

/// Result of the last probe against a ping host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Unknown,
    Success,
    /// The ping host coincides with a cluster node; sticky once set.
    UselessHost,
    SysErr,
    Failure,
}

impl PingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingResult::Unknown => "UNKNOWN",
            PingResult::Success => "SUCCESS",
            PingResult::UselessHost => "SKIPPED",
            PingResult::SysErr => "ERROR",
            PingResult::Failure => "FAILURE",
        }
    }
}
