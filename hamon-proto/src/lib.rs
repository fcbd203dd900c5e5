// hamon-proto - Wire formats and shared state types
// UDP heartbeat header, control-socket framing, node/process state enums

pub mod control;
pub mod state;
pub mod wire;

pub use control::read_command;
pub use control::read_data;
pub use control::write_command;
pub use control::write_data;
pub use control::ControlCommand;
pub use control::ControlError;
pub use control::LogSequence;
pub use control::ProcRegister;
pub use control::PROC_ARGS_SLOTS;
pub use control::PROC_ARG_LEN;
pub use control::PROC_EXEC_PATH_LEN;
pub use state::HaServerState;
pub use state::NodeState;
pub use state::PingResult;
pub use state::ProcState;
pub use state::ProcType;
pub use wire::are_hostnames_equal;
pub use wire::HeartbeatMessage;
pub use wire::WireError;
pub use wire::GROUP_ID_LEN;
pub use wire::HEADER_LEN;
pub use wire::MAX_HOSTNAME_LEN;
