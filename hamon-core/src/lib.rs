// hamon-core - HA control plane engine
// Cluster membership / leader election driven by UDP heartbeats, plus the
// local resource supervisor that keeps child processes in the matching
// active/standby role. Both engines run on expiry-sorted job queues, one
// dedicated worker thread each.

pub mod cluster;
pub mod context;
pub mod jobs;
pub mod log_gate;
pub mod master;
pub mod resource;

pub use context::ControlConn;
pub use context::HaContext;
pub use jobs::JobQueue;
pub use log_gate::LogGate;
pub use log_gate::NologReason;
pub use master::Eligibility;
pub use master::HaMaster;
pub use master::MasterError;
