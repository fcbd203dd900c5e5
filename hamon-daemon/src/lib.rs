// hamon-daemon - control socket surface of the hamond daemon
// Accepts the local HA children (binary protocol) and admin clients
// (line-oriented commands) on one Unix-domain socket.

pub mod admin;
pub mod control;

pub use admin::dispatch_admin_command;
pub use control::ControlServer;
