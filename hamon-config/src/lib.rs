// hamon-config - Configuration Management
// TOML-based configuration with environment variable overrides

pub mod config;
pub mod env;
pub mod lists;

pub use config::load_config;
pub use config::load_from_file;
pub use config::ConfigError;
pub use config::HaConfig;
pub use config::validate_config;
pub use config::HaMode;
pub use env::apply_env_overrides;
pub use lists::parse_node_list;
pub use lists::ListError;
pub use lists::parse_ping_host_list;
pub use lists::parse_tcp_ping_host_list;
pub use lists::NodeListSpec;
pub use lists::TcpPingHost;
