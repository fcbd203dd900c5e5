// Configuration loading and management

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env::apply_env_overrides;
use crate::lists;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// HA operating mode of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaMode {
    /// Master-eligible node; initial cluster state is SLAVE.
    Node,
    /// Read-only replica; initial cluster state is REPLICA.
    Replica,
}

/// HA control plane configuration.
///
/// Every interval is in the unit its field name carries. Values not present
/// in the file keep the daemon defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Master-eligible nodes: `group@host[,host...]`. Position defines priority.
    pub node_list: String,
    /// Replica nodes: `group@host[,host...]`. Group id must match `node_list`.
    pub replica_list: Option<String>,
    /// ICMP ping hosts: `host[,host...]`.
    pub ping_hosts: Option<String>,
    /// TCP ping hosts: `host:port[,host:port...]`. Ignored while `ping_hosts` is set.
    pub tcp_ping_hosts: Option<String>,
    /// UDP heartbeat port.
    pub port: u16,
    pub ha_mode: HaMode,

    pub heartbeat_interval_ms: u64,
    pub calc_score_interval_ms: u64,
    pub init_timer_ms: u64,
    pub failover_wait_time_ms: u64,
    pub max_heartbeat_gap: u32,

    pub changemode_interval_ms: u64,
    pub process_start_confirm_interval_ms: u64,
    pub process_dereg_confirm_interval_ms: u64,
    pub max_process_start_confirm: u32,
    pub max_process_dereg_confirm: u32,
    pub unacceptable_proc_restart_timediff_ms: u64,
    pub check_disk_failure_interval_secs: u64,
    pub update_hostname_interval_ms: u64,

    /// Unix-domain control socket the local children register through.
    pub control_socket: String,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            node_list: String::new(),
            replica_list: None,
            ping_hosts: None,
            tcp_ping_hosts: None,
            port: 59901,
            ha_mode: HaMode::Node,
            heartbeat_interval_ms: 500,
            calc_score_interval_ms: 3_000,
            init_timer_ms: 10_000,
            failover_wait_time_ms: 3_000,
            max_heartbeat_gap: 5,
            changemode_interval_ms: 5_000,
            process_start_confirm_interval_ms: 3_000,
            process_dereg_confirm_interval_ms: 500,
            max_process_start_confirm: 20,
            max_process_dereg_confirm: 120,
            unacceptable_proc_restart_timediff_ms: 120_000,
            check_disk_failure_interval_secs: 15,
            update_hostname_interval_ms: 10_000,
            control_socket: "/tmp/hamond.sock".to_string(),
        }
    }
}

/// Disk-failure sampling below this period would race the EOF refresh cycle.
const MIN_CHECK_DISK_FAILURE_INTERVAL_SECS: u64 = 10;

impl HaConfig {
    /// Effective disk-failure check interval; configured values below the
    /// floor are clamped up.
    pub fn effective_disk_check_interval_secs(&self) -> u64 {
        self.check_disk_failure_interval_secs
            .max(MIN_CHECK_DISK_FAILURE_INTERVAL_SECS)
    }
}

/// Load configuration from file and environment variables
///
/// Loading hierarchy: env > file > defaults
pub fn load_config(path: Option<&Path>) -> Result<HaConfig, ConfigError> {
    let mut config = match path {
        Some(p) => load_from_file(p)?,
        None => HaConfig::default(),
    };

    apply_env_overrides(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Load configuration from a TOML file path
pub fn load_from_file(path: &Path) -> Result<HaConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

    toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Validate a loaded configuration
pub fn validate_config(config: &HaConfig) -> Result<(), ConfigError> {
    let nodes = lists::parse_node_list(&config.node_list)
        .map_err(|e| ConfigError::ValidationError(format!("node_list: {}", e)))?;

    if let Some(replicas) = &config.replica_list {
        let replicas = lists::parse_node_list(replicas)
            .map_err(|e| ConfigError::ValidationError(format!("replica_list: {}", e)))?;
        if replicas.group != nodes.group {
            return Err(ConfigError::ValidationError(format!(
                "group id mismatch between node_list ('{}') and replica_list ('{}')",
                nodes.group, replicas.group
            )));
        }
    }

    if let Some(hosts) = &config.ping_hosts {
        lists::parse_ping_host_list(hosts)
            .map_err(|e| ConfigError::ValidationError(format!("ping_hosts: {}", e)))?;
    }
    if let Some(hosts) = &config.tcp_ping_hosts {
        lists::parse_tcp_ping_host_list(hosts)
            .map_err(|e| ConfigError::ValidationError(format!("tcp_ping_hosts: {}", e)))?;
    }

    if config.heartbeat_interval_ms == 0 || config.calc_score_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "heartbeat and calc-score intervals must be non-zero".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> HaConfig {
        HaConfig {
            node_list: "demo@alpha,beta".to_string(),
            ..HaConfig::default()
        }
    }

    #[test]
    fn test_defaults_match_daemon_defaults() {
        let config = HaConfig::default();
        assert_eq!(config.port, 59901);
        assert_eq!(config.heartbeat_interval_ms, 500);
        assert_eq!(config.calc_score_interval_ms, 3_000);
        assert_eq!(config.max_heartbeat_gap, 5);
        assert_eq!(config.max_process_dereg_confirm, 120);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_list = \"demo@alpha,beta\"\nport = 49901\nheartbeat_interval_ms = 200"
        )
        .unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.node_list, "demo@alpha,beta");
        assert_eq!(config.port, 49901);
        assert_eq!(config.heartbeat_interval_ms, 200);
        // untouched fields keep defaults
        assert_eq!(config.max_heartbeat_gap, 5);
    }

    #[test]
    fn test_validate_rejects_empty_node_list() {
        let config = HaConfig::default();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_group_mismatch() {
        let config = HaConfig {
            replica_list: Some("other@gamma".to_string()),
            ..base_config()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_accepts_matching_replica_list() {
        let config = HaConfig {
            replica_list: Some("demo@gamma".to_string()),
            ..base_config()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_disk_check_interval_clamped() {
        let config = HaConfig {
            check_disk_failure_interval_secs: 3,
            ..base_config()
        };
        assert_eq!(config.effective_disk_check_interval_secs(), 10);
    }
}
