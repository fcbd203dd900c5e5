// hamon-config/src/env.rs
// Environment variable override support

use std::env;

use crate::config::{HaConfig, HaMode};

/// Merge environment variables into a loaded configuration.
/// Environment variables override config file values.
///
/// Format: HAMON_<KEY> with the key upper-cased.
/// Examples:
///   HAMON_NODE_LIST=demo@alpha,beta
///   HAMON_PORT=59901
///   HAMON_HEARTBEAT_INTERVAL_MS=500
pub fn apply_env_overrides(config: &mut HaConfig) {
    if let Ok(v) = env::var("HAMON_NODE_LIST") {
        config.node_list = v;
    }
    if let Ok(v) = env::var("HAMON_REPLICA_LIST") {
        config.replica_list = Some(v);
    }
    if let Ok(v) = env::var("HAMON_PING_HOSTS") {
        config.ping_hosts = Some(v);
    }
    if let Ok(v) = env::var("HAMON_TCP_PING_HOSTS") {
        config.tcp_ping_hosts = Some(v);
    }
    if let Ok(v) = env::var("HAMON_CONTROL_SOCKET") {
        config.control_socket = v;
    }
    if let Ok(v) = env::var("HAMON_HA_MODE") {
        match v.to_lowercase().as_str() {
            "replica" => config.ha_mode = HaMode::Replica,
            "node" => config.ha_mode = HaMode::Node,
            _ => {}
        }
    }

    override_u16(&mut config.port, "HAMON_PORT");
    override_u64(&mut config.heartbeat_interval_ms, "HAMON_HEARTBEAT_INTERVAL_MS");
    override_u64(&mut config.calc_score_interval_ms, "HAMON_CALC_SCORE_INTERVAL_MS");
    override_u64(&mut config.init_timer_ms, "HAMON_INIT_TIMER_MS");
    override_u64(&mut config.failover_wait_time_ms, "HAMON_FAILOVER_WAIT_TIME_MS");
    override_u32(&mut config.max_heartbeat_gap, "HAMON_MAX_HEARTBEAT_GAP");
    override_u64(&mut config.changemode_interval_ms, "HAMON_CHANGEMODE_INTERVAL_MS");
    override_u64(
        &mut config.process_start_confirm_interval_ms,
        "HAMON_PROCESS_START_CONFIRM_INTERVAL_MS",
    );
    override_u64(
        &mut config.process_dereg_confirm_interval_ms,
        "HAMON_PROCESS_DEREG_CONFIRM_INTERVAL_MS",
    );
    override_u32(&mut config.max_process_start_confirm, "HAMON_MAX_PROCESS_START_CONFIRM");
    override_u32(&mut config.max_process_dereg_confirm, "HAMON_MAX_PROCESS_DEREG_CONFIRM");
    override_u64(
        &mut config.unacceptable_proc_restart_timediff_ms,
        "HAMON_UNACCEPTABLE_PROC_RESTART_TIMEDIFF_MS",
    );
    override_u64(
        &mut config.check_disk_failure_interval_secs,
        "HAMON_CHECK_DISK_FAILURE_INTERVAL_SECS",
    );
    override_u64(
        &mut config.update_hostname_interval_ms,
        "HAMON_UPDATE_HOSTNAME_INTERVAL_MS",
    );
}

fn override_u64(target: &mut u64, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse::<u64>() {
            *target = parsed;
        }
    }
}

fn override_u32(target: &mut u32, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse::<u32>() {
            *target = parsed;
        }
    }
}

fn override_u16(target: &mut u16, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse::<u16>() {
            *target = parsed;
        }
    }
}
