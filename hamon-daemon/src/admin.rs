// hamon-daemon: admin command dispatch
// Line-oriented commands on the control socket, answered with the state
// dumps or a Success/Failure line.

use std::sync::Arc;
use std::time::Duration;

use hamon_core::HaMaster;
use tracing::info;

const SUCCESS: &str = "Success";
const FAILURE: &str = "Failure";

/// Execute one admin command and build its reply.
pub fn dispatch_admin_command(master: &Arc<HaMaster>, line: &str) -> String {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");
    let rest: Vec<&str> = parts.collect();

    info!(command, "admin command received");

    match command {
        "activate" => match master.activate() {
            Ok(()) => format!("{}.\n", SUCCESS),
            Err(err) => format!("{}. ({})\n", FAILURE, err),
        },

        "prepare-deactivate" => {
            master.start_deactivate_server_info();
            match master.prepare_deactivate() {
                Ok(()) => format!("{}.\n", SUCCESS),
                Err(err) => format!("{}. ({})\n", FAILURE, err),
            }
        }

        "deactivate" => run_deactivate(master, rest.first() == Some(&"immediate")),

        "reload" => {
            let config_path = std::env::var("HAMON_CONFIG").ok();
            match hamon_config::load_config(config_path.as_deref().map(std::path::Path::new)) {
                Ok(new_config) => match master.reconfigure(new_config) {
                    Ok(info) => format!("{}.\n{}", SUCCESS, info),
                    Err(err) => format!("{}. (failed to reload configuration: {})\n", FAILURE, err),
                },
                Err(err) => format!("{}. (failed to load configuration: {})\n", FAILURE, err),
            }
        }

        "deregister" => match rest.as_slice() {
            ["pid", pid] => match pid.parse::<i32>() {
                Ok(pid) => match master.context().deregister_by_pid(pid) {
                    Ok(()) => format!("{}. (pid:{})\n", SUCCESS, pid),
                    Err(err) => format!("{}. ({})\n", FAILURE, err),
                },
                Err(_) => format!("{}. (invalid pid '{}')\n", FAILURE, pid),
            },
            ["args", args @ ..] if !args.is_empty() => {
                let args = args.join(" ");
                match master.context().deregister_by_args(&args) {
                    Ok(()) => format!("{}. (args:{})\n", SUCCESS, args),
                    Err(err) => format!("{}. ({})\n", FAILURE, err),
                }
            }
            _ => format!("{}. (usage: deregister pid <n> | deregister args <argv...>)\n", FAILURE),
        },

        "util-start" => {
            if rest.is_empty() {
                return format!("{}. (usage: util-start <argv...>)\n", FAILURE);
            }
            let args = rest.join(" ");
            match master.context().start_util_process(&args) {
                Ok(()) => format!("{}.\n", SUCCESS),
                Err(err) => format!("{}. ({})\n", FAILURE, err),
            }
        }

        "kill-all" => {
            master.context().kill_all_ha_processes();
            format!("{}.\n", SUCCESS)
        }

        "node-info" => master.node_info(rest.first() == Some(&"verbose")),
        "proc-info" => master.process_info(rest.first() == Some(&"verbose")),
        "ping-host-info" => master.ping_host_info(),
        "admin-info" => master.admin_info(),
        "jobs-info" => master.jobs_info(),

        "" => format!("{}. (empty command)\n", FAILURE),
        other => format!("{}. (unknown command '{}')\n", FAILURE, other),
    }
}

/// The full two-phase deactivation: capture server pids, shut everything
/// down, wait for every control connection to drain, then tear the engine
/// apart. Blocks the admin connection until finished.
fn run_deactivate(master: &Arc<HaMaster>, immediately: bool) -> String {
    if !master.is_activated() {
        return format!("{}. (HA already deactivated)\n", FAILURE);
    }

    master.set_deactivate_immediately(immediately);

    if !master.is_deactivation_started() {
        master.start_deactivate_server_info();
        if let Err(err) = master.prepare_deactivate() {
            master.finish_deactivate_server_info();
            return format!("{}. ({})\n", FAILURE, err);
        }
    }

    let config = master.context().config();
    let poll = Duration::from_millis(config.process_dereg_confirm_interval_ms.max(100));
    // cleanup retries plus slack; after this the confirm job has SIGKILLed
    let mut rounds = config.max_process_dereg_confirm as u64 + 20;

    while !master.is_deactivation_ready() && rounds > 0 {
        std::thread::sleep(poll);
        rounds -= 1;
    }

    let result = if master.is_deactivation_ready() {
        match master.deactivate() {
            Ok(()) => format!("{}.\n", SUCCESS),
            Err(err) => format!("{}. ({})\n", FAILURE, err),
        }
    } else {
        format!("{}. (processes did not shut down in time)\n", FAILURE)
    };

    master.finish_deactivate_server_info();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use hamon_config::HaConfig;
    use hamon_core::HaContext;

    fn test_master() -> Arc<HaMaster> {
        let config = HaConfig {
            node_list: "demo@alpha,beta".to_string(),
            ..HaConfig::default()
        };
        let ctx = Arc::new(HaContext::with_host_name(config.clone(), "beta"));
        ctx.cluster.lock().load(&config).unwrap();
        Arc::new(HaMaster::with_context(ctx))
    }

    #[test]
    fn test_unknown_command() {
        let master = test_master();
        let reply = dispatch_admin_command(&master, "frobnicate");
        assert!(reply.starts_with("Failure"));
        assert!(reply.contains("frobnicate"));
    }

    #[test]
    fn test_node_info_command() {
        let master = test_master();
        let reply = dispatch_admin_command(&master, "node-info verbose");
        assert!(reply.contains("HA-Node Info"));
        assert!(reply.contains("score"));
    }

    #[test]
    fn test_deregister_requires_valid_pid() {
        let master = test_master();
        let reply = dispatch_admin_command(&master, "deregister pid not-a-pid");
        assert!(reply.starts_with("Failure"));

        let reply = dispatch_admin_command(&master, "deregister pid 424242");
        assert!(reply.starts_with("Failure"));
    }

    #[test]
    fn test_deactivate_when_not_activated() {
        let master = test_master();
        let reply = dispatch_admin_command(&master, "deactivate");
        assert!(reply.contains("already deactivated"));
    }

    #[test]
    fn test_prepare_deactivate_marks_shutdown() {
        let master = test_master();
        let reply = dispatch_admin_command(&master, "prepare-deactivate");
        assert!(reply.starts_with("Success"));
        assert!(master.context().resource.lock().shutdown);
        assert!(master.is_deactivation_started());
    }
}
