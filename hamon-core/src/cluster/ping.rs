// hamon-core: external liveness probes
// ICMP goes through the system ping binary; TCP is a bounded connect.

use std::net::{TcpStream, ToSocketAddrs};
use std::process::Command;
use std::time::Duration;

use hamon_proto::PingResult;
use tracing::warn;

const TCP_PING_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Probe a host with one ICMP echo, one second deadline.
pub fn check_ping(host: &str) -> PingResult {
    let status = Command::new("ping")
        .args(["-w", "1", "-c", "1", host])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => PingResult::Success,
        Ok(_) => {
            warn!(host, "PING failed for host");
            PingResult::Failure
        }
        Err(err) => {
            warn!(host, %err, "PING command could not be run");
            PingResult::SysErr
        }
    }
}

/// Probe a host with a TCP connect, one second deadline.
pub fn check_tcp_ping(host: &str, port: u16) -> PingResult {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(err) => {
            warn!(host, port, %err, "TCP PING host did not resolve");
            return PingResult::Failure;
        }
    };

    for addr in addrs {
        if TcpStream::connect_timeout(&addr, TCP_PING_TIMEOUT).is_ok() {
            return PingResult::Success;
        }
    }

    warn!(host, port, "TCP PING failed for host");
    PingResult::Failure
}
