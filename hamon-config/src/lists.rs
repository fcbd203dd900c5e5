// hamon-config/src/lists.rs
// Parsers for the node / replica / ping-host list parameters

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListError {
    #[error("empty list")]
    Empty,

    #[error("missing group id (expected 'group@host[,host...]')")]
    MissingGroup,

    #[error("no hosts after group id")]
    NoHosts,

    #[error("invalid host '{0}'")]
    InvalidHost(String),

    #[error("invalid port in '{0}'")]
    InvalidPort(String),
}

/// A parsed `group@host[,host...]` list. Host order is priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeListSpec {
    pub group: String,
    pub hosts: Vec<String>,
}

/// A TCP ping target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPingHost {
    pub host: String,
    pub port: u16,
}

/// Parse `group@host[,host...]`.
pub fn parse_node_list(list: &str) -> Result<NodeListSpec, ListError> {
    let list = list.trim();
    if list.is_empty() {
        return Err(ListError::Empty);
    }

    let (group, hosts) = list.split_once('@').ok_or(ListError::MissingGroup)?;
    let group = group.trim();
    if group.is_empty() {
        return Err(ListError::MissingGroup);
    }

    let hosts: Vec<String> = hosts
        .split([',', ':', ' '])
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
        .collect();

    if hosts.is_empty() {
        return Err(ListError::NoHosts);
    }

    Ok(NodeListSpec {
        group: group.to_string(),
        hosts,
    })
}

/// Parse an ICMP ping host list: `host[,host...]`.
/// `0.0.0.0` is not an acceptable ping target and is rejected.
pub fn parse_ping_host_list(list: &str) -> Result<Vec<String>, ListError> {
    let hosts: Vec<String> = list
        .split([',', ':', ' '])
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
        .collect();

    if hosts.is_empty() {
        return Err(ListError::Empty);
    }
    for host in &hosts {
        if host == "0.0.0.0" {
            return Err(ListError::InvalidHost(host.clone()));
        }
    }

    Ok(hosts)
}

/// Parse a TCP ping host list: `host:port[,host:port...]`.
pub fn parse_tcp_ping_host_list(list: &str) -> Result<Vec<TcpPingHost>, ListError> {
    let mut hosts = Vec::new();

    for entry in list.split([',', ' ']).map(|h| h.trim()).filter(|h| !h.is_empty()) {
        let (host, port) = entry
            .split_once(':')
            .ok_or_else(|| ListError::InvalidPort(entry.to_string()))?;
        if host.is_empty() || host == "0.0.0.0" {
            return Err(ListError::InvalidHost(host.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ListError::InvalidPort(entry.to_string()))?;
        if port == 0 {
            return Err(ListError::InvalidPort(entry.to_string()));
        }
        hosts.push(TcpPingHost {
            host: host.to_string(),
            port,
        });
    }

    if hosts.is_empty() {
        return Err(ListError::Empty);
    }

    Ok(hosts)
}
