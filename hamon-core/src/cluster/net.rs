// hamon-core: cluster UDP channel
// One datagram socket per daemon; the reader thread parses heartbeats and
// feeds them into the cluster state, senders unicast requests and replies.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use hamon_proto::{HeartbeatMessage, NodeState, HEADER_LEN};
use tracing::debug;

use crate::context::HaContext;

/// Largest datagram the cluster port accepts.
const RECV_BUFFER_SZ: usize = 4096;

/// Read timeout of the reader loop; bounds shutdown latency only.
const READER_POLL: Duration = Duration::from_millis(50);

/// The cluster heartbeat socket.
pub struct HeartbeatChannel {
    socket: UdpSocket,
    port: u16,
}

impl HeartbeatChannel {
    /// Bind the heartbeat socket on every interface.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(READER_POLL))?;
        Ok(Self { socket, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Unicast a heartbeat request to a peer by hostname.
    pub fn send_request(
        &self,
        group_id: &str,
        orig_host: &str,
        dest_host: &str,
        state: NodeState,
    ) -> std::io::Result<()> {
        let addr = resolve_host_port(dest_host, self.port)?;
        self.send_heartbeat(addr, group_id, orig_host, dest_host, state, true)
    }

    /// Send a heartbeat reply straight back to the sender's address.
    pub fn send_reply(
        &self,
        addr: SocketAddr,
        group_id: &str,
        orig_host: &str,
        dest_host: &str,
        state: NodeState,
    ) -> std::io::Result<()> {
        self.send_heartbeat(addr, group_id, orig_host, dest_host, state, false)
    }

    fn send_heartbeat(
        &self,
        addr: SocketAddr,
        group_id: &str,
        orig_host: &str,
        dest_host: &str,
        state: NodeState,
        is_request: bool,
    ) -> std::io::Result<()> {
        let msg = HeartbeatMessage {
            is_request,
            seq: 0,
            group_id: group_id.to_string(),
            orig_host: orig_host.to_string(),
            dest_host: dest_host.to_string(),
            state,
        };
        let wire = msg
            .pack()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        self.socket.send_to(&wire, addr)?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }
}

/// Resolve a hostname to its primary address.
pub fn resolve_host(host: &str) -> std::io::Result<IpAddr> {
    let addr = (host, 0u16)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host"))?;
    Ok(addr.ip())
}

fn resolve_host_port(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host"))
}

/// UDP reader thread body: parse datagrams, hand them to the cluster.
/// Malformed packets are dropped; the drop is visible in debug logs only.
pub fn reader_loop(ctx: Arc<HaContext>, channel: Arc<HeartbeatChannel>) {
    let mut buf = [0u8; RECV_BUFFER_SZ];

    while !ctx.cluster.lock().shutdown {
        let (len, from) = match channel.recv(&mut buf) {
            Ok(received) => received,
            Err(ref err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                debug!(%err, "heartbeat recv failed");
                continue;
            }
        };

        if len < HEADER_LEN {
            debug!(len, "runt heartbeat datagram dropped");
            continue;
        }

        let msg = match HeartbeatMessage::parse(&buf[..len]) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, %from, "malformed heartbeat dropped");
                continue;
            }
        };

        crate::cluster::receive_heartbeat(&ctx, &channel, msg, from);
    }
}
