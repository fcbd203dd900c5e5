// hamon-daemon: control socket server
// One Unix-domain stream socket carries both the child protocol and the
// admin commands. The first byte tells them apart: the binary protocol
// always starts a frame with the high bytes of a small big-endian command
// code (0x00), admin clients send printable text lines.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hamon_core::{ControlConn, HaMaster};
use hamon_proto::{
    read_command, read_data, ControlCommand, HaServerState, LogSequence, ProcRegister,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::admin::dispatch_admin_command;

/// A child's control connection; clones of the stream share one writer.
pub struct UdsConn {
    id: u64,
    writer: Mutex<UnixStream>,
}

impl UdsConn {
    fn new(id: u64, stream: &UnixStream) -> std::io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id,
            writer: Mutex::new(stream.try_clone()?),
        }))
    }
}

impl ControlConn for UdsConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn send_command(&self, command: ControlCommand) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(&(command as u32).to_be_bytes())
    }

    fn send_data(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(data)
    }
}

/// Accept loop owner for the daemon's control socket.
pub struct ControlServer {
    master: Arc<HaMaster>,
    socket_path: PathBuf,
    conn_counter: AtomicU64,
}

impl ControlServer {
    pub fn new(master: Arc<HaMaster>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            master,
            socket_path: socket_path.into(),
            conn_counter: AtomicU64::new(1),
        }
    }

    /// Bind the socket (replacing a stale file) and serve forever. Every
    /// connection gets its own thread; child connections live as long as
    /// the child, admin connections are one command long.
    pub fn run(self: Arc<Self>) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "control socket listening");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "control socket accept failed");
                    continue;
                }
            };

            let server = self.clone();
            let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
            std::thread::Builder::new()
                .name(format!("hamon-conn-{}", conn_id))
                .spawn(move || server.serve_connection(conn_id, stream))?;
        }

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn serve_connection(&self, conn_id: u64, stream: UnixStream) {
        let mut reader = BufReader::new(match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                warn!(%err, "connection clone failed");
                return;
            }
        });

        let first = match reader.fill_buf() {
            Ok(buf) if !buf.is_empty() => buf[0],
            _ => return,
        };

        if first.is_ascii_graphic() {
            self.serve_admin(&mut reader, stream);
        } else {
            self.serve_child(conn_id, &mut reader, stream);
        }
    }

    /// One text command per connection, answered with the dump or a
    /// Success/Failure line.
    fn serve_admin(&self, reader: &mut BufReader<UnixStream>, mut stream: UnixStream) {
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() {
            return;
        }

        let reply = dispatch_admin_command(&self.master, line.trim());
        if let Err(err) = stream.write_all(reply.as_bytes()) {
            debug!(%err, "admin reply failed");
        }
    }

    /// Child protocol loop: registration first, then acks and EOF replies
    /// until the peer goes away.
    fn serve_child(&self, conn_id: u64, reader: &mut BufReader<UnixStream>, stream: UnixStream) {
        let ctx = self.master.context();

        let conn: Arc<UdsConn> = match UdsConn::new(conn_id, &stream) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%err, "child connection setup failed");
                return;
            }
        };

        // the first frame must be the registration record
        let registered = match read_command(reader) {
            Ok(ControlCommand::ProcRegister) => match read_data(reader, ProcRegister::WIRE_LEN) {
                Ok(payload) => match ProcRegister::parse(&payload) {
                    Ok(register) => ctx.register_process(conn.clone(), &register),
                    Err(err) => {
                        warn!(%err, "malformed registration record");
                        false
                    }
                },
                Err(err) => {
                    debug!(%err, "registration payload read failed");
                    false
                }
            },
            Ok(other) => {
                warn!(?other, "child connection did not start with a registration");
                false
            }
            Err(err) => {
                debug!(%err, "registration command read failed");
                false
            }
        };
        if !registered {
            return;
        }

        loop {
            match read_command(reader) {
                Ok(ControlCommand::ChangeModeAck) => {
                    let Ok(payload) = read_data(reader, 4) else { break };
                    let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    match HaServerState::from_u32(raw) {
                        Some(state) => ctx.receive_changemode_ack(conn_id, state),
                        None => debug!(raw, "changemode ack with unknown state"),
                    }
                }
                Ok(ControlCommand::EofReply) => {
                    let Ok(payload) = read_data(reader, LogSequence::WIRE_LEN) else { break };
                    match LogSequence::parse(&payload) {
                        Ok(eof) => ctx.receive_eof_reply(conn_id, eof),
                        Err(err) => debug!(%err, "malformed eof reply"),
                    }
                }
                Ok(other) => {
                    debug!(?other, "unexpected command from child");
                }
                Err(_) => break,
            }
        }

        // connection died: the supervisor decides whether to restart
        ctx.cleanup_conn_and_start_process(conn_id);
    }
}
