// hamon-proto: control-socket protocol
// Framing between the daemon and its local HA children: a 4-byte big-endian
// command code followed by that command's fixed-size payload.

use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use thiserror::Error;

pub const PROC_EXEC_PATH_LEN: usize = 128;
pub const PROC_ARGS_SLOTS: usize = 16;
pub const PROC_ARG_LEN: usize = 64;

const PROC_REGISTER_LEN: usize = 4 + 4 + PROC_EXEC_PATH_LEN + PROC_ARGS_SLOTS * PROC_ARG_LEN;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown control command: {0}")]
    UnknownCommand(u32),

    #[error("field '{0}' exceeds its wire width")]
    FieldTooLong(&'static str),

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Commands exchanged on the control socket, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCommand {
    // child -> daemon
    ProcRegister = 1,
    ChangeModeAck = 2,
    EofReply = 3,
    // daemon -> child
    ChangeHaMode = 10,
    GetEof = 11,
    MasterHostname = 12,
    StartShutdown = 13,
}

impl ControlCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ControlCommand::ProcRegister),
            2 => Some(ControlCommand::ChangeModeAck),
            3 => Some(ControlCommand::EofReply),
            10 => Some(ControlCommand::ChangeHaMode),
            11 => Some(ControlCommand::GetEof),
            12 => Some(ControlCommand::MasterHostname),
            13 => Some(ControlCommand::StartShutdown),
            _ => None,
        }
    }
}

/// Write one command code.
pub fn write_command<W: Write>(writer: &mut W, command: ControlCommand) -> Result<(), ControlError> {
    writer.write_all(&(command as u32).to_be_bytes())?;
    Ok(())
}

/// Read one command code.
pub fn read_command<R: Read>(reader: &mut R) -> Result<ControlCommand, ControlError> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    let value = u32::from_be_bytes(raw);
    ControlCommand::from_u32(value).ok_or(ControlError::UnknownCommand(value))
}

/// Write a raw data block after a command.
pub fn write_data<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), ControlError> {
    writer.write_all(data)?;
    Ok(())
}

/// Read an exact-size data block.
pub fn read_data<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, ControlError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// An end-of-file log sequence number advertised by an active server.
/// `NULL` (no sample yet) is page -1 / offset -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogSequence {
    pub page_id: i64,
    pub offset: i16,
}

impl LogSequence {
    pub const NULL: LogSequence = LogSequence {
        page_id: -1,
        offset: -1,
    };

    pub const WIRE_LEN: usize = 8 + 2;

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn pack(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..8].copy_from_slice(&self.page_id.to_be_bytes());
        buf[8..].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, ControlError> {
        if data.len() < Self::WIRE_LEN {
            return Err(ControlError::Malformed("log sequence truncated"));
        }
        let mut buf = data;
        Ok(Self {
            page_id: buf.get_i64(),
            offset: buf.get_i16(),
        })
    }
}

impl std::fmt::Display for LogSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.page_id, self.offset)
    }
}

/// Registration record a child sends right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcRegister {
    pub pid: i32,
    pub proc_type: u32,
    pub exec_path: String,
    pub argv: Vec<String>,
}

impl ProcRegister {
    pub const WIRE_LEN: usize = PROC_REGISTER_LEN;

    /// The argv joined by single spaces; this string is the identity of a
    /// process entry in the supervisor roster.
    pub fn args_string(&self) -> String {
        self.argv.join(" ")
    }

    pub fn pack(&self) -> Result<Vec<u8>, ControlError> {
        if self.argv.len() > PROC_ARGS_SLOTS {
            return Err(ControlError::FieldTooLong("argv"));
        }

        let mut buf = Vec::with_capacity(PROC_REGISTER_LEN);
        buf.put_i32(self.pid);
        buf.put_u32(self.proc_type);
        put_padded(&mut buf, &self.exec_path, PROC_EXEC_PATH_LEN, "exec_path")?;
        for arg in &self.argv {
            put_padded(&mut buf, arg, PROC_ARG_LEN, "argv")?;
        }
        buf.resize(PROC_REGISTER_LEN, 0);

        Ok(buf)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ControlError> {
        if data.len() < PROC_REGISTER_LEN {
            return Err(ControlError::Malformed("register record truncated"));
        }

        let mut buf = data;
        let pid = buf.get_i32();
        let proc_type = buf.get_u32();
        let exec_path = get_padded(&mut buf, PROC_EXEC_PATH_LEN)?;

        let mut argv = Vec::new();
        for _ in 0..PROC_ARGS_SLOTS {
            let arg = get_padded(&mut buf, PROC_ARG_LEN)?;
            if !arg.is_empty() {
                argv.push(arg);
            }
        }

        Ok(Self {
            pid,
            proc_type,
            exec_path,
            argv,
        })
    }
}

fn put_padded(
    buf: &mut Vec<u8>,
    value: &str,
    width: usize,
    field: &'static str,
) -> Result<(), ControlError> {
    let bytes = value.as_bytes();
    if bytes.len() >= width {
        return Err(ControlError::FieldTooLong(field));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

fn get_padded(buf: &mut &[u8], width: usize) -> Result<String, ControlError> {
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let value = std::str::from_utf8(&raw[..end])
        .map_err(|_| ControlError::Malformed("field is not valid utf-8"))?
        .to_string();
    buf.advance(width);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trip() {
        let mut buf = Vec::new();
        write_command(&mut buf, ControlCommand::ChangeHaMode).unwrap();
        let parsed = read_command(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed, ControlCommand::ChangeHaMode);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let raw = 999u32.to_be_bytes();
        assert!(matches!(
            read_command(&mut raw.as_slice()),
            Err(ControlError::UnknownCommand(999))
        ));
    }

    #[test]
    fn test_proc_register_round_trip() {
        let reg = ProcRegister {
            pid: 4242,
            proc_type: 0,
            exec_path: "/usr/local/bin/db_server".to_string(),
            argv: vec!["db_server".to_string(), "testdb".to_string()],
        };

        let wire = reg.pack().unwrap();
        assert_eq!(wire.len(), ProcRegister::WIRE_LEN);

        let parsed = ProcRegister::parse(&wire).unwrap();
        assert_eq!(parsed, reg);
        assert_eq!(parsed.args_string(), "db_server testdb");
    }

    #[test]
    fn test_proc_register_truncated() {
        let reg = ProcRegister {
            pid: 1,
            proc_type: 1,
            exec_path: "/bin/x".to_string(),
            argv: vec!["x".to_string()],
        };
        let wire = reg.pack().unwrap();
        assert!(ProcRegister::parse(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn test_log_sequence_null_and_order() {
        assert!(LogSequence::NULL.is_null());

        let older = LogSequence { page_id: 10, offset: 100 };
        let newer = LogSequence { page_id: 11, offset: 0 };
        assert!(newer > older);

        let wire = newer.pack();
        assert_eq!(LogSequence::parse(&wire).unwrap(), newer);
    }
}
