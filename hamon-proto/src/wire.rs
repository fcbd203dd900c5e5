// hamon-proto: UDP heartbeat wire format
// Fixed-layout big-endian header followed by a 4-byte node-state payload.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::state::NodeState;

pub const GROUP_ID_LEN: usize = 64;
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Header bytes on the wire: type, flags, len, seq, group, orig, dest.
pub const HEADER_LEN: usize = 1 + 1 + 2 + 4 + GROUP_ID_LEN + 2 * MAX_HOSTNAME_LEN;

/// Only message type carried on the cluster UDP port.
pub const MSG_CLUSTER_HEARTBEAT: u8 = 0;

/// The request bit always occupies the high bit of the flags byte on the
/// wire, independent of the host platform.
const FLAG_REQUEST: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("length field {expected} does not match received payload {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("string field is not valid utf-8")]
    BadString,

    #[error("field '{0}' exceeds its wire width")]
    FieldTooLong(&'static str),

    #[error("node state {0} out of range")]
    BadNodeState(u32),
}

/// One cluster heartbeat, request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub is_request: bool,
    pub seq: u32,
    pub group_id: String,
    pub orig_host: String,
    pub dest_host: String,
    pub state: NodeState,
}

impl HeartbeatMessage {
    /// Serialize header + payload into a datagram buffer.
    pub fn pack(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 4);

        buf.put_u8(MSG_CLUSTER_HEARTBEAT);
        buf.put_u8(if self.is_request { FLAG_REQUEST } else { 0 });
        buf.put_u16(4); // payload: one big-endian u32
        buf.put_u32(self.seq);
        put_padded(&mut buf, &self.group_id, GROUP_ID_LEN, "group_id")?;
        put_padded(&mut buf, &self.orig_host, MAX_HOSTNAME_LEN, "orig_host")?;
        put_padded(&mut buf, &self.dest_host, MAX_HOSTNAME_LEN, "dest_host")?;
        buf.put_u32(self.state as u32);

        Ok(buf)
    }

    /// Parse a received datagram. The length field must account for every
    /// byte after the header, otherwise the datagram is rejected.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::TooShort(datagram.len()));
        }

        let mut buf = datagram;
        let msg_type = buf.get_u8();
        if msg_type != MSG_CLUSTER_HEARTBEAT {
            return Err(WireError::UnknownType(msg_type));
        }

        let flags = buf.get_u8();
        let len = buf.get_u16() as usize;
        if HEADER_LEN + len != datagram.len() {
            return Err(WireError::LengthMismatch {
                expected: HEADER_LEN + len,
                actual: datagram.len(),
            });
        }

        let seq = buf.get_u32();
        let group_id = get_padded(&mut buf, GROUP_ID_LEN)?;
        let orig_host = get_padded(&mut buf, MAX_HOSTNAME_LEN)?;
        let dest_host = get_padded(&mut buf, MAX_HOSTNAME_LEN)?;

        if len < 4 {
            return Err(WireError::TooShort(datagram.len()));
        }
        let raw_state = buf.get_u32();
        let state = NodeState::from_u32(raw_state).ok_or(WireError::BadNodeState(raw_state))?;

        Ok(Self {
            is_request: flags & FLAG_REQUEST != 0,
            seq,
            group_id,
            orig_host,
            dest_host,
            state,
        })
    }
}

fn put_padded(
    buf: &mut Vec<u8>,
    value: &str,
    width: usize,
    field: &'static str,
) -> Result<(), WireError> {
    let bytes = value.as_bytes();
    // keep room for the NUL terminator
    if bytes.len() >= width {
        return Err(WireError::FieldTooLong(field));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

fn get_padded(buf: &mut &[u8], width: usize) -> Result<String, WireError> {
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let value = std::str::from_utf8(&raw[..end])
        .map_err(|_| WireError::BadString)?
        .to_string();
    buf.advance(width);
    Ok(value)
}

/// Hostname comparison used everywhere a peer host is matched.
///
/// Case-insensitive; when exactly one side is fully qualified, only the
/// first label of the qualified side is compared.
pub fn are_hostnames_equal(lhs: &str, rhs: &str) -> bool {
    let lhs_dot = lhs.find('.');
    let rhs_dot = rhs.find('.');

    let (lhs, rhs) = match (lhs_dot, rhs_dot) {
        (Some(l), None) => (&lhs[..l], rhs),
        (None, Some(r)) => (lhs, &rhs[..r]),
        _ => (lhs, rhs),
    };

    lhs.eq_ignore_ascii_case(rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeartbeatMessage {
        HeartbeatMessage {
            is_request: true,
            seq: 7,
            group_id: "demo".to_string(),
            orig_host: "alpha".to_string(),
            dest_host: "beta".to_string(),
            state: NodeState::Master,
        }
    }

    #[test]
    fn test_pack_parse_round_trip() {
        let msg = sample();
        let wire = msg.pack().unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 4);

        let parsed = HeartbeatMessage::parse(&wire).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_request_bit_is_high_bit_of_flags() {
        let wire = sample().pack().unwrap();
        assert_eq!(wire[1], 0x80);

        let reply = HeartbeatMessage {
            is_request: false,
            ..sample()
        };
        assert_eq!(reply.pack().unwrap()[1], 0x00);
    }

    #[test]
    fn test_length_field_mismatch_rejected() {
        let mut wire = sample().pack().unwrap();
        wire.push(0); // trailing garbage the length field does not cover
        assert!(matches!(
            HeartbeatMessage::parse(&wire),
            Err(WireError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_short_datagram_rejected() {
        let wire = sample().pack().unwrap();
        assert!(matches!(
            HeartbeatMessage::parse(&wire[..HEADER_LEN - 1]),
            Err(WireError::TooShort(_))
        ));
    }

    #[test]
    fn test_bad_node_state_rejected() {
        let mut wire = sample().pack().unwrap();
        let payload = wire.len() - 4;
        wire[payload..].copy_from_slice(&99u32.to_be_bytes());
        assert_eq!(
            HeartbeatMessage::parse(&wire),
            Err(WireError::BadNodeState(99))
        );
    }

    #[test]
    fn test_oversized_hostname_rejected() {
        let msg = HeartbeatMessage {
            orig_host: "x".repeat(MAX_HOSTNAME_LEN),
            ..sample()
        };
        assert_eq!(msg.pack(), Err(WireError::FieldTooLong("orig_host")));
    }

    #[test]
    fn test_hostname_comparison() {
        assert!(are_hostnames_equal("alpha", "ALPHA"));
        assert!(are_hostnames_equal("alpha.example.com", "alpha"));
        assert!(are_hostnames_equal("alpha", "alpha.example.com"));
        assert!(!are_hostnames_equal("alpha.example.com", "beta"));
        // both qualified: full comparison
        assert!(!are_hostnames_equal("alpha.a.com", "alpha.b.com"));
    }
}
