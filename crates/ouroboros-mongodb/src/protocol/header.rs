//! Message header and request ids

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{DriverError, Result};

pub const HEADER_LENGTH: usize = 16;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Process-wide, monotonically increasing request id
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }
}

/// The 16-byte prefix of every message, little-endian on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    pub fn parse(bytes: &[u8; HEADER_LENGTH]) -> Result<Self> {
        let field = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let message_length = field(0);
        if message_length < HEADER_LENGTH as i32 {
            return Err(DriverError::Protocol(format!(
                "message length {} is shorter than the header",
                message_length
            )));
        }
        let code = field(12);
        let op_code = OpCode::from_i32(code)
            .ok_or_else(|| DriverError::Protocol(format!("unknown opcode {}", code)))?;
        Ok(Self {
            message_length,
            request_id: field(4),
            response_to: field(8),
            op_code,
        })
    }

    /// Body length once the header has been read
    pub fn body_length(&self) -> usize {
        self.message_length as usize - HEADER_LENGTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader {
            message_length: 36,
            request_id: 7,
            response_to: 0,
            op_code: OpCode::Query,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_LENGTH);
        assert_eq!(&buf[0..4], &[36, 0, 0, 0]);
        assert_eq!(&buf[12..16], &2004_i32.to_le_bytes());

        let bytes: [u8; HEADER_LENGTH] = buf.try_into().unwrap();
        let parsed = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.body_length(), 20);
    }

    #[test]
    fn test_header_rejects_bad_values() {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[0] = 8;
        assert!(MessageHeader::parse(&bytes).is_err());

        bytes[0] = 16;
        bytes[12..16].copy_from_slice(&9999_i32.to_le_bytes());
        assert!(matches!(MessageHeader::parse(&bytes), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
