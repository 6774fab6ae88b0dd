//! 12-byte object identifiers

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;

use crate::datetime::DateTime;
use crate::error::{BsonError, Result};

static MACHINE_ID: Lazy<[u8; 3]> = Lazy::new(|| {
    let seed = match hostname::get() {
        Ok(name) => crc32fast::hash(name.to_string_lossy().as_bytes()),
        Err(_) => {
            let random = uuid::Uuid::new_v4();
            crc32fast::hash(random.as_bytes())
        }
    };
    let bytes = seed.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
});

static OID_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(random_seed()));

/// 3-byte hash of this machine's host name
pub(crate) fn machine_id() -> [u8; 3] {
    *MACHINE_ID
}

/// Low 16 bits of the process id
pub(crate) fn process_id() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// Random 24-bit counter seed
pub(crate) fn random_seed() -> u32 {
    let random = uuid::Uuid::new_v4();
    let b = random.as_bytes();
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

/// Object identifier: seconds, machine, process, counter
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a fresh identifier stamped with the current time
    pub fn new() -> Self {
        let seconds = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let counter = OID_COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;
        Self::from_parts(seconds, machine_id(), process_id(), counter)
    }

    pub fn from_parts(timestamp: u32, machine: [u8; 3], pid: u16, counter: u32) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());
        bytes[4..7].copy_from_slice(&machine);
        bytes[7..9].copy_from_slice(&pid.to_be_bytes());
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Seconds since the epoch at generation time
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn machine(&self) -> [u8; 3] {
        [self.0[4], self.0[5], self.0[6]]
    }

    pub fn pid(&self) -> u16 {
        u16::from_be_bytes([self.0[7], self.0[8]])
    }

    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([0, self.0[9], self.0[10], self.0[11]])
    }

    pub fn creation_time(&self) -> DateTime {
        DateTime::from_millis(self.timestamp() as i64 * 1000)
    }

    /// All-zero identifier
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 12]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() != 24 {
            return Err(BsonError::InvalidObjectId(format!(
                "expected 24 hex characters, got {}",
                s.len()
            )));
        }
        let decoded = hex::decode(s).map_err(|e| BsonError::InvalidObjectId(e.to_string()))?;
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl FromStr for ObjectId {
    type Err = BsonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}
