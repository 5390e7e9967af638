//! Core types for TickDB

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Timestamp key; the unit is caller-defined and the engine only requires
/// that appended values be strictly increasing
pub type Timestamp = i64;

/// On-disk record width: i64 timestamp, f64 value, u32 crc, no padding
pub const RECORD_SIZE: usize = 20;

/// A single sample with its integrity checksum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Strictly increasing key
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
    /// CRC32 over the timestamp and value bytes in on-disk order
    pub crc: u32,
}

impl Record {
    /// Create a record with its checksum already stamped
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        let mut record = Self {
            timestamp,
            value,
            crc: 0,
        };
        record.crc = record.checksum();
        record
    }

    /// Compute the CRC32 (zlib polynomial, seed 0) of the payload.
    ///
    /// The digest covers exactly the little-endian timestamp bytes followed
    /// by the little-endian value bytes; the `crc` field is excluded.
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.value.to_le_bytes());
        hasher.finalize()
    }

    /// Verify the stored checksum against the payload
    pub fn verify_crc(&self) -> bool {
        self.crc == self.checksum()
    }

    /// Serialize to the fixed little-endian on-disk layout
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_i64_le(self.timestamp);
        cursor.put_f64_le(self.value);
        cursor.put_u32_le(self.crc);
        buf
    }

    /// Deserialize from the on-disk layout; `data` must hold at least
    /// [`RECORD_SIZE`] bytes. The checksum is not verified here.
    pub fn decode(mut data: &[u8]) -> Self {
        let timestamp = data.get_i64_le();
        let value = data.get_f64_le();
        let crc = data.get_u32_le();
        Self {
            timestamp,
            value,
            crc,
        }
    }
}

/// One sparse index entry locating a record by timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Timestamp of the indexed record
    pub timestamp: Timestamp,
    /// Position of the record in the on-disk array
    pub record_index: usize,
}
