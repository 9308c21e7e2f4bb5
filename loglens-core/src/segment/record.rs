//! Segment record framing

use crate::{LogEntry, LogLensError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on a single frame body; anything larger is treated as corruption
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Smallest valid frame body: type + payload length + checksum
pub const MIN_FRAME_LEN: usize = 1 + 4 + 4;

/// Segment record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// One access-log entry
    Entry = 1,
}

impl TryFrom<u8> for RecordType {
    type Error = LogLensError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Entry),
            _ => Err(LogLensError::InvalidFormat(format!(
                "Invalid segment record type: {}",
                value
            ))),
        }
    }
}

/// A single framed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub record_type: RecordType,
    /// bincode-encoded payload
    pub payload: Vec<u8>,
}

impl SegmentRecord {
    /// Create an entry record
    pub fn entry(entry: &LogEntry) -> Result<Self> {
        let payload =
            bincode::serialize(entry).map_err(|e| LogLensError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            record_type: RecordType::Entry,
            payload,
        })
    }

    /// Serialize the record with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: frame length (excluding this field)
    /// - 1 byte: record type
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum of type + payload length + payload
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + MIN_FRAME_LEN + self.payload.len());

        // Length prefix, filled in below
        buf.put_u32_le(0);

        buf.put_u8(self.record_type as u8);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn deserialize_body(body: &[u8]) -> Result<Self> {
        if body.len() < MIN_FRAME_LEN {
            return Err(LogLensError::InvalidFormat("Frame too short".into()));
        }

        let (content, mut tail) = body.split_at(body.len() - 4);
        let expected = tail.get_u32_le();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(LogLensError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = content;
        let record_type = RecordType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(LogLensError::Corruption(format!(
                "payload length {} does not match frame ({} bytes left)",
                payload_len,
                cursor.remaining()
            )));
        }

        Ok(Self {
            record_type,
            payload: cursor.to_vec(),
        })
    }

    /// Decode a whole frame including its length prefix
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(LogLensError::InvalidFormat("Frame too short".into()));
        }
        let mut prefix = &data[..4];
        let len = prefix.get_u32_le() as usize;
        if data.len() < 4 + len {
            return Err(LogLensError::InvalidFormat("Incomplete frame".into()));
        }
        let record = Self::deserialize_body(&data[4..4 + len])?;
        Ok((record, 4 + len))
    }

    /// Decode the log entry carried by this record
    pub fn get_entry(&self) -> Result<LogEntry> {
        if self.record_type != RecordType::Entry {
            return Err(LogLensError::InvalidFormat("Not an entry record".into()));
        }
        bincode::deserialize(&self.payload).map_err(|e| LogLensError::InvalidFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogEntry {
        LogEntry::new("10.0.0.1", "2025-02-25 13:00:15", "/index", 200, "Firefox/98.0")
    }

    #[test]
    fn test_record_serialization() {
        let record = SegmentRecord::entry(&sample()).unwrap();
        let serialized = record.serialize_with_checksum();

        let (decoded, len) = SegmentRecord::deserialize_with_checksum(&serialized).unwrap();
        assert_eq!(len, serialized.len());
        assert_eq!(decoded.record_type, RecordType::Entry);
        assert_eq!(decoded.get_entry().unwrap(), sample());
    }

    #[test]
    fn test_checksum_validation() {
        let record = SegmentRecord::entry(&sample()).unwrap();
        let mut serialized = record.serialize_with_checksum().to_vec();

        // Corrupt the payload
        serialized[12] ^= 0xFF;

        let result = SegmentRecord::deserialize_with_checksum(&serialized);
        assert!(matches!(result, Err(LogLensError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_frame() {
        let record = SegmentRecord::entry(&sample()).unwrap();
        let serialized = record.serialize_with_checksum();
        let result = SegmentRecord::deserialize_with_checksum(&serialized[..serialized.len() - 3]);
        assert!(matches!(result, Err(LogLensError::InvalidFormat(_))));
    }
}
