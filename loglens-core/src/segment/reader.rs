//! Streaming segment reader

use super::record::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use super::SegmentRecord;
use crate::storage::StorageBackend;
use crate::{LogEntry, LogLensError, PartitionKey, Result};
use std::io::{self, ErrorKind, Read};
use tracing::debug;

/// Reads one segment front to back, one frame at a time
///
/// A trailing incomplete frame is an append still in flight (or a crash
/// mid-write) and ends the segment quietly. A checksum failure is an error.
pub struct SegmentReader {
    reader: Box<dyn Read + Send>,
    partition: PartitionKey,
    path: String,
    offset: u64,
    done: bool,
}

impl SegmentReader {
    /// Open a segment for reading
    pub fn open(backend: &dyn StorageBackend, partition: PartitionKey, path: &str) -> Result<Self> {
        let reader = backend
            .read_sequential(path)
            .map_err(|e| LogLensError::store(partition, e))?;
        Ok(Self {
            reader,
            partition,
            path: path.to_string(),
            offset: 0,
            done: false,
        })
    }

    /// Byte offset of the next frame
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next record, `None` at end of segment
    pub fn next_record(&mut self) -> Result<Option<SegmentRecord>> {
        if self.done {
            return Ok(None);
        }

        let mut prefix = [0u8; 4];
        let read = self.read_full(&mut prefix)?;
        if read < prefix.len() {
            if read > 0 {
                debug!(path = %self.path, offset = self.offset, "Torn length prefix at segment tail");
            }
            self.done = true;
            return Ok(None);
        }

        let len = u32::from_le_bytes(prefix) as usize;
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
            self.done = true;
            return Err(LogLensError::Corruption(format!(
                "frame length {} at offset {} in {}",
                len, self.offset, self.path
            )));
        }

        let mut body = vec![0u8; len];
        let read = self.read_full(&mut body)?;
        if read < len {
            debug!(path = %self.path, offset = self.offset, "Torn frame at segment tail");
            self.done = true;
            return Ok(None);
        }

        let record = SegmentRecord::deserialize_body(&body).map_err(|e| {
            self.done = true;
            match e {
                LogLensError::ChecksumMismatch { expected, actual } => LogLensError::Corruption(format!(
                    "checksum mismatch at offset {} in {} (expected {}, got {})",
                    self.offset, self.path, expected, actual
                )),
                other => other,
            }
        })?;
        self.offset += 4 + len as u64;
        Ok(Some(record))
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error(self.partition, &self.path, e)),
            }
        }
        Ok(filled)
    }
}

fn read_error(partition: PartitionKey, path: &str, e: io::Error) -> LogLensError {
    LogLensError::store(partition, io::Error::new(e.kind(), format!("{}: {}", path, e)))
}

impl Iterator for SegmentReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(record.get_entry()),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment_path, SegmentConfig, SegmentWriter};
    use crate::storage::MemoryBackend;
    use std::sync::Arc;

    const PARTITION: PartitionKey = PartitionKey::Status(200);

    fn write_entries(backend: &Arc<MemoryBackend>, n: usize) -> String {
        let mut writer = SegmentWriter::new(backend.clone(), PARTITION, SegmentConfig::default(), 0);
        for i in 0..n {
            let entry = LogEntry::new(
                format!("10.0.0.{}", i),
                "2025-02-25 13:00:15",
                format!("/page/{}", i),
                200,
                "Firefox/98.0",
            );
            writer.append(&entry).unwrap();
        }
        segment_path(PARTITION, 0)
    }

    #[test]
    fn test_read_in_append_order() {
        let backend = Arc::new(MemoryBackend::new());
        let path = write_entries(&backend, 10);

        let reader = SegmentReader::open(backend.as_ref(), PARTITION, &path).unwrap();
        let urls: Vec<String> = reader.map(|e| e.unwrap().url).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("/page/{}", i)).collect();
        assert_eq!(urls, expected);
    }

    #[test]
    fn test_torn_tail_ends_segment() {
        let backend = Arc::new(MemoryBackend::new());
        let path = write_entries(&backend, 3);

        // Half a frame, as if the writer died mid-append
        let frame = SegmentRecord::entry(&LogEntry::new("1.1.1.1", "t", "/x", 200, "ua"))
            .unwrap()
            .serialize_with_checksum();
        backend.append(&path, &frame[..frame.len() / 2]).unwrap();

        let reader = SegmentReader::open(backend.as_ref(), PARTITION, &path).unwrap();
        let entries: Vec<_> = reader.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_corruption_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        let path = write_entries(&backend, 2);

        let mut data = backend.contents(&path).unwrap();
        let last = data.len() - 6;
        data[last] ^= 0xFF;
        backend.put(&path, &data).unwrap();

        let mut reader = SegmentReader::open(backend.as_ref(), PARTITION, &path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.is_corruption());
        assert!(reader.next().is_none());
    }
}
