//! Segment writer with size and record-count rotation

use super::{segment_path, SegmentConfig, SegmentRecord, SyncPolicy};
use crate::storage::StorageBackend;
use crate::{LogEntry, LogLensError, PartitionKey, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Where an append landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub segment_id: u64,
    /// 0-based position of the record within its segment
    pub record_index: u64,
    /// Encoded frame size
    pub bytes: u64,
    /// True for the first record of a segment
    pub new_segment: bool,
}

/// Writer for the open segment of one partition
///
/// Not internally synchronized: the owning partition serializes access.
pub struct SegmentWriter {
    backend: Arc<dyn StorageBackend>,
    partition: PartitionKey,
    config: SegmentConfig,
    next_segment_id: u64,
    current: Option<OpenSegment>,
}

struct OpenSegment {
    id: u64,
    path: String,
    bytes_written: u64,
    records_written: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl SegmentWriter {
    /// Create a writer whose first segment will be `next_segment_id`
    ///
    /// The segment file itself is created lazily on first append, or eagerly
    /// through [`SegmentWriter::open_segment`].
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        partition: PartitionKey,
        config: SegmentConfig,
        next_segment_id: u64,
    ) -> Self {
        Self {
            backend,
            partition,
            config,
            next_segment_id,
            current: None,
        }
    }

    /// Append an entry, rotating first if the open segment is full
    pub fn append(&mut self, entry: &LogEntry) -> Result<Appended> {
        let frame = SegmentRecord::entry(entry)?.serialize_with_checksum();
        let frame_len = frame.len() as u64;

        let needs_rotation = match &self.current {
            Some(open) => self.is_full(open, frame_len),
            None => true,
        };
        if needs_rotation {
            self.rotate()?;
        }

        let backend = self.backend.clone();
        let partition = self.partition;
        let sync_policy = self.config.sync_policy;
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| LogLensError::Internal("no open segment after rotation".into()))?;

        backend
            .append(&open.path, &frame)
            .map_err(|e| LogLensError::store(partition, e))?;

        let record_index = open.records_written;
        open.bytes_written += frame_len;
        open.records_written += 1;
        open.writes_since_sync += 1;

        if should_sync(sync_policy, open) {
            backend
                .sync(&open.path)
                .map_err(|e| LogLensError::store(partition, e))?;
            open.writes_since_sync = 0;
            open.last_sync = Instant::now();
        }

        Ok(Appended {
            segment_id: open.id,
            record_index,
            bytes: frame_len,
            new_segment: record_index == 0,
        })
    }

    /// Create the next segment file and make it the open segment
    pub fn open_segment(&mut self) -> Result<u64> {
        let id = self.next_segment_id;
        let path = segment_path(self.partition, id);
        self.backend
            .create(&path)
            .map_err(|e| LogLensError::store(self.partition, e))?;

        self.next_segment_id += 1;
        self.current = Some(OpenSegment {
            id,
            path,
            bytes_written: 0,
            records_written: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        });
        debug!(partition = %self.partition, segment = id, "Opened segment");
        Ok(id)
    }

    /// Force sync of the open segment
    pub fn sync(&mut self) -> Result<()> {
        if let Some(open) = self.current.as_mut() {
            if open.writes_since_sync > 0 {
                self.backend
                    .sync(&open.path)
                    .map_err(|e| LogLensError::store(self.partition, e))?;
                open.writes_since_sync = 0;
                open.last_sync = Instant::now();
            }
        }
        Ok(())
    }

    /// Id of the open segment, if any
    pub fn current_segment(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.id)
    }

    fn is_full(&self, open: &OpenSegment, incoming: u64) -> bool {
        if open.records_written == 0 {
            // An oversized single record still gets a segment of its own
            return false;
        }
        open.records_written >= self.config.max_records
            || open.bytes_written + incoming > self.config.max_bytes
    }

    fn rotate(&mut self) -> Result<()> {
        let previous = self
            .current
            .as_ref()
            .map(|s| (s.id, s.path.clone(), s.records_written));
        self.sync()?;
        let id = self.open_segment()?;
        if let Some((old, path, records)) = previous {
            // Sealed segments are never appended to again
            self.backend
                .close(&path)
                .map_err(|e| LogLensError::store(self.partition, e))?;
            info!(
                partition = %self.partition,
                from = old,
                to = id,
                records,
                "Rotated segment"
            );
        }
        Ok(())
    }
}

fn should_sync(policy: SyncPolicy, open: &OpenSegment) -> bool {
    match policy {
        SyncPolicy::Immediate => true,
        SyncPolicy::EveryN(n) => open.writes_since_sync >= n,
        SyncPolicy::Interval { millis } => open.last_sync.elapsed().as_millis() >= millis as u128,
        SyncPolicy::None => false,
    }
}
