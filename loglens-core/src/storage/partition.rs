//! A single status-code partition

use crate::segment::{segment_path, SegmentConfig, SegmentReader, SegmentWriter};
use crate::storage::StorageBackend;
use crate::{LogEntry, LogLensError, PartitionKey, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Location of an appended entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionRef {
    pub partition: PartitionKey,
    pub segment_id: u64,
    pub record_index: u64,
}

/// Per-partition statistics
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub partition: PartitionKey,
    pub segments: usize,
    /// Records appended since this process opened the store
    pub records_appended: u64,
    pub size_bytes: u64,
}

/// Partition owning an ordered list of segments
///
/// Writes go through a single writer lock; scans only take a snapshot of the
/// segment list and never block writers.
pub struct Partition {
    key: PartitionKey,
    backend: Arc<dyn StorageBackend>,
    segments: RwLock<Vec<u64>>,
    writer: Mutex<SegmentWriter>,
    records_appended: AtomicU64,
}

impl Partition {
    /// Create a brand-new partition with an empty first segment
    pub fn create(
        key: PartitionKey,
        backend: Arc<dyn StorageBackend>,
        config: SegmentConfig,
    ) -> Result<Self> {
        let mut writer = SegmentWriter::new(backend.clone(), key, config, 0);
        let first = writer.open_segment()?;
        Ok(Self {
            key,
            backend,
            segments: RwLock::new(vec![first]),
            writer: Mutex::new(writer),
            records_appended: AtomicU64::new(0),
        })
    }

    /// Re-open a partition found in storage
    ///
    /// New appends go to a fresh segment after the highest existing one, so a
    /// torn tail left by an earlier process is never appended to.
    pub fn reopen(
        key: PartitionKey,
        backend: Arc<dyn StorageBackend>,
        config: SegmentConfig,
        mut segments: Vec<u64>,
    ) -> Self {
        segments.sort_unstable();
        segments.dedup();
        let next = segments.last().map(|id| id + 1).unwrap_or(0);
        let writer = SegmentWriter::new(backend.clone(), key, config, next);
        Self {
            key,
            backend,
            segments: RwLock::new(segments),
            writer: Mutex::new(writer),
            records_appended: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    /// Append an entry to the open segment
    pub fn append(&self, entry: &LogEntry) -> Result<PartitionRef> {
        if entry.partition_key() != self.key {
            return Err(LogLensError::Internal(format!(
                "entry with status {} routed to partition {}",
                entry.status_code, self.key
            )));
        }

        let mut writer = self.writer.lock();
        let appended = writer.append(entry)?;
        if appended.new_segment {
            let mut segments = self.segments.write();
            if segments.last() != Some(&appended.segment_id) {
                segments.push(appended.segment_id);
            }
        }
        self.records_appended.fetch_add(1, Ordering::Relaxed);

        Ok(PartitionRef {
            partition: self.key,
            segment_id: appended.segment_id,
            record_index: appended.record_index,
        })
    }

    /// Lazy scan over every segment, in append order
    pub fn scan(&self) -> PartitionScan {
        let segments = self.segments.read().clone();
        PartitionScan {
            backend: self.backend.clone(),
            partition: self.key,
            pending: segments.into(),
            current: None,
            failed: false,
        }
    }

    /// Ids of the segments currently in this partition
    pub fn segments(&self) -> Vec<u64> {
        self.segments.read().clone()
    }

    /// Sync the open segment
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().sync()
    }

    pub fn stats(&self) -> Result<PartitionStats> {
        let segments = self.segments();
        let mut size_bytes = 0;
        for id in &segments {
            size_bytes += self
                .backend
                .size(&segment_path(self.key, *id))
                .map_err(|e| LogLensError::store(self.key, e))?;
        }
        Ok(PartitionStats {
            partition: self.key,
            segments: segments.len(),
            records_appended: self.records_appended.load(Ordering::Relaxed),
            size_bytes,
        })
    }
}

/// Restartable, lazy sequence of a partition's entries
///
/// The segment list is fixed when the scan starts; records appended to those
/// segments while the scan runs may or may not be observed.
pub struct PartitionScan {
    backend: Arc<dyn StorageBackend>,
    partition: PartitionKey,
    pending: VecDeque<u64>,
    current: Option<SegmentReader>,
    failed: bool,
}

impl PartitionScan {
    pub fn partition(&self) -> PartitionKey {
        self.partition
    }
}

impl Iterator for PartitionScan {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next() {
                    Some(Ok(entry)) => return Some(Ok(entry)),
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }

            let id = self.pending.pop_front()?;
            let path = segment_path(self.partition, id);
            match SegmentReader::open(self.backend.as_ref(), self.partition, &path) {
                Ok(reader) => self.current = Some(reader),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
