//! Append-only partition segments
//!
//! Each partition stores its entries in a sequence of segment files. A
//! segment only ever grows by whole framed records and is rotated once it
//! reaches the configured byte or record limit.

mod reader;
mod record;
mod writer;

pub use reader::SegmentReader;
pub use record::{RecordType, SegmentRecord};
pub use writer::{Appended, SegmentWriter};

use crate::PartitionKey;
use serde::{Deserialize, Serialize};

/// Segment sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every append (safest, slowest)
    Immediate,
    /// Sync after N appends
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Only sync on rotation and explicit flush
    #[default]
    None,
}

/// Segment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Rotate before a segment would exceed this many bytes
    pub max_bytes: u64,
    /// Rotate once a segment holds this many records
    pub max_records: u64,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_bytes: crate::config::SEGMENT_SIZE,
            max_records: crate::config::SEGMENT_MAX_RECORDS,
            sync_policy: SyncPolicy::default(),
        }
    }
}

/// Storage path of a segment
pub fn segment_path(partition: PartitionKey, segment_id: u64) -> String {
    format!("{}/seg_{:020}.log", partition.dir_name(), segment_id)
}

/// Split a storage path into its partition and segment id
pub fn parse_segment_path(path: &str) -> Option<(PartitionKey, u64)> {
    let (dir, file) = path.split_once('/')?;
    let partition = PartitionKey::from_dir_name(dir)?;
    let id = file
        .strip_prefix("seg_")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())?;
    Some((partition, id))
}
