//! Partitioned storage - backends, partitions and the partition registry

mod backend;
mod partition;
mod store;

pub use backend::{LocalFsBackend, MemoryBackend, StorageBackend};
pub use partition::{Partition, PartitionRef, PartitionScan, PartitionStats};
pub use store::{PartitionedStore, StoreStats, REJECTS_DIR, REJECTS_PATH};
pub use crate::PARTITION_DIR_PREFIX;

use crate::segment::SegmentConfig;
use serde::{Deserialize, Serialize};

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Segment rotation and sync settings
    pub segment: SegmentConfig,
    /// Keep rejected raw lines in the quarantine file
    pub retain_rejects: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment: SegmentConfig::default(),
            retain_rejects: true,
        }
    }
}
