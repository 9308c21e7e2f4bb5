//! LogLens Core - Access-Log Ingestion and Partitioning Engine
//!
//! Turns raw delimited access-log lines into durable, status-code
//! partitioned storage and answers grouped aggregations over it:
//! - Parallel ingest with per-partition append order
//! - Malformed lines quarantined with a reason, never fatal
//! - Partition-parallel aggregation with a deterministic merge
//!
//! # Architecture
//!
//! - **Parser**: raw line to [`LogEntry`] or a classified [`ParseFailure`]
//! - **Segments**: CRC-checked append-only frames, rotated by size or count
//! - **Store**: partition registry, scans and the reject quarantine
//! - **Ingest**: router and writer pool over the store
//! - **Query**: job specs, accumulators and the aggregation executor
//! - **Sink**: persists results as delimited text or JSON

pub mod analytics;
pub mod engine;
pub mod ingest;
pub mod parser;
pub mod query;
pub mod segment;
pub mod sink;
pub mod storage;

mod error;
mod types;

pub use error::{LogLensError, Result};
pub use types::*;

/// LogLens version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Field delimiter of raw lines
    pub const DEFAULT_DELIMITER: char = ',';

    /// Width of a `YYYY-MM-DD HH:MM:SS` timestamp
    pub const DEFAULT_TIMESTAMP_WIDTH: usize = 19;

    /// Segment size before rotation (64MB)
    pub const SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

    /// Records per segment before rotation
    pub const SEGMENT_MAX_RECORDS: u64 = 1_000_000;

    /// Writer threads used by ingest
    pub const INGEST_WORKERS: usize = 4;

    /// Queue length per ingest writer
    pub const INGEST_CHANNEL_CAPACITY: usize = 1024;

    /// Partitions scanned concurrently by one query
    pub const SCAN_PARALLELISM: usize = 8;

    /// Parse failures kept verbatim in an ingest report
    pub const REJECT_SAMPLE_LIMIT: usize = 16;
}
