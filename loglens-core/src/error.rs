//! Error types for LogLens

use thiserror::Error;

/// Result type alias for LogLens operations
pub type Result<T> = std::result::Result<T, LogLensError>;

/// LogLens error types
///
/// Parse failures are not errors: they are expected-path outcomes counted in
/// the [`IngestReport`](crate::ingest::IngestReport).
#[derive(Error, Debug)]
pub enum LogLensError {
    /// IO operation failed outside of a partition write
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The durable store rejected a read or write
    #[error("Store unavailable (partition {partition}): {source}")]
    StoreUnavailable {
        partition: String,
        #[source]
        source: std::io::Error,
    },

    /// Aggregation job failed validation; nothing was scanned
    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    /// Partition has never been written
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    /// Query did not finish within the configured timeout
    #[error("Query timed out after {elapsed_ms}ms ({partitions} partitions in flight)")]
    Timeout { elapsed_ms: u64, partitions: usize },

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LogLensError {
    /// Wrap an IO error with the partition it happened on
    pub fn store(partition: impl ToString, source: std::io::Error) -> Self {
        LogLensError::StoreUnavailable {
            partition: partition.to_string(),
            source,
        }
    }

    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LogLensError::Io(_) | LogLensError::StoreUnavailable { .. } | LogLensError::Timeout { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LogLensError::Corruption(_) | LogLensError::ChecksumMismatch { .. }
        )
    }
}
