//! Query engine for LogLens
//!
//! Supports:
//! - COUNT, COUNT DISTINCT and TOP-K, optionally grouped
//! - Filters on status, client, URL (prefix or regex), agent and time range
//! - HAVING thresholds, explicit ordering and LIMIT
//! - Time-bucket grouping on timestamp prefixes

mod aggregates;
mod executor;
mod job;

pub use aggregates::*;
pub use executor::{AggregationExecutor, ExecutorConfig};
pub use job::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Query Result Types
// ============================================================================

/// Aggregation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Diagnostic rendering of the job
    pub job: String,
    /// Result rows, in output order
    pub rows: Vec<ResultRow>,
    pub metadata: ResultMetadata,
}

/// A single `(group key, value)` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: String,
    pub value: u64,
}

/// Execution statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Records read from the scanned partitions
    pub rows_scanned: u64,
    /// Records that passed the filter
    pub rows_matched: u64,
    /// Lines rejected at ingest and therefore never stored
    pub rows_skipped: u64,
    pub partitions_scanned: usize,
    /// Groups before having and limit
    pub groups: usize,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
    pub completed_at: DateTime<Utc>,
}

impl AggregationResult {
    /// Value of a group, if it is in the output
    pub fn get(&self, key: &str) -> Option<u64> {
        self.rows.iter().find(|r| r.key == key).map(|r| r.value)
    }

    pub fn to_pairs(&self) -> Vec<(String, u64)> {
        self.rows
            .iter()
            .map(|r| (r.key.clone(), r.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
