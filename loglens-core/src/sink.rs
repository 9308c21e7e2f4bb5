//! Query result sink

use crate::query::AggregationResult;
use crate::storage::{StorageBackend, PARTITION_DIR_PREFIX, REJECTS_DIR};
use crate::{LogLensError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

/// Serialization of a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum OutputFormat {
    /// One `key<delimiter>value` line per row
    Delimited { delimiter: char },
    /// Rows plus metadata as a JSON document
    Json,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Delimited {
            delimiter: crate::config::DEFAULT_DELIMITER,
        }
    }
}

/// Writes results to the storage backend, overwriting the destination
pub struct ResultSink {
    backend: Arc<dyn StorageBackend>,
    format: OutputFormat,
}

impl ResultSink {
    pub fn new(backend: Arc<dyn StorageBackend>, format: OutputFormat) -> Self {
        Self { backend, format }
    }

    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    /// Serialize a result without writing it
    pub fn render(&self, result: &AggregationResult) -> Result<Vec<u8>> {
        render(result, &self.format)
    }

    /// Persist a result at `destination`; existing contents are replaced
    pub fn write(&self, result: &AggregationResult, destination: &str) -> Result<()> {
        check_destination(destination)?;
        let bytes = self.render(result)?;
        self.backend
            .put(destination, &bytes)
            .map_err(|e| LogLensError::store(destination, e))?;
        info!(destination, rows = result.rows.len(), bytes = bytes.len(), "Wrote result");
        Ok(())
    }
}

/// Refuse destinations inside the store's own partition or quarantine space
pub fn check_destination(destination: &str) -> Result<()> {
    let top = destination.split('/').next().unwrap_or_default();
    if top.starts_with(PARTITION_DIR_PREFIX) || top == REJECTS_DIR {
        return Err(LogLensError::InvalidJobSpec(format!(
            "result destination {:?} is reserved for log storage",
            destination
        )));
    }
    Ok(())
}

/// Serialize a result in the given format
pub fn render(result: &AggregationResult, format: &OutputFormat) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Delimited { delimiter } => {
            let mut out = String::new();
            for row in &result.rows {
                // Infallible for String
                let _ = writeln!(out, "{}{}{}", row.key, delimiter, row.value);
            }
            Ok(out.into_bytes())
        }
        OutputFormat::Json => serde_json::to_vec_pretty(result)
            .map_err(|e| LogLensError::InvalidFormat(format!("result to json: {}", e))),
    }
}
