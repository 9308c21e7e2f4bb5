//! LogLens engine - ingest, query and persist over one partitioned store

use crate::ingest::{IngestConfig, IngestPipeline, IngestReport};
use crate::parser::{ParserConfig, RecordParser};
use crate::query::{AggregationExecutor, AggregationJob, AggregationResult, ExecutorConfig};
use crate::sink::{self, OutputFormat, ResultSink};
use crate::storage::{LocalFsBackend, PartitionScan, PartitionedStore, StorageBackend, StoreConfig, StoreStats};
use crate::{LogLensError, PartitionKey, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory of the local store
    pub data_dir: PathBuf,
    pub parser: ParserConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub query: ExecutorConfig,
    pub output: OutputFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            parser: ParserConfig::default(),
            store: StoreConfig::default(),
            ingest: IngestConfig::default(),
            query: ExecutorConfig::default(),
            output: OutputFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| LogLensError::Config(e.to_string()))
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LogLensError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }
}

/// Ingestion and aggregation engine
pub struct LogEngine {
    config: EngineConfig,
    store: Arc<PartitionedStore>,
    pipeline: IngestPipeline,
    executor: AggregationExecutor,
    sink: ResultSink,
}

impl LogEngine {
    /// Open an engine over the local directory `config.data_dir`
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let backend = Arc::new(LocalFsBackend::new(&config.data_dir)?);
        Self::with_backend(config, backend)
    }

    /// Open an engine over any storage backend
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let store = Arc::new(PartitionedStore::open(backend.clone(), config.store.clone())?);

        let mut query = config.query.clone();
        // Buckets are bounded by whatever width the parser enforces
        query.timestamp_width = config.parser.timestamp_width;

        let pipeline = IngestPipeline::new(
            store.clone(),
            RecordParser::new(config.parser.clone()),
            config.ingest.clone(),
        );
        let executor = AggregationExecutor::new(store.clone(), query);
        let sink = ResultSink::new(backend, config.output.clone());

        info!(
            partitions = store.list_partitions().len(),
            rejected = store.rejected_count(),
            "LogLens engine opened"
        );
        Ok(Self {
            config,
            store,
            pipeline,
            executor,
            sink,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PartitionedStore> {
        &self.store
    }

    /// Ingest raw lines
    pub fn ingest<I, S>(&self, lines: I) -> Result<IngestReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.pipeline.run(lines)
    }

    /// Ingest every line of a reader
    pub fn ingest_reader<R: BufRead>(&self, reader: R) -> Result<IngestReport> {
        self.pipeline.run_reader(reader)
    }

    /// Run a job over all partitions, or the job's own partition list
    pub async fn query(&self, job: &AggregationJob) -> Result<AggregationResult> {
        self.executor.execute(job).await
    }

    /// Run a job over an explicit partition set
    pub async fn query_partitions(
        &self,
        job: &AggregationJob,
        partitions: impl IntoIterator<Item = PartitionKey>,
    ) -> Result<AggregationResult> {
        self.executor
            .execute_on(job, partitions.into_iter().collect())
            .await
    }

    /// Run a job and persist its result at `destination`
    pub async fn query_into(&self, job: &AggregationJob, destination: &str) -> Result<AggregationResult> {
        sink::check_destination(destination)?;
        let result = self.query(job).await?;
        self.sink.write(&result, destination)?;
        Ok(result)
    }

    /// Persist an existing result
    pub fn write_result(&self, result: &AggregationResult, destination: &str) -> Result<()> {
        self.sink.write(result, destination)
    }

    pub fn list_partitions(&self) -> BTreeSet<PartitionKey> {
        self.store.list_partitions()
    }

    /// Fresh scan of one partition
    pub fn scan(&self, partition: PartitionKey) -> Result<PartitionScan> {
        self.store.scan(partition)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}
