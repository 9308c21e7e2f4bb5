//! Ingestion - partition routing and the parallel write pipeline
//!
//! Parsing runs on the caller's thread. Accepted entries are routed to a
//! fixed pool of writer threads by partition key, so every partition has a
//! single writer for the whole run and rotation never races.

use crate::parser::RecordParser;
use crate::storage::{PartitionRef, PartitionedStore};
use crate::{FailureReason, LogEntry, LogLensError, ParseFailure, PartitionKey, Result};
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, info_span};
use uuid::Uuid;

/// Ingest configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Writer threads; each owns a disjoint set of partitions
    pub workers: usize,
    /// Bounded queue length per writer thread
    pub channel_capacity: usize,
    /// Failures kept verbatim in the report
    pub sample_failures: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: crate::config::INGEST_WORKERS,
            channel_capacity: crate::config::INGEST_CHANNEL_CAPACITY,
            sample_failures: crate::config::REJECT_SAMPLE_LIMIT,
        }
    }
}

/// Routes entries to their status-code partition
#[derive(Clone)]
pub struct PartitionWriter {
    store: Arc<PartitionedStore>,
}

impl PartitionWriter {
    pub fn new(store: Arc<PartitionedStore>) -> Self {
        Self { store }
    }

    /// Append an entry to the partition named by its status code
    pub fn write(&self, entry: &LogEntry) -> Result<PartitionRef> {
        let partition = self.store.get_or_create(entry.partition_key())?;
        partition.append(entry)
    }
}

/// Outcome of one ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub accepted: u64,
    pub rejected: u64,
    pub reject_reasons: BTreeMap<FailureReason, u64>,
    pub partitions_touched: BTreeSet<PartitionKey>,
    /// First few failures, for inspection
    pub samples: Vec<ParseFailure>,
    pub elapsed_ms: f64,
}

impl IngestReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            accepted: 0,
            rejected: 0,
            reject_reasons: BTreeMap::new(),
            partitions_touched: BTreeSet::new(),
            samples: Vec::new(),
            elapsed_ms: 0.0,
        }
    }

    /// Lines read, accepted or not
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected
    }

    /// Rejections for a single reason
    pub fn rejected_for(&self, reason: FailureReason) -> u64 {
        self.reject_reasons.get(&reason).copied().unwrap_or(0)
    }

    fn record_failure(&mut self, failure: ParseFailure, sample_limit: usize) {
        self.rejected += 1;
        *self.reject_reasons.entry(failure.reason).or_insert(0) += 1;
        if self.samples.len() < sample_limit {
            self.samples.push(failure);
        }
    }
}

#[derive(Default)]
struct WorkerTally {
    accepted: u64,
    partitions: BTreeSet<PartitionKey>,
}

/// Parallel ingest over a partitioned store
pub struct IngestPipeline {
    store: Arc<PartitionedStore>,
    parser: RecordParser,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(store: Arc<PartitionedStore>, parser: RecordParser, config: IngestConfig) -> Self {
        Self {
            store,
            parser,
            config,
        }
    }

    /// Ingest a stream of raw lines
    ///
    /// Malformed lines never abort the run. The first storage failure does,
    /// and is returned as is.
    pub fn run<I, S>(&self, lines: I) -> Result<IngestReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id);
        let _enter = span.enter();

        let workers = self.config.workers.max(1);
        let writer = PartitionWriter::new(self.store.clone());
        let failed = AtomicBool::new(false);
        let mut report = IngestReport::new(run_id);

        let outcome = thread::scope(|scope| -> Result<Vec<WorkerTally>> {
            let mut senders = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);

            for worker in 0..workers {
                let (tx, rx) = bounded::<LogEntry>(self.config.channel_capacity.max(1));
                senders.push(tx);
                let writer = &writer;
                let failed = &failed;
                let span = span.clone();
                handles.push(scope.spawn(move || -> Result<WorkerTally> {
                    let _enter = span.enter();
                    let mut tally = WorkerTally::default();
                    for entry in rx {
                        match writer.write(&entry) {
                            Ok(location) => {
                                tally.accepted += 1;
                                tally.partitions.insert(location.partition);
                            }
                            Err(e) => {
                                failed.store(true, Ordering::SeqCst);
                                debug!(worker, error = %e, "Writer stopped");
                                return Err(e);
                            }
                        }
                    }
                    Ok(tally)
                }));
            }

            for (idx, line) in lines.into_iter().enumerate() {
                if failed.load(Ordering::SeqCst) {
                    break;
                }
                match self.parser.parse(line.as_ref()) {
                    Ok(entry) => {
                        let target = worker_for(entry.partition_key(), workers);
                        if senders[target].send(entry).is_err() {
                            // Receiver gone: that worker already failed
                            break;
                        }
                    }
                    Err(failure) => {
                        let failure = failure.at_line(idx as u64 + 1);
                        debug!(line = failure.line_no, reason = %failure.reason, "Rejected line");
                        self.store.record_reject(&failure)?;
                        report.record_failure(failure, self.config.sample_failures);
                    }
                }
            }
            drop(senders);

            let mut tallies = Vec::with_capacity(workers);
            let mut first_error = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(tally)) => tallies.push(tally),
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(_) => {
                        first_error
                            .get_or_insert(LogLensError::Internal("ingest worker panicked".into()));
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(tallies),
            }
        })?;

        for tally in outcome {
            report.accepted += tally.accepted;
            report.partitions_touched.extend(tally.partitions);
        }
        self.store.sync()?;

        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            partitions = report.partitions_touched.len(),
            elapsed_ms = report.elapsed_ms,
            "Ingest complete"
        );
        Ok(report)
    }

    /// Ingest every line of a reader; invalid UTF-8 is replaced, not fatal
    pub fn run_reader<R: BufRead>(&self, reader: R) -> Result<IngestReport> {
        let mut lines = LossyLines::new(reader);
        let report = self.run(&mut lines)?;
        match lines.error.take() {
            Some(e) => Err(LogLensError::Io(e)),
            None => Ok(report),
        }
    }
}

/// Partitions map to workers by key hash, so one partition never has two writers
fn worker_for(key: PartitionKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Line iterator that stops at the first read error and keeps it
struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
    error: Option<std::io::Error>,
}

impl<R: BufRead> LossyLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            error: None,
        }
    }
}

impl<R: BufRead> Iterator for LossyLines<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.error.is_some() {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => Some(String::from_utf8_lossy(&self.buf).into_owned()),
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}
