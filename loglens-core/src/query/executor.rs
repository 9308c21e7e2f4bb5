//! Aggregation executor
//!
//! Executes a job against the partitioned store:
//! - Validation before any scan
//! - Partition pruning from status predicates
//! - One blocking fold per partition, bounded by a semaphore
//! - Deterministic merge, then having / top-k / order / limit

use super::aggregates::{select_top_k, Accumulator, CountAccumulator, DistinctAccumulator, GroupState};
use super::job::{AggregateKind, AggregationJob, CompiledJob, OrderBy, SortKey, ALL_ROWS_KEY};
use super::{AggregationResult, ResultMetadata, ResultRow};
use crate::storage::{Partition, PartitionedStore};
use crate::{LogLensError, PartitionKey, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Partitions folded concurrently
    pub scan_parallelism: usize,
    /// Abandon the query after this long
    pub timeout_ms: Option<u64>,
    /// Fixed timestamp width, bounds `time_bucket` prefixes
    pub timestamp_width: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scan_parallelism: crate::config::SCAN_PARALLELISM,
            timeout_ms: None,
            timestamp_width: Some(crate::config::DEFAULT_TIMESTAMP_WIDTH),
        }
    }
}

/// Partition-parallel aggregation executor
#[derive(Clone)]
pub struct AggregationExecutor {
    store: Arc<PartitionedStore>,
    config: ExecutorConfig,
}

struct PartitionPartial<A> {
    partition: PartitionKey,
    state: GroupState<A>,
}

impl AggregationExecutor {
    pub fn new(store: Arc<PartitionedStore>, config: ExecutorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute over the job's partition list, or every partition
    pub async fn execute(&self, job: &AggregationJob) -> Result<AggregationResult> {
        let partitions = match &job.partitions {
            Some(keys) => keys.iter().copied().collect(),
            None => self.store.list_partitions(),
        };
        self.execute_on(job, partitions).await
    }

    /// Execute over an explicit partition set
    ///
    /// Partitions that do not exist are treated as empty.
    pub async fn execute_on(
        &self,
        job: &AggregationJob,
        partitions: BTreeSet<PartitionKey>,
    ) -> Result<AggregationResult> {
        let compiled = Arc::new(job.compile(self.config.timestamp_width)?);
        match job.aggregate {
            AggregateKind::CountDistinct { .. } => {
                self.run::<DistinctAccumulator>(job, compiled, partitions).await
            }
            AggregateKind::Count | AggregateKind::TopK { .. } => {
                self.run::<CountAccumulator>(job, compiled, partitions).await
            }
        }
    }

    async fn run<A: Accumulator>(
        &self,
        job: &AggregationJob,
        compiled: Arc<CompiledJob>,
        partitions: BTreeSet<PartitionKey>,
    ) -> Result<AggregationResult> {
        let start = Instant::now();
        let requested = partitions.len();
        let targets: Vec<Arc<Partition>> = partitions
            .into_iter()
            .filter(|key| compiled.may_match_partition(*key))
            .filter_map(|key| self.store.partition(key))
            .collect();
        debug!(
            job = %job,
            requested,
            scanning = targets.len(),
            "Planned aggregation"
        );

        let partitions_scanned = targets.len();
        let cancel = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let scan = self.scan_all::<A>(targets, compiled, cancel.clone(), in_flight.clone());

        let partials = match self.config.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), scan).await {
                Ok(partials) => partials?,
                Err(_) => {
                    cancel.store(true, Ordering::SeqCst);
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    let partitions = in_flight.load(Ordering::SeqCst);
                    warn!(elapsed_ms, partitions, "Aggregation timed out");
                    return Err(LogLensError::Timeout {
                        elapsed_ms,
                        partitions,
                    });
                }
            },
            None => scan.await?,
        };

        let merged = merge_partials(partials);
        let rows_scanned = merged.scanned();
        let rows_matched = merged.matched();
        let mut groups = merged.finish();
        if job.group_by.is_none() && groups.is_empty() {
            groups.insert(ALL_ROWS_KEY.to_string(), 0);
        }
        let group_count = groups.len();

        let mut rows: Vec<(String, u64)> = groups
            .into_iter()
            .filter(|(_, value)| job.having.map_or(true, |h| h.matches(*value)))
            .collect();
        if let AggregateKind::TopK { k } = job.aggregate {
            rows = select_top_k(rows, k);
        }
        if let Some(order) = job.order_by {
            sort_rows(&mut rows, order);
        }
        if let Some(limit) = job.limit {
            rows.truncate(limit);
        }

        let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            rows = rows.len(),
            rows_scanned,
            partitions = partitions_scanned,
            execution_time_ms,
            "Aggregation complete"
        );

        Ok(AggregationResult {
            job: job.to_string(),
            rows: rows
                .into_iter()
                .map(|(key, value)| ResultRow { key, value })
                .collect(),
            metadata: ResultMetadata {
                rows_scanned,
                rows_matched,
                rows_skipped: self.store.rejected_count(),
                partitions_scanned,
                groups: group_count,
                execution_time_ms,
                completed_at: chrono::Utc::now(),
            },
        })
    }

    async fn scan_all<A: Accumulator>(
        &self,
        targets: Vec<Arc<Partition>>,
        job: Arc<CompiledJob>,
        cancel: Arc<AtomicBool>,
        in_flight: Arc<AtomicUsize>,
    ) -> Result<Vec<PartitionPartial<A>>> {
        let semaphore = Arc::new(Semaphore::new(self.config.scan_parallelism.max(1)));
        let mut tasks = JoinSet::new();
        let mut partials = Vec::with_capacity(targets.len());

        for partition in targets {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| LogLensError::Internal(format!("scan semaphore closed: {}", e)))?;
            let job = job.clone();
            let cancel = cancel.clone();
            let in_flight = in_flight.clone();
            in_flight.fetch_add(1, Ordering::SeqCst);
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = fold_partition::<A>(&partition, &job, &cancel);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let folded = joined
                .map_err(|e| LogLensError::Internal(format!("scan task failed: {}", e)))
                .and_then(|r| r);
            match folded {
                Ok(partial) => partials.push(partial),
                Err(e) => {
                    cancel.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(partials)
    }
}

fn fold_partition<A: Accumulator>(
    partition: &Partition,
    job: &CompiledJob,
    cancel: &AtomicBool,
) -> Result<PartitionPartial<A>> {
    let key = partition.key();
    let mut state = GroupState::<A>::default();
    for entry in partition.scan() {
        if cancel.load(Ordering::Relaxed) {
            return Err(LogLensError::Internal(format!("scan of {} cancelled", key)));
        }
        let entry = entry?;
        if job.matches(&entry) {
            state.add(&job.group_key(&entry), &job.distinct_value(&entry));
        } else {
            state.skip();
        }
    }
    debug!(partition = %key, scanned = state.scanned(), groups = state.len(), "Folded partition");
    Ok(PartitionPartial {
        partition: key,
        state,
    })
}

/// Merge barrier; partials are combined in partition order
fn merge_partials<A: Accumulator>(mut partials: Vec<PartitionPartial<A>>) -> GroupState<A> {
    partials.sort_by_key(|p| p.partition);
    let mut merged = GroupState::default();
    for partial in partials {
        merged.merge(partial.state);
    }
    merged
}

fn sort_rows(rows: &mut [(String, u64)], order: OrderBy) {
    match (order.by, order.descending) {
        (SortKey::Key, false) => rows.sort_by(|a, b| a.0.cmp(&b.0)),
        (SortKey::Key, true) => rows.sort_by(|a, b| b.0.cmp(&a.0)),
        (SortKey::Value, false) => rows.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))),
        (SortKey::Value, true) => rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))),
    }
}
