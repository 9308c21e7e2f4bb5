//! Partitioned store - partition registry, scans and reject quarantine

use super::partition::{Partition, PartitionScan, PartitionStats};
use super::{StorageBackend, StoreConfig};
use crate::segment::parse_segment_path;
use crate::{FailureReason, LogLensError, ParseFailure, PartitionKey, Result, PARTITION_DIR_PREFIX};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Storage path of the reject quarantine
pub const REJECTS_PATH: &str = "_rejected/rejects.log";

/// Top-level directory of the reject quarantine
pub const REJECTS_DIR: &str = "_rejected";

type PartitionSlot = Arc<OnceCell<Arc<Partition>>>;

/// Durable, append-only, segment-per-partition store
///
/// Owns the partition registry for one ingestion run. Creating a partition is
/// create-if-absent per key: concurrent first writers of the same key wait on
/// that key's slot only, writers of other keys are not blocked.
pub struct PartitionedStore {
    backend: Arc<dyn StorageBackend>,
    config: StoreConfig,
    partitions: DashMap<PartitionKey, PartitionSlot>,
    rejects: Mutex<()>,
    rejected: AtomicU64,
    partitions_created: AtomicU64,
}

impl PartitionedStore {
    /// Open a store, discovering partitions and rejects already persisted
    pub fn open(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Result<Self> {
        let store = Self {
            backend,
            config,
            partitions: DashMap::new(),
            rejects: Mutex::new(()),
            rejected: AtomicU64::new(0),
            partitions_created: AtomicU64::new(0),
        };
        store.load_partitions()?;
        store.load_rejects()?;
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get the partition for `key`, creating it exactly once if absent
    pub fn get_or_create(&self, key: PartitionKey) -> Result<Arc<Partition>> {
        let slot = self.slot(key);
        let partition = slot.get_or_try_init(|| {
            let partition = Partition::create(key, self.backend.clone(), self.config.segment.clone())?;
            self.partitions_created.fetch_add(1, Ordering::SeqCst);
            info!(partition = %key, "Created partition");
            Ok::<_, LogLensError>(Arc::new(partition))
        })?;
        Ok(partition.clone())
    }

    /// Get an existing partition
    pub fn partition(&self, key: PartitionKey) -> Option<Arc<Partition>> {
        self.partitions
            .get(&key)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Every partition created or discovered so far
    pub fn list_partitions(&self) -> BTreeSet<PartitionKey> {
        self.partitions
            .iter()
            .filter(|slot| slot.value().get().is_some())
            .map(|slot| *slot.key())
            .collect()
    }

    /// Fresh lazy scan of a partition from its first record
    pub fn scan(&self, key: PartitionKey) -> Result<PartitionScan> {
        self.partition(key)
            .map(|p| p.scan())
            .ok_or_else(|| LogLensError::PartitionNotFound(key.to_string()))
    }

    /// Number of partitions this process created (not discovered)
    pub fn partitions_created(&self) -> u64 {
        self.partitions_created.load(Ordering::SeqCst)
    }

    /// Count a parse failure, keeping the raw line when retention is on
    pub fn record_reject(&self, failure: &ParseFailure) -> Result<()> {
        if self.config.retain_rejects {
            let line = format!(
                "{}\t{}\t{}\n",
                failure.reason.code(),
                failure.line_no,
                escape_raw(&failure.raw)
            );
            let _guard = self.rejects.lock();
            self.backend
                .create(REJECTS_PATH)
                .and_then(|_| self.backend.append(REJECTS_PATH, line.as_bytes()))
                .map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
        }
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Total parse failures recorded against this store
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Read back the quarantined lines
    pub fn rejects(&self) -> Result<Vec<ParseFailure>> {
        let exists = self
            .backend
            .exists(REJECTS_PATH)
            .map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
        if !exists {
            return Ok(Vec::new());
        }

        let reader = self
            .backend
            .read_sequential(REJECTS_PATH)
            .map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
        let mut failures = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line.map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
            let mut parts = line.splitn(3, '\t');
            let reason = parts.next().and_then(FailureReason::from_code);
            let line_no = parts.next().and_then(|n| n.parse().ok());
            match (reason, line_no, parts.next()) {
                (Some(reason), Some(line_no), Some(raw)) => failures.push(
                    ParseFailure::new(unescape_raw(raw), reason).at_line(line_no),
                ),
                _ => warn!("Skipping unreadable quarantine line: {:?}", line),
            }
        }
        Ok(failures)
    }

    /// Sync every partition's open segment
    pub fn sync(&self) -> Result<()> {
        for key in self.list_partitions() {
            if let Some(partition) = self.partition(key) {
                partition.sync()?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut partitions = Vec::new();
        for key in self.list_partitions() {
            if let Some(partition) = self.partition(key) {
                partitions.push(partition.stats()?);
            }
        }
        Ok(StoreStats {
            partition_count: partitions.len(),
            total_segments: partitions.iter().map(|p| p.segments).sum(),
            total_size_bytes: partitions.iter().map(|p| p.size_bytes).sum(),
            rejected: self.rejected_count(),
            partitions,
        })
    }

    fn slot(&self, key: PartitionKey) -> PartitionSlot {
        if let Some(slot) = self.partitions.get(&key) {
            return slot.value().clone();
        }
        self.partitions.entry(key).or_default().value().clone()
    }

    fn load_partitions(&self) -> Result<()> {
        let paths = self
            .backend
            .list(PARTITION_DIR_PREFIX)
            .map_err(|e| LogLensError::store("*", e))?;

        let mut found: BTreeMap<PartitionKey, Vec<u64>> = BTreeMap::new();
        for path in paths {
            match parse_segment_path(&path) {
                Some((key, id)) => found.entry(key).or_default().push(id),
                None => warn!("Ignoring unexpected file in store: {}", path),
            }
        }

        for (key, segments) in found {
            let partition = Partition::reopen(
                key,
                self.backend.clone(),
                self.config.segment.clone(),
                segments,
            );
            let slot = Arc::new(OnceCell::with_value(Arc::new(partition)));
            self.partitions.insert(key, slot);
            info!(partition = %key, "Loaded partition");
        }
        Ok(())
    }

    fn load_rejects(&self) -> Result<()> {
        let exists = self
            .backend
            .exists(REJECTS_PATH)
            .map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
        if !exists {
            return Ok(());
        }
        let reader = self
            .backend
            .read_sequential(REJECTS_PATH)
            .map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
        let mut count = 0;
        for line in BufReader::new(reader).lines() {
            line.map_err(|e| LogLensError::store(REJECTS_DIR, e))?;
            count += 1;
        }
        self.rejected.store(count, Ordering::Relaxed);
        Ok(())
    }
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub partition_count: usize,
    pub total_segments: usize,
    pub total_size_bytes: u64,
    pub rejected: u64,
    pub partitions: Vec<PartitionStats>,
}

/// Quarantine lines are tab separated and newline terminated
fn escape_raw(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_raw(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentConfig;
    use crate::storage::{LocalFsBackend, MemoryBackend};
    use crate::LogEntry;
    use std::thread;
    use tempfile::TempDir;

    fn memory_store() -> PartitionedStore {
        PartitionedStore::open(Arc::new(MemoryBackend::new()), StoreConfig::default()).unwrap()
    }

    fn entry(status: u16) -> LogEntry {
        LogEntry::new("10.0.0.1", "2025-02-25 13:00:15", "/index", status, "curl/8.0")
    }

    #[test]
    fn test_partitions_created_lazily() {
        let store = memory_store();
        assert!(store.list_partitions().is_empty());

        store.get_or_create(PartitionKey::Status(200)).unwrap();
        store.get_or_create(PartitionKey::Status(200)).unwrap();
        store.get_or_create(PartitionKey::Default).unwrap();

        let keys: Vec<_> = store.list_partitions().into_iter().collect();
        assert_eq!(keys, vec![PartitionKey::Status(200), PartitionKey::Default]);
        assert_eq!(store.partitions_created(), 2);
    }

    #[test]
    fn test_concurrent_first_writers_create_once() {
        let store = Arc::new(memory_store());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    let status = if i % 2 == 0 { 404 } else { 500 };
                    let partition = store.get_or_create(PartitionKey::Status(status)).unwrap();
                    partition.append(&entry(status)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.partitions_created(), 2);
        assert_eq!(store.scan(PartitionKey::Status(404)).unwrap().count(), 8);
        assert_eq!(store.scan(PartitionKey::Status(500)).unwrap().count(), 8);
    }

    #[test]
    fn test_scan_unknown_partition() {
        let store = memory_store();
        assert!(matches!(
            store.scan(PartitionKey::Status(418)),
            Err(LogLensError::PartitionNotFound(_))
        ));
    }

    #[test]
    fn test_failed_creation_can_be_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let store = PartitionedStore::open(backend.clone(), StoreConfig::default()).unwrap();

        backend.set_available(false);
        assert!(matches!(
            store.get_or_create(PartitionKey::Status(200)),
            Err(LogLensError::StoreUnavailable { .. })
        ));
        assert!(store.list_partitions().is_empty());

        backend.set_available(true);
        store.get_or_create(PartitionKey::Status(200)).unwrap();
        assert_eq!(store.list_partitions().len(), 1);
    }

    #[test]
    fn test_reopen_discovers_partitions_and_rejects() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            segment: SegmentConfig {
                max_records: 2,
                ..Default::default()
            },
            ..Default::default()
        };

        {
            let backend = Arc::new(LocalFsBackend::new(temp_dir.path()).unwrap());
            let store = PartitionedStore::open(backend, config.clone()).unwrap();
            for status in [200, 200, 200, 404] {
                store
                    .get_or_create(PartitionKey::Status(status))
                    .unwrap()
                    .append(&entry(status))
                    .unwrap();
            }
            store
                .record_reject(&ParseFailure::new("a,b", FailureReason::MissingField).at_line(7))
                .unwrap();
            store.sync().unwrap();
        }

        let backend = Arc::new(LocalFsBackend::new(temp_dir.path()).unwrap());
        let store = PartitionedStore::open(backend, config).unwrap();
        let keys: Vec<_> = store.list_partitions().into_iter().collect();
        assert_eq!(keys, vec![PartitionKey::Status(200), PartitionKey::Status(404)]);
        assert_eq!(store.scan(PartitionKey::Status(200)).unwrap().count(), 3);
        assert_eq!(store.partitions_created(), 0);
        assert_eq!(store.rejected_count(), 1);

        let rejects = store.rejects().unwrap();
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].raw, "a,b");
        assert_eq!(rejects[0].reason, FailureReason::MissingField);
        assert_eq!(rejects[0].line_no, 7);
    }

    #[test]
    fn test_quarantine_keeps_raw_line_verbatim() {
        let store = memory_store();
        let raws = [
            "C:\\logs\\new,\\n literal",
            "tab\there\rand\nnewline",
            "trailing backslash\\",
            "\\\\t",
        ];
        for (i, raw) in raws.iter().enumerate() {
            store
                .record_reject(&ParseFailure::new(*raw, FailureReason::MissingField).at_line(i as u64 + 1))
                .unwrap();
        }

        let rejects = store.rejects().unwrap();
        let read_back: Vec<&str> = rejects.iter().map(|f| f.raw.as_str()).collect();
        assert_eq!(read_back, raws);
        assert_eq!(rejects[3].line_no, 4);
    }

    #[test]
    fn test_rejects_counted_without_retention() {
        let backend = Arc::new(MemoryBackend::new());
        let store = PartitionedStore::open(
            backend.clone(),
            StoreConfig {
                retain_rejects: false,
                ..Default::default()
            },
        )
        .unwrap();
        store
            .record_reject(&ParseFailure::new("", FailureReason::MalformedDelimiters))
            .unwrap();
        assert_eq!(store.rejected_count(), 1);
        assert!(backend.contents(REJECTS_PATH).is_none());
    }

    #[test]
    fn test_stats() {
        let store = memory_store();
        let partition = store.get_or_create(PartitionKey::Status(200)).unwrap();
        partition.append(&entry(200)).unwrap();
        partition.append(&entry(200)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.partition_count, 1);
        assert_eq!(stats.total_segments, 1);
        assert_eq!(stats.partitions[0].records_appended, 2);
        assert!(stats.total_size_bytes > 0);
    }
}
