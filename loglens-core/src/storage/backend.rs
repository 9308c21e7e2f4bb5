//! Durable storage substrate
//!
//! Paths are relative, `/`-separated keys such as
//! `status_code=200/seg_00000000000000000000.log`. Both backends refuse
//! absolute paths and `..` components.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Cursor, ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Storage operations the engine needs from a durable store
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Create an empty file if it does not exist yet; never truncates
    fn create(&self, path: &str) -> io::Result<()>;

    /// Append bytes to an existing file with a single write
    fn append(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Replace the file contents, creating it if needed
    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// All file paths starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Open a file for a front-to-back read
    fn read_sequential(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Make appended bytes durable
    fn sync(&self, path: &str) -> io::Result<()>;

    /// Current file size in bytes
    fn size(&self, path: &str) -> io::Result<u64>;

    fn exists(&self, path: &str) -> io::Result<bool>;

    /// Release any cached handle for a file that will not be appended to again
    fn close(&self, _path: &str) -> io::Result<()> {
        Ok(())
    }
}

fn validate_path(path: &str) -> io::Result<()> {
    let invalid = path.is_empty()
        || Path::new(path).components().any(|c| !matches!(c, Component::Normal(_)));
    if invalid {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid storage path: {:?}", path),
        ));
    }
    Ok(())
}

/// Local filesystem backend rooted at a directory
pub struct LocalFsBackend {
    root: PathBuf,
    handles: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl LocalFsBackend {
    /// Create a backend rooted at `root`, creating the directory
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of append handles currently cached
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn handle(&self, path: &str) -> io::Result<Arc<Mutex<File>>> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(path) {
            return Ok(handle.clone());
        }
        let file = OpenOptions::new().append(true).open(self.resolve(path)?)?;
        let handle = Arc::new(Mutex::new(file));
        handles.insert(path.to_string(), handle.clone());
        Ok(handle)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                out.push(key.join("/"));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for LocalFsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFsBackend")
            .field("root", &self.root)
            .finish()
    }
}

impl StorageBackend for LocalFsBackend {
    fn create(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&full)?;
        self.handles
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(file)));
        Ok(())
    }

    fn append(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let handle = self.handle(path)?;
        let mut file = handle.lock();
        file.write_all(bytes)
    }

    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never see a half-replaced file
        let tmp = full.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &full)?;
        self.handles.lock().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        if self.root.exists() {
            self.walk(&self.root, &mut out)?;
        }
        out.retain(|p| p.starts_with(prefix) && !p.ends_with(".tmp"));
        out.sort();
        Ok(out)
    }

    fn read_sequential(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(self.resolve(path)?)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn sync(&self, path: &str) -> io::Result<()> {
        let cached = self.handles.lock().get(path).cloned();
        match cached {
            Some(handle) => handle.lock().sync_data(),
            None => File::open(self.resolve(path)?)?.sync_all(),
        }
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(path)?)?.len())
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn close(&self, path: &str) -> io::Result<()> {
        self.handles.lock().remove(path);
        Ok(())
    }
}

/// In-memory backend for tests and throwaway runs
///
/// Can be taken offline to simulate an unavailable store.
#[derive(Debug)]
pub struct MemoryBackend {
    files: RwLock<BTreeMap<String, Arc<RwLock<Vec<u8>>>>>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; every operation fails while offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Raw contents of a file
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().get(path).map(|f| f.read().clone())
    }

    fn check(&self, path: &str) -> io::Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "memory store is offline",
            ));
        }
        validate_path(path)
    }

    fn file(&self, path: &str) -> io::Result<Arc<RwLock<Vec<u8>>>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no such file: {}", path)))
    }
}

impl StorageBackend for MemoryBackend {
    fn create(&self, path: &str) -> io::Result<()> {
        self.check(path)?;
        self.files
            .write()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())));
        Ok(())
    }

    fn append(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.check(path)?;
        let file = self.file(path)?;
        file.write().extend_from_slice(bytes);
        Ok(())
    }

    fn put(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.check(path)?;
        self.files
            .write()
            .insert(path.to_string(), Arc::new(RwLock::new(bytes.to_vec())));
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::NotConnected, "memory store is offline"));
        }
        Ok(self
            .files
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn read_sequential(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        self.check(path)?;
        let snapshot = self.file(path)?.read().clone();
        Ok(Box::new(Cursor::new(snapshot)))
    }

    fn sync(&self, path: &str) -> io::Result<()> {
        self.check(path)?;
        self.file(path).map(|_| ())
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        self.check(path)?;
        Ok(self.file(path)?.read().len() as u64)
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        self.check(path)?;
        Ok(self.files.read().contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(backend: &dyn StorageBackend, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        backend
            .read_sequential(path)
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        buf
    }

    fn exercise(backend: &dyn StorageBackend) {
        backend.create("p=1/seg_0.log").unwrap();
        backend.append("p=1/seg_0.log", b"abc").unwrap();
        backend.append("p=1/seg_0.log", b"def").unwrap();
        backend.create("p=1/seg_0.log").unwrap();
        assert_eq!(read_all(backend, "p=1/seg_0.log"), b"abcdef");
        assert_eq!(backend.size("p=1/seg_0.log").unwrap(), 6);

        backend.create("p=2/seg_0.log").unwrap();
        backend.put("out/result.csv", b"one").unwrap();
        backend.put("out/result.csv", b"two").unwrap();
        assert_eq!(read_all(backend, "out/result.csv"), b"two");

        assert_eq!(
            backend.list("p=").unwrap(),
            vec!["p=1/seg_0.log".to_string(), "p=2/seg_0.log".to_string()]
        );
        assert!(backend.exists("out/result.csv").unwrap());
        assert!(!backend.exists("out/missing.csv").unwrap());
        backend.sync("p=1/seg_0.log").unwrap();
        backend.close("p=1/seg_0.log").unwrap();
        backend.append("p=1/seg_0.log", b"g").unwrap();
        assert_eq!(read_all(backend, "p=1/seg_0.log"), b"abcdefg");

        let err = backend.append("p=3/seg_0.log", b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = backend.put("../escape", b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_local_fs_backend() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFsBackend::new(temp_dir.path()).unwrap();
        exercise(&backend);
    }

    #[test]
    fn test_memory_backend() {
        let backend = MemoryBackend::new();
        exercise(&backend);
    }

    #[test]
    fn test_memory_backend_offline() {
        let backend = MemoryBackend::new();
        backend.create("a").unwrap();
        backend.set_available(false);
        assert_eq!(
            backend.append("a", b"x").unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        assert!(backend.list("").is_err());
        backend.set_available(true);
        backend.append("a", b"x").unwrap();
    }

    #[test]
    fn test_local_fs_reads_see_prior_appends() {
        let temp_dir = TempDir::new().unwrap();
        let backend = LocalFsBackend::new(temp_dir.path()).unwrap();
        backend.create("seg.log").unwrap();
        backend.append("seg.log", b"first").unwrap();
        let snapshot = read_all(&backend, "seg.log");
        backend.append("seg.log", b"second").unwrap();
        assert_eq!(snapshot, b"first");
        assert_eq!(read_all(&backend, "seg.log"), b"firstsecond");
    }
}
