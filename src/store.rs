//! Persistent vector store.
//!
//! One directory per namespace under the index root, each holding a bincode
//! snapshot plus an append-only WAL. Puts append to the WAL; snapshots
//! coalesce the log lazily (on load, and when the log outgrows the coalesce
//! threshold). A PID lockfile at the root refuses concurrent cross-process
//! writers; stale locks from dead processes are reclaimed.

use crate::config::WAL_COALESCE_THRESHOLD;
use crate::error::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const WAL_FILE: &str = "wal.bin";
const LOCK_FILE: &str = "index.lock";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub source_url: Option<String>,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceStats {
    pub namespace: String,
    pub records: usize,
    pub dims: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dims: usize,
    records: Vec<StoredRecord>,
}

#[derive(Debug)]
struct WalWriter {
    writer: BufWriter<File>,
    appended: usize,
}

#[derive(Debug)]
struct Namespace {
    dir: PathBuf,
    records: RwLock<HashMap<String, StoredRecord>>,
    wal: Mutex<WalWriter>,
}

/// Holds the on-disk lock for the store's lifetime; removed on drop.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove {:?}: {}", self.path, e);
        }
    }
}

#[derive(Debug)]
pub struct VectorStore {
    root: PathBuf,
    dims: usize,
    namespaces: DashMap<String, Arc<Namespace>>,
    _lock: LockGuard,
}

impl VectorStore {
    /// Open (or create) the index root, acquiring the writer lock and
    /// loading every existing namespace.
    pub fn open(root: impl AsRef<Path>, dims: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let lock = acquire_lock(&root)?;

        let store = Self {
            root: root.clone(),
            dims,
            namespaces: DashMap::new(),
            _lock: lock,
        };

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let namespace = load_namespace(&entry.path(), dims)?;
            store.namespaces.insert(name, Arc::new(namespace));
        }

        info!(
            "Vector store open at {:?} ({} namespaces, {} dims)",
            root,
            store.namespaces.len(),
            dims
        );
        Ok(store)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.records.read().map(|r| r.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    pub fn stats(&self, namespace: &str) -> NamespaceStats {
        NamespaceStats {
            namespace: namespace.to_string(),
            records: self.len(namespace),
            dims: self.dims,
        }
    }

    /// Insert or overwrite by chunk id.
    pub fn put(&self, namespace: &str, record: StoredRecord) -> Result<()> {
        if record.vector.len() != self.dims {
            return Err(Error::new(
                ErrorKind::DimMismatch,
                format!(
                    "vector has {} dims, store expects {}",
                    record.vector.len(),
                    self.dims
                ),
            ));
        }

        let ns = self.get_or_create(namespace)?;

        let frame = bincode::serialize(&record)
            .map_err(|e| Error::internal(format!("record serialization failed: {}", e)))?;
        let mut needs_coalesce = false;
        {
            let mut wal = ns
                .wal
                .lock()
                .map_err(|_| Error::internal("wal lock poisoned"))?;
            wal.writer.write_all(&(frame.len() as u32).to_le_bytes())?;
            wal.writer.write_all(&frame)?;
            wal.appended += 1;
            if wal.appended >= WAL_COALESCE_THRESHOLD {
                needs_coalesce = true;
            }
        }
        {
            let mut records = ns
                .records
                .write()
                .map_err(|_| Error::internal("record lock poisoned"))?;
            records.insert(record.chunk_id.clone(), record);
        }

        if needs_coalesce {
            self.coalesce(&ns)?;
        }
        Ok(())
    }

    /// Cosine query, descending by score. `strict` turns an unknown
    /// namespace into an error instead of an empty result.
    pub fn query(
        &self,
        namespace: &str,
        query_vector: &[f32],
        top_k: usize,
        threshold: Option<f32>,
        strict: bool,
    ) -> Result<Vec<ScoredChunk>> {
        if query_vector.len() != self.dims {
            return Err(Error::new(
                ErrorKind::DimMismatch,
                format!(
                    "query vector has {} dims, store expects {}",
                    query_vector.len(),
                    self.dims
                ),
            ));
        }
        let Some(ns) = self.namespaces.get(namespace).map(|e| Arc::clone(e.value())) else {
            if strict {
                return Err(Error::not_found(format!("namespace '{}' does not exist", namespace))
                    .with_detail("reason", "namespace_missing"));
            }
            return Ok(Vec::new());
        };

        let records = ns
            .records
            .read()
            .map_err(|_| Error::internal("record lock poisoned"))?;

        let mut scored: Vec<ScoredChunk> = records
            .par_iter()
            .map(|(_, record)| ScoredChunk {
                chunk_id: record.chunk_id.clone(),
                score: cosine(query_vector, &record.vector),
                text: record.text.clone(),
                source_url: record.source_url.clone(),
                namespace: namespace.to_string(),
            })
            .filter(|chunk| threshold.map(|t| chunk.score >= t).unwrap_or(true))
            .collect();

        scored.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Drop one namespace, or every namespace when `None`.
    pub fn reset(&self, namespace: Option<&str>) -> Result<()> {
        match namespace {
            Some(name) => {
                self.namespaces.remove(name);
                let dir = self.root.join(name);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                info!("Reset namespace '{}'", name);
            }
            None => {
                let names = self.namespaces();
                self.namespaces.clear();
                for name in names {
                    let dir = self.root.join(&name);
                    if dir.exists() {
                        fs::remove_dir_all(&dir)?;
                    }
                }
                info!("Reset all namespaces");
            }
        }
        Ok(())
    }

    /// Flush buffered WAL frames to disk, fsync included.
    pub fn flush(&self) -> Result<()> {
        for entry in self.namespaces.iter() {
            let mut wal = entry
                .wal
                .lock()
                .map_err(|_| Error::internal("wal lock poisoned"))?;
            wal.writer.flush()?;
            wal.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn get_or_create(&self, namespace: &str) -> Result<Arc<Namespace>> {
        if let Some(ns) = self.namespaces.get(namespace) {
            return Ok(Arc::clone(ns.value()));
        }
        let dir = self.root.join(namespace);
        fs::create_dir_all(&dir)?;
        let ns = Arc::new(Namespace {
            wal: Mutex::new(open_wal(&dir)?),
            records: RwLock::new(HashMap::new()),
            dir,
        });
        let entry = self.namespaces.entry(namespace.to_string()).or_insert(ns);
        Ok(Arc::clone(entry.value()))
    }

    /// Rewrite the snapshot from memory and truncate the WAL.
    fn coalesce(&self, ns: &Arc<Namespace>) -> Result<()> {
        let mut wal = ns
            .wal
            .lock()
            .map_err(|_| Error::internal("wal lock poisoned"))?;
        let records = ns
            .records
            .read()
            .map_err(|_| Error::internal("record lock poisoned"))?;
        write_snapshot(&ns.dir, self.dims, records.values().cloned().collect())?;
        drop(records);

        *wal = open_wal_truncated(&ns.dir)?;
        debug!("Coalesced WAL into snapshot at {:?}", ns.dir);
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

fn acquire_lock(root: &Path) -> Result<LockGuard> {
    let path = root.join(LOCK_FILE);
    if let Ok(raw) = fs::read_to_string(&path) {
        if let Ok(pid) = raw.trim().parse::<u32>() {
            if process_alive(pid) {
                return Err(Error::new(
                    ErrorKind::LockConflict,
                    format!("index at {:?} is locked by pid {}", root, pid),
                )
                .with_detail("pid", pid));
            }
            warn!("Reclaiming stale index lock from dead pid {}", pid);
        }
    }
    fs::write(&path, std::process::id().to_string())?;
    Ok(LockGuard { path })
}

fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.exists() {
        return proc_root.join(pid.to_string()).exists();
    }
    // No /proc to consult; assume the holder is alive rather than corrupt it
    true
}

fn open_wal(dir: &Path) -> Result<WalWriter> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(WAL_FILE))?;
    Ok(WalWriter {
        writer: BufWriter::new(file),
        appended: 0,
    })
}

fn open_wal_truncated(dir: &Path) -> Result<WalWriter> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(WAL_FILE))?;
    Ok(WalWriter {
        writer: BufWriter::new(file),
        appended: 0,
    })
}

fn load_namespace(dir: &Path, dims: usize) -> Result<Namespace> {
    let mut records: HashMap<String, StoredRecord> = HashMap::new();

    let snapshot_path = dir.join(SNAPSHOT_FILE);
    if snapshot_path.exists() {
        let data = fs::read(&snapshot_path)?;
        let snapshot: Snapshot = bincode::deserialize(&data)
            .map_err(|e| Error::parse(format!("corrupt snapshot {:?}: {}", snapshot_path, e)))?;
        if snapshot.dims != dims {
            return Err(Error::new(
                ErrorKind::DimMismatch,
                format!(
                    "index at {:?} was built with {} dims, embedder produces {}; reset required",
                    dir, snapshot.dims, dims
                ),
            ));
        }
        for record in snapshot.records {
            records.insert(record.chunk_id.clone(), record);
        }
    }

    let replayed = replay_wal(&dir.join(WAL_FILE), &mut records);
    if let Some(record) = records.values().find(|r| r.vector.len() != dims) {
        return Err(Error::new(
            ErrorKind::DimMismatch,
            format!(
                "index at {:?} holds {}-dim vectors (e.g. {}), embedder produces {}; reset required",
                dir,
                record.vector.len(),
                record.chunk_id,
                dims
            ),
        ));
    }
    if replayed > 0 {
        debug!("Replayed {} WAL records in {:?}", replayed, dir);
        // Lazy coalesce: fold the log into the snapshot at load time
        write_snapshot(dir, dims, records.values().cloned().collect())?;
        return Ok(Namespace {
            wal: Mutex::new(open_wal_truncated(dir)?),
            records: RwLock::new(records),
            dir: dir.to_path_buf(),
        });
    }

    Ok(Namespace {
        wal: Mutex::new(open_wal(dir)?),
        records: RwLock::new(records),
        dir: dir.to_path_buf(),
    })
}

/// Replay length-framed WAL records; a truncated tail (crash mid-append) is
/// dropped with a warning.
fn replay_wal(path: &Path, records: &mut HashMap<String, StoredRecord>) -> usize {
    let Ok(data) = fs::read(path) else {
        return 0;
    };
    let mut replayed = 0usize;
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[pos..pos + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        pos += 4;
        if pos + len > data.len() {
            warn!("Dropping truncated WAL tail in {:?}", path);
            break;
        }
        match bincode::deserialize::<StoredRecord>(&data[pos..pos + len]) {
            Ok(record) => {
                records.insert(record.chunk_id.clone(), record);
                replayed += 1;
            }
            Err(e) => {
                warn!("Dropping undecodable WAL record in {:?}: {}", path, e);
                break;
            }
        }
        pos += len;
    }
    replayed
}

fn write_snapshot(dir: &Path, dims: usize, records: Vec<StoredRecord>) -> Result<()> {
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        dims,
        records,
    };
    let data = bincode::serialize(&snapshot)
        .map_err(|e| Error::internal(format!("snapshot serialization failed: {}", e)))?;

    // Write to a temp file then rename, so readers never see a torn snapshot
    let final_path = dir.join(SNAPSHOT_FILE);
    let temp_path = dir.join(format!("{}.tmp", SNAPSHOT_FILE));
    fs::write(&temp_path, &data)?;
    fs::rename(&temp_path, &final_path)?;
    Ok(())
}
