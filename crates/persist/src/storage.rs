//! Folder of region files addressed by chunk, with a bounded set of open
//! files.

use crate::document::DocumentError;
use crate::region::{RegionError, RegionFile, RegionOptions, SlotEntry};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use strata_common::{ChunkPos, RegionConfig, RegionPos};

/// Errors surfaced by a [`ColumnStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl StoreError {
    /// Transient failures only affect one column's payload and are treated
    /// as "absent" by readers. Everything else reaches the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Region(e) => e.is_transient(),
            StoreError::Document(DocumentError::NewerVersion { .. }) => false,
            StoreError::Document(_) => true,
        }
    }
}

/// Byte storage for whole columns.
pub trait ColumnStore: Send + Sync {
    fn read(&self, chunk: ChunkPos) -> Result<Option<Vec<u8>>, StoreError>;
    /// `None` clears the column.
    fn write(&self, chunk: ChunkPos, data: Option<&[u8]>) -> Result<(), StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
}

type SharedRegion = Arc<Mutex<RegionFile>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Open region handles. A handle pushed out of the LRU while another
/// thread still holds it stays reachable through `retired`, so a region is
/// never open twice.
struct OpenRegions {
    lru: LruCache<RegionPos, SharedRegion>,
    retired: HashMap<RegionPos, Weak<Mutex<RegionFile>>>,
}

impl OpenRegions {
    fn len(&self) -> usize {
        self.lru.len()
    }

    /// Cached handle, reviving a retired one that is still alive.
    fn get(&mut self, region: RegionPos) -> Option<SharedRegion> {
        if let Some(file) = self.lru.get(&region) {
            return Some(Arc::clone(file));
        }
        let file = self.retired.remove(&region)?.upgrade()?;
        tracing::trace!(?region, "reusing region file still held elsewhere");
        self.insert(region, Arc::clone(&file));
        Some(file)
    }

    fn insert(&mut self, region: RegionPos, file: SharedRegion) {
        let Some((evicted, handle)) = self.lru.push(region, file) else {
            return;
        };
        if evicted == region {
            return;
        }
        tracing::debug!(region = ?evicted, "closing least recently used region file");
        if let Err(e) = lock(&handle).flush() {
            tracing::error!(region = ?evicted, error = %e, "failed to flush evicted region file");
        }
        self.retired.retain(|_, weak| weak.strong_count() > 0);
        if Arc::strong_count(&handle) > 1 {
            self.retired.insert(evicted, Arc::downgrade(&handle));
        }
    }
}

/// Region files inside one folder, `r.<rx>.<rz>.region` each.
pub struct RegionStorage {
    folder: PathBuf,
    options: RegionOptions,
    open: Mutex<OpenRegions>,
}

impl RegionStorage {
    pub fn new(folder: impl AsRef<Path>, config: &RegionConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            folder: folder.as_ref().to_path_buf(),
            options: RegionOptions::from(config),
            open: Mutex::new(OpenRegions {
                lru: LruCache::new(capacity),
                retired: HashMap::new(),
            }),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn region_path(&self, region: RegionPos) -> PathBuf {
        self.folder.join(region.file_name())
    }

    /// Number of region files currently held open.
    pub fn open_files(&self) -> usize {
        lock(&self.open).len()
    }

    /// The open handle for a region. With `create` false a missing file
    /// yields `None` and nothing is written to disk.
    fn region_file(&self, region: RegionPos, create: bool) -> Result<Option<SharedRegion>, RegionError> {
        let mut open = lock(&self.open);
        if let Some(file) = open.get(region) {
            return Ok(Some(file));
        }
        let path = self.region_path(region);
        if !create && !path.exists() {
            return Ok(None);
        }
        if create {
            std::fs::create_dir_all(&self.folder).map_err(|source| RegionError::Open {
                path: self.folder.clone(),
                source,
            })?;
        }
        let file = Arc::new(Mutex::new(RegionFile::open(&path, region, self.options)?));
        open.insert(region, Arc::clone(&file));
        Ok(Some(file))
    }

    pub fn chunk_exists(&self, chunk: ChunkPos) -> Result<bool, RegionError> {
        Ok(match self.region_file(chunk.region(), false)? {
            Some(file) => lock(&file).has_chunk(chunk),
            None => false,
        })
    }

    /// Last-write time of a chunk in unix seconds.
    pub fn timestamp(&self, chunk: ChunkPos) -> Result<Option<u32>, RegionError> {
        Ok(self.region_file(chunk.region(), false)?.and_then(|file| {
            let slot = lock(&file).slot(chunk);
            (!slot.is_empty()).then_some(slot.timestamp)
        }))
    }

    /// Live slots of one region, empty if the file does not exist.
    pub fn slots(&self, region: RegionPos) -> Result<Vec<(ChunkPos, SlotEntry)>, RegionError> {
        Ok(match self.region_file(region, false)? {
            Some(file) => lock(&file).slots().collect(),
            None => Vec::new(),
        })
    }

    /// Flush and drop every open file.
    pub fn close(&self) -> Result<(), RegionError> {
        let mut open = lock(&self.open);
        open.retired.clear();
        let mut first_error = None;
        while let Some((region, file)) = open.lru.pop_lru() {
            if let Err(e) = lock(&file).flush() {
                tracing::error!(?region, error = %e, "failed to flush region file on close");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl ColumnStore for RegionStorage {
    fn read(&self, chunk: ChunkPos) -> Result<Option<Vec<u8>>, StoreError> {
        match self.region_file(chunk.region(), false)? {
            Some(file) => Ok(lock(&file).read(chunk)?),
            None => Ok(None),
        }
    }

    fn write(&self, chunk: ChunkPos, data: Option<&[u8]>) -> Result<(), StoreError> {
        // clearing a chunk in a file that was never written is a no-op
        let file = match self.region_file(chunk.region(), data.is_some())? {
            Some(file) => file,
            None => return Ok(()),
        };
        lock(&file).write(chunk, data)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let files: Vec<SharedRegion> = {
            let open = lock(&self.open);
            open.lru
                .iter()
                .map(|(_, f)| Arc::clone(f))
                .chain(open.retired.values().filter_map(Weak::upgrade))
                .collect()
        };
        for file in files {
            lock(&file).flush()?;
        }
        Ok(())
    }
}

impl Drop for RegionStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "region storage closed with errors");
        }
    }
}

/// In-memory column store.
#[derive(Default)]
pub struct MemoryStore {
    columns: Mutex<HashMap<ChunkPos, Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn contains(&self, chunk: ChunkPos) -> bool {
        lock(&self.columns).contains_key(&chunk)
    }

    /// Store raw bytes directly, bypassing the write counter.
    pub fn insert_raw(&self, chunk: ChunkPos, bytes: Vec<u8>) {
        lock(&self.columns).insert(chunk, bytes);
    }
}

impl ColumnStore for MemoryStore {
    fn read(&self, chunk: ChunkPos) -> Result<Option<Vec<u8>>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(lock(&self.columns).get(&chunk).cloned())
    }

    fn write(&self, chunk: ChunkPos, data: Option<&[u8]>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut columns = lock(&self.columns);
        match data {
            Some(bytes) => {
                columns.insert(chunk, bytes.to_vec());
            }
            None => {
                columns.remove(&chunk);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
