//! Generic per-section cache over a [`ColumnStore`].
//!
//! Sections are persisted a column at a time: every stored section of a
//! column lives in one [`ColumnDocument`]. Loading any section loads its
//! whole column, after which each section of the column is either cached or
//! known to be absent.
//!
//! # Invariants
//! - A column is either loaded (all its sections resolved) or has no
//!   cached sections at all.
//! - The dirty queue only loses a column once its bytes were handed to the
//!   store (or the IO queue).
//! - Results of a load superseded by a synchronous load or an unload are
//!   discarded.

use crate::document::{ColumnDocument, DocumentError, decode_document, encode_document};
use crate::io::{ColumnDecoder, DecodedColumn, IntegrationTask, IoPriority, IoScheduler};
use crate::storage::{ColumnStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::{CellKey, ChunkPos, FlushConfig, SectionPos, WorldBounds};

/// Converts between live sections and their persisted form.
pub trait SectionCodec: Send + Sync + 'static {
    type Section: Send + 'static;
    type Stored: Serialize + DeserializeOwned + Send + 'static;

    /// A fresh, empty section.
    fn create(&self, key: CellKey) -> Self::Section;
    /// `None` when the section holds nothing worth storing.
    fn encode(&self, key: CellKey, section: &Self::Section) -> Option<Self::Stored>;
    fn decode(&self, key: CellKey, stored: Self::Stored) -> Result<Self::Section, String>;
}

/// Errors from cache operations that must produce a section.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("section {0:?} is outside the world's vertical bounds")]
    OutOfBounds(SectionPos),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Limits for one [`SectionCache::flush`] call.
#[derive(Debug, Clone, Copy)]
pub struct FlushBudget {
    pub max_columns: usize,
    pub deadline: Option<Instant>,
}

impl FlushBudget {
    pub fn unlimited() -> Self {
        Self {
            max_columns: usize::MAX,
            deadline: None,
        }
    }

    /// Budget for a flush starting now.
    pub fn from_config(config: &FlushConfig) -> Self {
        Self {
            max_columns: config.max_columns_per_tick,
            deadline: Some(Instant::now() + Duration::from_millis(config.budget_ms)),
        }
    }

    fn exhausted(&self, written: usize) -> bool {
        written >= self.max_columns || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub columns_written: usize,
    pub columns_cleared: usize,
    pub sections_written: usize,
    /// Dirty columns left for a later flush.
    pub remaining: usize,
}

/// Decode a column document, dropping sections that fail to decode.
fn decode_column<C: SectionCodec>(
    codec: &C,
    chunk: ChunkPos,
    bytes: &[u8],
) -> Result<DecodedColumn<C::Section>, StoreError> {
    let doc: ColumnDocument<ciborium::Value> = decode_document(bytes)?;
    let mut out = DecodedColumn::new();
    for (y, value) in doc.sections {
        let key = SectionPos::of(chunk, y).key();
        let stored = match value.deserialized::<C::Stored>() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(?chunk, y, error = %e, "failed to parse section, treating as absent");
                continue;
            }
        };
        match codec.decode(key, stored) {
            Ok(section) => {
                out.insert(y, section);
            }
            Err(reason) => {
                tracing::warn!(?chunk, y, %reason, "failed to decode section, treating as absent");
            }
        }
    }
    Ok(out)
}

/// [`ColumnDecoder`] running a [`SectionCodec`] on the IO worker.
pub struct CodecDecoder<C> {
    codec: Arc<C>,
}

impl<C: SectionCodec> ColumnDecoder<C::Section> for CodecDecoder<C> {
    fn decode(&self, chunk: ChunkPos, bytes: &[u8]) -> Result<DecodedColumn<C::Section>, StoreError> {
        decode_column(self.codec.as_ref(), chunk, bytes)
    }
}

pub struct SectionCache<C: SectionCodec> {
    codec: Arc<C>,
    store: Arc<dyn ColumnStore>,
    bounds: WorldBounds,
    sections: HashMap<CellKey, C::Section>,
    loaded: HashSet<ChunkPos>,
    dirty: VecDeque<ChunkPos>,
    dirty_set: HashSet<ChunkPos>,
    pending_loads: HashMap<ChunkPos, u64>,
    next_generation: u64,
    newly_loaded: Vec<CellKey>,
    io: Option<IoScheduler<C::Section>>,
}

impl<C: SectionCodec> SectionCache<C> {
    pub fn new(store: Arc<dyn ColumnStore>, codec: C, bounds: WorldBounds) -> Self {
        Self {
            codec: Arc::new(codec),
            store,
            bounds,
            sections: HashMap::new(),
            loaded: HashSet::new(),
            dirty: VecDeque::new(),
            dirty_set: HashSet::new(),
            pending_loads: HashMap::new(),
            next_generation: 0,
            newly_loaded: Vec::new(),
            io: None,
        }
    }

    /// Route background loads and flushes through an IO worker.
    pub fn with_background_io(mut self) -> Self {
        let decoder = CodecDecoder {
            codec: Arc::clone(&self.codec),
        };
        self.io = Some(IoScheduler::new(Arc::clone(&self.store), Box::new(decoder)));
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn bounds(&self) -> WorldBounds {
        self.bounds
    }

    pub fn in_bounds(&self, key: CellKey) -> bool {
        self.bounds.contains_section(key.y())
    }

    pub fn is_loaded(&self, chunk: ChunkPos) -> bool {
        self.loaded.contains(&chunk)
    }

    pub fn is_dirty(&self, chunk: ChunkPos) -> bool {
        self.dirty_set.contains(&chunk)
    }

    pub fn is_load_pending(&self, chunk: ChunkPos) -> bool {
        self.pending_loads.contains_key(&chunk)
    }

    pub fn loaded_columns(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.loaded.iter().copied()
    }

    pub fn dirty_columns(&self) -> usize {
        self.dirty.len()
    }

    pub fn cached_sections(&self) -> usize {
        self.sections.len()
    }

    /// Sections of a loaded column that are present, bottom to top.
    pub fn column_sections(&self, chunk: ChunkPos) -> impl Iterator<Item = (CellKey, &C::Section)> + '_ {
        self.bounds.sections().filter_map(move |y| {
            let key = SectionPos::of(chunk, y).key();
            self.sections.get(&key).map(|s| (key, s))
        })
    }

    /// Sections installed by loads since the last call.
    pub fn take_loaded(&mut self) -> Vec<CellKey> {
        std::mem::take(&mut self.newly_loaded)
    }

    /// Cache lookup without IO.
    pub fn get(&self, key: CellKey) -> Option<&C::Section> {
        self.sections.get(&key)
    }

    pub fn get_mut(&mut self, key: CellKey) -> Option<&mut C::Section> {
        self.sections.get_mut(&key)
    }

    /// Cached section, loading its column on a miss. Load failures are
    /// logged and reported as absent.
    pub fn get_or_load(&mut self, key: CellKey) -> Option<&C::Section> {
        self.ensure_for_query(key)?;
        self.sections.get(&key)
    }

    pub fn get_or_load_mut(&mut self, key: CellKey) -> Option<&mut C::Section> {
        self.ensure_for_query(key)?;
        self.sections.get_mut(&key)
    }

    fn ensure_for_query(&mut self, key: CellKey) -> Option<()> {
        if !self.in_bounds(key) {
            return None;
        }
        if let Err(e) = self.load_column(key.chunk()) {
            tracing::error!(section = ?SectionPos::from(key), error = %e, "column load failed");
            return None;
        }
        Some(())
    }

    /// Cached or loaded section, creating (and dirtying) an empty one if the
    /// store has none.
    pub fn get_or_create(&mut self, key: CellKey) -> Result<&mut C::Section, CacheError> {
        if !self.in_bounds(key) {
            return Err(CacheError::OutOfBounds(SectionPos::from(key)));
        }
        let chunk = key.chunk();
        self.load_column(chunk)?;
        if !self.sections.contains_key(&key) {
            self.mark_column_dirty(chunk);
        }
        let codec = &self.codec;
        Ok(self.sections.entry(key).or_insert_with(|| codec.create(key)))
    }

    /// Queue the section's column for writing. Ignored for columns that are
    /// not loaded, since flushing those would wipe what the store holds.
    pub fn mark_dirty(&mut self, key: CellKey) {
        let chunk = key.chunk();
        if !self.loaded.contains(&chunk) {
            tracing::warn!(section = ?SectionPos::from(key), "ignoring mark_dirty on unloaded column");
            return;
        }
        self.mark_column_dirty(chunk);
    }

    fn mark_column_dirty(&mut self, chunk: ChunkPos) {
        if self.dirty_set.insert(chunk) {
            self.dirty.push_back(chunk);
        }
    }

    /// Load a column synchronously if it is not resident. Superseded async
    /// loads for the column are cancelled.
    pub fn load_column(&mut self, chunk: ChunkPos) -> Result<(), StoreError> {
        if self.loaded.contains(&chunk) {
            return Ok(());
        }
        if let Some(generation) = self.pending_loads.remove(&chunk) {
            if let Some(io) = &self.io {
                io.cancel_load(chunk, generation);
            }
        }
        if let Some(io) = &self.io {
            if io.has_pending_write(chunk) {
                io.wait_idle();
            }
        }
        let decoded = match self.read_column(chunk) {
            Ok(decoded) => decoded,
            Err(e) if e.is_transient() => {
                tracing::warn!(?chunk, error = %e, "column unreadable, treating as absent");
                DecodedColumn::new()
            }
            Err(e) => return Err(e),
        };
        self.install(chunk, decoded);
        Ok(())
    }

    fn read_column(&self, chunk: ChunkPos) -> Result<DecodedColumn<C::Section>, StoreError> {
        match self.store.read(chunk)? {
            Some(bytes) => decode_column(self.codec.as_ref(), chunk, &bytes),
            None => Ok(DecodedColumn::new()),
        }
    }

    fn install(&mut self, chunk: ChunkPos, decoded: DecodedColumn<C::Section>) {
        self.loaded.insert(chunk);
        for (y, section) in decoded {
            if !self.bounds.contains_section(y) {
                tracing::warn!(?chunk, y, "stored section outside world bounds, ignoring");
                continue;
            }
            let key = SectionPos::of(chunk, y).key();
            if let std::collections::hash_map::Entry::Vacant(slot) = self.sections.entry(key) {
                slot.insert(section);
                self.newly_loaded.push(key);
            }
        }
        tracing::trace!(?chunk, "column installed");
    }

    /// Encode a column to bytes, or `None` if nothing in it needs storing.
    fn encode_column(&self, chunk: ChunkPos) -> Result<(Option<Vec<u8>>, usize), StoreError> {
        let mut stored = BTreeMap::new();
        for (key, section) in self.column_sections(chunk) {
            if let Some(value) = self.codec.encode(key, section) {
                let value = ciborium::Value::serialized(&value)
                    .map_err(|e| DocumentError::CborEncode(e.to_string()))?;
                stored.insert(key.y(), value);
            }
        }
        if stored.is_empty() {
            return Ok((None, 0));
        }
        let count = stored.len();
        Ok((Some(encode_document(&ColumnDocument::new(stored))?), count))
    }

    fn write_column(&self, chunk: ChunkPos, bytes: Option<Vec<u8>>, sync: bool) -> Result<(), StoreError> {
        match &self.io {
            Some(io) if !sync => {
                io.submit_write(chunk, bytes, IoPriority::Background);
                Ok(())
            }
            Some(io) => {
                // let queued writes land first so they cannot overwrite this one
                io.wait_idle();
                self.store.write(chunk, bytes.as_deref())
            }
            None => self.store.write(chunk, bytes.as_deref()),
        }
    }

    fn flush_one(&mut self, chunk: ChunkPos, sync: bool, stats: &mut FlushStats) -> Result<(), StoreError> {
        let (bytes, sections) = self.encode_column(chunk)?;
        let cleared = bytes.is_none();
        self.write_column(chunk, bytes, sync)?;
        if cleared {
            stats.columns_cleared += 1;
        }
        stats.columns_written += 1;
        stats.sections_written += sections;
        Ok(())
    }

    /// Write dirty columns oldest-first until the budget runs out. With
    /// background IO the writes are queued rather than performed.
    pub fn flush(&mut self, budget: FlushBudget) -> Result<FlushStats, StoreError> {
        let _span = tracing::info_span!("section_flush").entered();
        let mut stats = FlushStats::default();
        while !budget.exhausted(stats.columns_written) {
            let Some(chunk) = self.dirty.pop_front() else {
                break;
            };
            if let Err(e) = self.flush_one(chunk, false, &mut stats) {
                tracing::error!(?chunk, error = %e, "column flush failed");
                self.dirty.push_front(chunk);
                return Err(e);
            }
            self.dirty_set.remove(&chunk);
        }
        stats.remaining = self.dirty.len();
        if stats.columns_written > 0 {
            tracing::debug!(
                columns = stats.columns_written,
                sections = stats.sections_written,
                remaining = stats.remaining,
                "flushed dirty columns"
            );
        }
        Ok(stats)
    }

    /// Queue every dirty column on the IO worker (or write them now when
    /// there is none).
    pub fn submit_flush(&mut self) -> Result<FlushStats, StoreError> {
        self.flush(FlushBudget::unlimited())
    }

    /// Write one column now if it is dirty. Returns whether it was written.
    pub fn flush_column(&mut self, chunk: ChunkPos) -> Result<bool, StoreError> {
        if !self.dirty_set.contains(&chunk) {
            return Ok(false);
        }
        let mut stats = FlushStats::default();
        self.flush_one(chunk, true, &mut stats)?;
        self.dirty_set.remove(&chunk);
        self.dirty.retain(|c| *c != chunk);
        Ok(true)
    }

    /// Write every dirty column and wait for queued IO. Shutdown sync point.
    pub fn flush_all(&mut self) -> Result<FlushStats, StoreError> {
        let _span = tracing::info_span!("section_flush_all").entered();
        let mut stats = FlushStats::default();
        if let Some(io) = &self.io {
            io.wait_idle();
        }
        while let Some(chunk) = self.dirty.front().copied() {
            self.flush_one(chunk, true, &mut stats)?;
            self.dirty.pop_front();
            self.dirty_set.remove(&chunk);
        }
        self.store.flush()?;
        Ok(stats)
    }

    /// Flush a column and drop it from memory. A load still in flight for
    /// it is cancelled.
    pub fn unload_column(&mut self, chunk: ChunkPos) -> Result<(), StoreError> {
        if let Some(generation) = self.pending_loads.remove(&chunk) {
            if let Some(io) = &self.io {
                io.cancel_load(chunk, generation);
            }
        }
        self.flush_column(chunk)?;
        for y in self.bounds.sections() {
            self.sections.remove(&SectionPos::of(chunk, y).key());
        }
        self.loaded.remove(&chunk);
        Ok(())
    }

    /// Ask for a column to be loaded in the background. Without background
    /// IO the column is loaded immediately.
    pub fn request_load(&mut self, chunk: ChunkPos, priority: IoPriority) -> Result<(), StoreError> {
        if self.loaded.contains(&chunk) || self.pending_loads.contains_key(&chunk) {
            return Ok(());
        }
        let Some(io) = &self.io else {
            return self.load_column(chunk);
        };
        self.next_generation += 1;
        let generation = self.next_generation;
        self.pending_loads.insert(chunk, generation);
        io.submit_load(chunk, generation, priority);
        Ok(())
    }

    /// Apply one task handed back by the IO worker.
    pub fn integrate(&mut self, task: IntegrationTask<C::Section>) {
        match task {
            IntegrationTask::InstallColumn {
                chunk,
                generation,
                sections,
            } => {
                if !self.take_pending(chunk, generation) {
                    return;
                }
                self.install(chunk, sections);
            }
            IntegrationTask::LoadFailed {
                chunk,
                generation,
                error,
            } => {
                if !self.take_pending(chunk, generation) {
                    return;
                }
                if error.is_transient() {
                    tracing::warn!(?chunk, %error, "column unreadable, treating as absent");
                    self.install(chunk, DecodedColumn::new());
                } else {
                    tracing::error!(?chunk, %error, "background column load failed");
                }
            }
            IntegrationTask::WriteFailed { chunk, error } => {
                tracing::error!(?chunk, %error, "background column write failed");
                if self.loaded.contains(&chunk) {
                    self.mark_column_dirty(chunk);
                }
            }
        }
    }

    fn take_pending(&mut self, chunk: ChunkPos, generation: u64) -> bool {
        if self.pending_loads.get(&chunk) == Some(&generation) {
            self.pending_loads.remove(&chunk);
            true
        } else {
            tracing::trace!(?chunk, generation, "discarding superseded load");
            false
        }
    }

    /// Integrate everything the IO worker has finished. Returns the number
    /// of tasks applied.
    pub fn drain_io(&mut self) -> usize {
        let Some(io) = &self.io else {
            return 0;
        };
        let _span = tracing::info_span!("section_io_drain").entered();
        let tasks = io.drain_completed();
        let count = tasks.len();
        for task in tasks {
            self.integrate(task);
        }
        count
    }

    /// Block until queued IO finished, then integrate the results.
    pub fn wait_io(&mut self) -> usize {
        if let Some(io) = &self.io {
            io.wait_idle();
        }
        self.drain_io()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    /// Sections are lists of numbers; empty lists are not stored.
    struct NumbersCodec;

    impl SectionCodec for NumbersCodec {
        type Section = Vec<u32>;
        type Stored = Vec<u32>;

        fn create(&self, _key: CellKey) -> Vec<u32> {
            Vec::new()
        }

        fn encode(&self, _key: CellKey, section: &Vec<u32>) -> Option<Vec<u32>> {
            (!section.is_empty()).then(|| section.clone())
        }

        fn decode(&self, _key: CellKey, stored: Vec<u32>) -> Result<Vec<u32>, String> {
            if stored.contains(&u32::MAX) {
                return Err("poisoned section".into());
            }
            Ok(stored)
        }
    }

    fn cache(store: &Arc<MemoryStore>) -> SectionCache<NumbersCodec> {
        SectionCache::new(store.clone(), NumbersCodec, WorldBounds::default())
    }

    fn key(x: i32, y: i32, z: i32) -> CellKey {
        SectionPos::new(x, y, z).key()
    }

    #[test]
    fn created_sections_persist_across_caches() {
        let store = Arc::new(MemoryStore::new());
        let mut first = cache(&store);
        first.get_or_create(key(1, 4, 1)).unwrap().push(10);
        first.get_or_create(key(1, 5, 1)).unwrap().push(11);
        assert!(first.is_dirty(ChunkPos::new(1, 1)));
        let stats = first.flush(FlushBudget::unlimited()).unwrap();
        assert_eq!(stats.columns_written, 1);
        assert_eq!(stats.sections_written, 2);

        let mut second = cache(&store);
        assert_eq!(second.get_or_load(key(1, 4, 1)), Some(&vec![10]));
        assert_eq!(second.get(key(1, 5, 1)), Some(&vec![11]));
        let mut loaded = second.take_loaded();
        loaded.sort();
        assert_eq!(loaded, vec![key(1, 4, 1), key(1, 5, 1)]);
    }

    #[test]
    fn get_or_load_does_not_fabricate() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store);
        assert!(c.get_or_load(key(0, 0, 0)).is_none());
        assert!(c.is_loaded(ChunkPos::new(0, 0)));
        assert!(!c.is_dirty(ChunkPos::new(0, 0)));
        assert_eq!(c.cached_sections(), 0);
        // column already resolved: no second read
        let reads = store.reads();
        assert!(c.get_or_load(key(0, 3, 0)).is_none());
        assert_eq!(store.reads(), reads);
    }

    #[test]
    fn out_of_bounds_sections_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store);
        assert!(matches!(
            c.get_or_create(key(0, 20, 0)),
            Err(CacheError::OutOfBounds(_))
        ));
        assert!(c.get_or_load(key(0, -5, 0)).is_none());
    }

    #[test]
    fn corrupt_column_is_absent() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(ChunkPos::new(2, 2), vec![0xff, 0x00, 0x01]);
        let mut c = cache(&store);
        assert!(c.get_or_load(key(2, 0, 2)).is_none());
        c.get_or_create(key(2, 0, 2)).unwrap().push(1);
    }

    #[test]
    fn bad_section_does_not_hide_siblings() {
        let store = Arc::new(MemoryStore::new());
        let mut sections = BTreeMap::new();
        sections.insert(0, ciborium::Value::serialized(&vec![1u32]).unwrap());
        sections.insert(1, ciborium::Value::serialized(&vec![u32::MAX]).unwrap());
        sections.insert(2, ciborium::Value::Text("not a list".into()));
        let bytes = encode_document(&ColumnDocument::new(sections)).unwrap();
        store.insert_raw(ChunkPos::new(0, 0), bytes);

        let mut c = cache(&store);
        assert_eq!(c.get_or_load(key(0, 0, 0)), Some(&vec![1]));
        assert!(c.get(key(0, 1, 0)).is_none());
        assert!(c.get(key(0, 2, 0)).is_none());
    }

    #[test]
    fn newer_version_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let doc = ColumnDocument {
            data_version: crate::document::CURRENT_DATA_VERSION + 1,
            sections: BTreeMap::<i32, Vec<u32>>::new(),
        };
        store.insert_raw(ChunkPos::new(0, 0), encode_document(&doc).unwrap());
        let mut c = cache(&store);
        assert!(c.get_or_load(key(0, 0, 0)).is_none());
        assert!(!c.is_loaded(ChunkPos::new(0, 0)));
        assert!(matches!(
            c.get_or_create(key(0, 0, 0)),
            Err(CacheError::Store(_))
        ));
    }

    #[test]
    fn flush_respects_column_budget_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store);
        for x in 0..5 {
            c.get_or_create(key(x, 0, 0)).unwrap().push(x as u32);
        }
        let budget = FlushBudget {
            max_columns: 2,
            deadline: None,
        };
        let stats = c.flush(budget).unwrap();
        assert_eq!(stats.columns_written, 2);
        assert_eq!(stats.remaining, 3);
        assert!(store.contains(ChunkPos::new(0, 0)));
        assert!(store.contains(ChunkPos::new(1, 0)));
        assert!(!store.contains(ChunkPos::new(2, 0)));

        let stats = c.flush(FlushBudget::unlimited()).unwrap();
        assert_eq!(stats.columns_written, 3);
        assert_eq!(c.dirty_columns(), 0);
    }

    #[test]
    fn emptied_column_clears_slot() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store);
        c.get_or_create(key(3, 1, 3)).unwrap().push(7);
        c.flush_all().unwrap();
        assert!(store.contains(ChunkPos::new(3, 3)));

        c.get_mut(key(3, 1, 3)).unwrap().clear();
        c.mark_dirty(key(3, 1, 3));
        let stats = c.flush(FlushBudget::unlimited()).unwrap();
        assert_eq!(stats.columns_cleared, 1);
        assert!(!store.contains(ChunkPos::new(3, 3)));
    }

    #[test]
    fn mark_dirty_on_unloaded_column_keeps_store() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store);
        c.get_or_create(key(5, 1, 5)).unwrap().push(9);
        c.unload_column(ChunkPos::new(5, 5)).unwrap();

        c.mark_dirty(key(5, 1, 5));
        assert!(!c.is_dirty(ChunkPos::new(5, 5)));
        let stats = c.flush(FlushBudget::unlimited()).unwrap();
        assert_eq!(stats.columns_written, 0);
        assert!(store.contains(ChunkPos::new(5, 5)));
        assert_eq!(c.get_or_load(key(5, 1, 5)), Some(&vec![9]));
    }

    #[test]
    fn reload_during_slow_background_write_sees_new_bytes() {
        let store = Arc::new(crate::io::tests::SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(300),
        });
        let mut c = SectionCache::new(store.clone(), NumbersCodec, WorldBounds::default()).with_background_io();
        c.get_or_create(key(3, 2, 3)).unwrap().push(7);
        c.submit_flush().unwrap();
        // the worker is now inside the store write
        std::thread::sleep(Duration::from_millis(50));
        c.unload_column(ChunkPos::new(3, 3)).unwrap();

        assert_eq!(c.get_or_load(key(3, 2, 3)), Some(&vec![7]));
        c.get_or_create(key(3, 3, 3)).unwrap().push(8);
        c.flush_all().unwrap();

        let mut fresh = SectionCache::new(store.clone(), NumbersCodec, WorldBounds::default());
        assert_eq!(fresh.get_or_load(key(3, 2, 3)), Some(&vec![7]));
        assert_eq!(fresh.get(key(3, 3, 3)), Some(&vec![8]));
    }

    #[test]
    fn unload_flushes_and_evicts() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store);
        c.get_or_create(key(4, 0, 4)).unwrap().push(1);
        c.unload_column(ChunkPos::new(4, 4)).unwrap();
        assert!(!c.is_loaded(ChunkPos::new(4, 4)));
        assert_eq!(c.cached_sections(), 0);
        assert!(store.contains(ChunkPos::new(4, 4)));
    }

    #[test]
    fn background_load_and_flush() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut c = cache(&store);
            c.get_or_create(key(6, 2, 6)).unwrap().push(42);
            c.flush_all().unwrap();
        }
        let mut c = cache(&store).with_background_io();
        c.request_load(ChunkPos::new(6, 6), IoPriority::Urgent).unwrap();
        assert!(c.is_load_pending(ChunkPos::new(6, 6)));
        assert!(c.get(key(6, 2, 6)).is_none());
        c.wait_io();
        assert!(c.is_loaded(ChunkPos::new(6, 6)));
        assert_eq!(c.get(key(6, 2, 6)), Some(&vec![42]));
        assert_eq!(c.take_loaded(), vec![key(6, 2, 6)]);

        c.get_mut(key(6, 2, 6)).unwrap().push(43);
        c.mark_dirty(key(6, 2, 6));
        c.submit_flush().unwrap();
        c.wait_io();
        let mut fresh = cache(&store);
        assert_eq!(fresh.get_or_load(key(6, 2, 6)), Some(&vec![42, 43]));
    }

    #[test]
    fn unload_discards_pending_load() {
        let store = Arc::new(MemoryStore::new());
        let mut c = cache(&store).with_background_io();
        c.request_load(ChunkPos::new(8, 8), IoPriority::Background).unwrap();
        c.unload_column(ChunkPos::new(8, 8)).unwrap();
        c.wait_io();
        assert!(!c.is_loaded(ChunkPos::new(8, 8)));
        assert!(c.take_loaded().is_empty());
    }
}
