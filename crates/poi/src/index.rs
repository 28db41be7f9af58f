//! The POI index: typed records per section on top of [`SectionCache`],
//! a distance field over "village" sections, ticket accounting and
//! notifications.
//!
//! # Invariants
//! - Every mutation dirties its section and re-evaluates it in the
//!   distance field.
//! - Every section installed by a load is evaluated as well.
//! - Ticket counts never leave `0..=max_tickets`.

use crate::distance::DistanceField;
use crate::record::PoiRecord;
use crate::registry::{PoiRegistry, PoiTypeId};
use crate::section::{PoiSection, PoiSectionCodec};
use std::path::Path;
use std::sync::Arc;
use strata_common::{BlockPos, CellKey, ChunkPos, FlushConfig, PoiConfig, SectionPos, StrataConfig, WorldBounds};
use strata_persist::{
    CacheError, ColumnStore, FlushBudget, FlushStats, IoPriority, RegionStorage, SectionCache,
    StoreError,
};

/// Tag whose occupied POIs make a section a distance source by default.
pub const VILLAGE_TAG: &str = "village";

#[derive(Debug, thiserror::Error)]
pub enum PoiError {
    #[error("unknown POI type {0:?}")]
    UnknownType(PoiTypeId),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Notification raised by index mutations, drained by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoiEvent {
    Added { pos: BlockPos, kind: PoiTypeId },
    Removed { pos: BlockPos, kind: PoiTypeId },
    TicketAcquired { pos: BlockPos, kind: PoiTypeId, free: u32 },
    TicketReleased { pos: BlockPos, kind: PoiTypeId, free: u32 },
}

/// Decides whether a section is a distance-field source.
pub type SourcePredicate = Box<dyn Fn(&PoiSection, &PoiRegistry) -> bool + Send>;

fn village_source() -> SourcePredicate {
    Box::new(|section, registry| {
        section
            .all()
            .any(|r| r.is_occupied() && registry.has_tag(r.kind, VILLAGE_TAG))
    })
}

pub struct PoiIndex {
    pub(crate) registry: Arc<PoiRegistry>,
    pub(crate) cache: SectionCache<PoiSectionCodec>,
    pub(crate) distance: DistanceField,
    source: SourcePredicate,
    pub(crate) config: PoiConfig,
    flush: FlushConfig,
    events: Vec<PoiEvent>,
}

impl PoiIndex {
    pub fn new(store: Arc<dyn ColumnStore>, registry: Arc<PoiRegistry>, config: &StrataConfig) -> Self {
        let codec = PoiSectionCodec::new(Arc::clone(&registry));
        Self {
            cache: SectionCache::new(store, codec, config.world),
            distance: DistanceField::new(config.poi.max_depth),
            registry,
            source: village_source(),
            config: config.poi,
            flush: config.flush,
            events: Vec::new(),
        }
    }

    /// Index backed by region files in `folder`.
    pub fn open(folder: impl AsRef<Path>, registry: Arc<PoiRegistry>, config: &StrataConfig) -> Self {
        let storage = Arc::new(RegionStorage::new(folder, &config.region));
        Self::new(storage, registry, config)
    }

    pub fn with_source_predicate(
        mut self,
        predicate: impl Fn(&PoiSection, &PoiRegistry) -> bool + Send + 'static,
    ) -> Self {
        self.source = Box::new(predicate);
        self
    }

    pub fn with_background_io(mut self) -> Self {
        self.cache = self.cache.with_background_io();
        self
    }

    pub fn registry(&self) -> &Arc<PoiRegistry> {
        &self.registry
    }

    pub fn bounds(&self) -> WorldBounds {
        self.cache.bounds()
    }

    pub fn config(&self) -> &PoiConfig {
        &self.config
    }

    pub fn distance(&self) -> &DistanceField {
        &self.distance
    }

    /// Cached section without IO.
    pub fn section(&self, pos: SectionPos) -> Option<&PoiSection> {
        self.cache.get(pos.key())
    }

    /// Run the load hook for sections installed since the last call.
    pub(crate) fn process_loaded(&mut self) {
        for key in self.cache.take_loaded() {
            self.reevaluate(key);
        }
    }

    fn reevaluate(&mut self, key: CellKey) {
        let is_source = self
            .cache
            .get(key)
            .is_some_and(|s| (self.source)(s, &self.registry));
        self.distance.update(key, is_source);
    }

    pub(crate) fn touched(&mut self, key: CellKey) {
        self.cache.mark_dirty(key);
        self.reevaluate(key);
    }

    pub(crate) fn load_section(&mut self, key: CellKey) -> Option<&PoiSection> {
        self.cache.get_or_load(key)?;
        self.process_loaded();
        self.cache.get(key)
    }

    pub(crate) fn load_section_mut(&mut self, key: CellKey) -> Option<&mut PoiSection> {
        self.cache.get_or_load(key)?;
        self.process_loaded();
        self.cache.get_mut(key)
    }

    pub(crate) fn create_section(&mut self, key: CellKey) -> Result<&mut PoiSection, PoiError> {
        self.cache.get_or_create(key)?;
        self.process_loaded();
        Ok(self.cache.get_or_create(key)?)
    }

    /// Register a POI of `kind` at `pos`. An existing record at the same
    /// position is left untouched and logged.
    pub fn add(&mut self, pos: BlockPos, kind: PoiTypeId) -> Result<(), PoiError> {
        let max_tickets = self
            .registry
            .get(kind)
            .ok_or(PoiError::UnknownType(kind))?
            .max_tickets;
        let key = pos.section().key();
        let section = self.create_section(key)?;
        if !section.add(PoiRecord::new(pos, kind, max_tickets)) {
            tracing::error!(?pos, ?kind, "POI already registered at position");
            return Ok(());
        }
        tracing::debug!(?pos, ?kind, "added POI");
        self.touched(key);
        self.events.push(PoiEvent::Added { pos, kind });
        Ok(())
    }

    pub fn remove(&mut self, pos: BlockPos) -> Option<PoiRecord> {
        let key = pos.section().key();
        let removed = self.load_section_mut(key).and_then(|s| s.remove(pos));
        match removed {
            Some(record) => {
                tracing::debug!(?pos, kind = ?record.kind, "removed POI");
                self.touched(key);
                self.events.push(PoiEvent::Removed {
                    pos,
                    kind: record.kind,
                });
                Some(record)
            }
            None => {
                tracing::error!(?pos, "attempted to remove POI that does not exist");
                None
            }
        }
    }

    pub fn exists(&mut self, pos: BlockPos, type_pred: impl Fn(PoiTypeId) -> bool) -> bool {
        self.load_section(pos.section().key())
            .is_some_and(|s| s.exists(pos, type_pred))
    }

    pub fn type_at(&mut self, pos: BlockPos) -> Option<PoiTypeId> {
        self.load_section(pos.section().key())?.type_at(pos)
    }

    pub fn free_tickets(&mut self, pos: BlockPos) -> u32 {
        self.load_section(pos.section().key())
            .map_or(0, |s| s.free_tickets(pos))
    }

    /// Return a ticket to the POI at `pos`. Releasing at a position that
    /// was never registered, or beyond capacity, is logged and returns false.
    pub fn release(&mut self, pos: BlockPos) -> bool {
        let key = pos.section().key();
        let Some(record) = self.load_section_mut(key).and_then(|s| s.get_mut(pos)) else {
            tracing::error!(?pos, "POI never registered at position");
            return false;
        };
        if !record.release_ticket() {
            tracing::error!(?pos, kind = ?record.kind, "POI ticket released more often than acquired");
            return false;
        }
        let event = PoiEvent::TicketReleased {
            pos,
            kind: record.kind,
            free: record.free_tickets,
        };
        self.touched(key);
        self.events.push(event);
        true
    }

    /// Take one ticket from the record at `pos`, if it has one left.
    pub(crate) fn acquire_at(&mut self, pos: BlockPos) -> bool {
        let key = pos.section().key();
        let Some(record) = self.cache.get_mut(key).and_then(|s| s.get_mut(pos)) else {
            return false;
        };
        if !record.acquire_ticket() {
            return false;
        }
        let event = PoiEvent::TicketAcquired {
            pos,
            kind: record.kind,
            free: record.free_tickets,
        };
        self.touched(key);
        self.events.push(event);
        true
    }

    /// Distance, in sections, to the nearest source section. Pending
    /// updates are applied first.
    pub fn sections_to_village(&mut self, section: SectionPos) -> u8 {
        self.distance.run_pending();
        self.distance.level(section.key())
    }

    /// Per-tick maintenance: flush within the configured budget and apply
    /// pending distance updates.
    pub fn tick(&mut self) -> Result<FlushStats, PoiError> {
        self.tick_with_budget(FlushBudget::from_config(&self.flush))
    }

    pub fn tick_with_budget(&mut self, budget: FlushBudget) -> Result<FlushStats, PoiError> {
        let _span = tracing::info_span!("poi_tick").entered();
        let stats = self.cache.flush(budget)?;
        self.distance.run_pending();
        Ok(stats)
    }

    /// Integrate finished background IO. Returns the number of tasks applied.
    pub fn poll_io(&mut self) -> usize {
        let applied = self.cache.drain_io();
        self.process_loaded();
        applied
    }

    /// Block until background IO is idle, then integrate it.
    pub fn wait_io(&mut self) -> usize {
        let applied = self.cache.wait_io();
        self.process_loaded();
        applied
    }

    pub fn request_load(&mut self, chunk: ChunkPos, priority: IoPriority) -> Result<(), PoiError> {
        self.cache.request_load(chunk, priority)?;
        self.process_loaded();
        Ok(())
    }

    /// Save and evict a column. Its sections stop being distance sources.
    pub fn unload_column(&mut self, chunk: ChunkPos) -> Result<(), PoiError> {
        let keys: Vec<CellKey> = self.cache.column_sections(chunk).map(|(k, _)| k).collect();
        self.cache.unload_column(chunk)?;
        for key in keys {
            self.distance.update(key, false);
        }
        Ok(())
    }

    pub fn is_column_loaded(&self, chunk: ChunkPos) -> bool {
        self.cache.is_loaded(chunk)
    }

    /// Write every dirty section and sync the store. Shutdown point.
    pub fn flush_all(&mut self) -> Result<FlushStats, PoiError> {
        Ok(self.cache.flush_all()?)
    }

    pub fn dirty_columns(&self) -> usize {
        self.cache.dirty_columns()
    }

    /// Notifications since the last call, oldest first.
    pub fn drain_events(&mut self) -> Vec<PoiEvent> {
        std::mem::take(&mut self.events)
    }
}
