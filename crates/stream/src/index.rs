//! Section-bucketed entity index.
//!
//! Sections are keyed by packed [`CellKey`] and their ids kept in an ordered
//! set, so a box query walks one contiguous key range per x coordinate
//! instead of probing every section in the box.

use crate::section::{EntityAccess, EntitySection, Visibility};
use std::collections::{BTreeSet, HashMap, HashSet};
use strata_common::{Aabb, CellKey, ChunkPos, EntityId, EntityPadding, SectionPos, pos_to_section};

/// Supplies the visibility a newly created section starts with.
pub type VisibilitySource = Box<dyn Fn(ChunkPos) -> Visibility + Send>;

pub struct EntitySpatialIndex<T> {
    sections: HashMap<CellKey, EntitySection<T>>,
    section_ids: BTreeSet<CellKey>,
    initial_visibility: VisibilitySource,
    padding: EntityPadding,
}

impl<T: EntityAccess> EntitySpatialIndex<T> {
    pub fn new(
        padding: EntityPadding,
        initial_visibility: impl Fn(ChunkPos) -> Visibility + Send + 'static,
    ) -> Self {
        Self {
            sections: HashMap::new(),
            section_ids: BTreeSet::new(),
            initial_visibility: Box::new(initial_visibility),
            padding,
        }
    }

    pub fn get_or_create_section(&mut self, key: CellKey) -> &mut EntitySection<T> {
        let initial = &self.initial_visibility;
        let ids = &mut self.section_ids;
        self.sections.entry(key).or_insert_with(|| {
            ids.insert(key);
            EntitySection::new(initial(key.chunk()))
        })
    }

    pub fn get_section(&self, key: CellKey) -> Option<&EntitySection<T>> {
        self.sections.get(&key)
    }

    pub fn get_section_mut(&mut self, key: CellKey) -> Option<&mut EntitySection<T>> {
        self.sections.get_mut(&key)
    }

    /// Drop a section and everything in it.
    pub fn remove(&mut self, key: CellKey) -> Option<EntitySection<T>> {
        self.section_ids.remove(&key);
        self.sections.remove(&key)
    }

    /// Section that owns `entity` by its position.
    pub fn section_key_for(entity: &T) -> CellKey {
        let pos = entity.position();
        SectionPos::new(pos_to_section(pos.x), pos_to_section(pos.y), pos_to_section(pos.z)).key()
    }

    /// Insert into the owning section. Returns that section's key.
    pub fn add_entity(&mut self, entity: T) -> CellKey {
        let key = Self::section_key_for(&entity);
        self.get_or_create_section(key).add(entity);
        key
    }

    /// Remove an entity from `key`; the section goes too once empty.
    pub fn remove_entity(&mut self, key: CellKey, id: EntityId) -> Option<T> {
        let section = self.sections.get_mut(&key)?;
        let entity = section.remove(id);
        if section.is_empty() {
            self.remove(key);
        }
        entity
    }

    /// Move an entity whose position changed into its new section. Returns
    /// the key it lives in afterwards.
    pub fn relocate(&mut self, key: CellKey, id: EntityId) -> Option<CellKey> {
        let current = Self::section_key_for(self.sections.get(&key)?.get(id)?);
        if current == key {
            return Some(key);
        }
        let entity = self.remove_entity(key, id)?;
        tracing::trace!(?id, from = ?key, to = ?current, "entity changed section");
        Some(self.add_entity(entity))
    }

    /// Visit every existing, non-empty, accessible section overlapping the
    /// padded box.
    pub fn for_each_accessible_non_empty_section(
        &self,
        bbox: &Aabb,
        mut f: impl FnMut(CellKey, &EntitySection<T>),
    ) {
        let pad = self.padding;
        let min_x = pos_to_section(bbox.min.x - pad.horizontal);
        let min_y = pos_to_section(bbox.min.y - pad.below);
        let min_z = pos_to_section(bbox.min.z - pad.horizontal);
        let max_x = pos_to_section(bbox.max.x + pad.horizontal);
        let max_y = pos_to_section(bbox.max.y + pad.above);
        let max_z = pos_to_section(bbox.max.z + pad.horizontal);

        for x in min_x..=max_x {
            let range = CellKey::x_range_start(x)..=CellKey::x_range_end(x);
            for key in self.section_ids.range(range) {
                let (y, z) = (key.y(), key.z());
                if y < min_y || y > max_y || z < min_z || z > max_z {
                    continue;
                }
                if let Some(section) = self.sections.get(key) {
                    if !section.is_empty() && section.visibility().is_accessible() {
                        f(*key, section);
                    }
                }
            }
        }
    }

    /// Visit every accessible entity whose box intersects `bbox`.
    pub fn entities(&self, bbox: &Aabb, mut f: impl FnMut(&T)) {
        self.for_each_accessible_non_empty_section(bbox, |_, section| {
            section.entities_in(bbox, &mut f);
        });
    }

    /// Like [`entities`](Self::entities), restricted to one category.
    /// Sections without members of that category are skipped unvisited.
    pub fn query(&self, bbox: &Aabb, category: u8, mut f: impl FnMut(&T)) {
        let Some(bit) = 1u32.checked_shl(u32::from(category)) else {
            return;
        };
        self.for_each_accessible_non_empty_section(bbox, |_, section| {
            if section.category_count(category) == 0 {
                return;
            }
            section.entities_in(bbox, |e| {
                if e.categories() & bit != 0 {
                    f(e);
                }
            });
        });
    }

    /// Existing section keys of one column, in key order.
    pub fn existing_sections_in_chunk(&self, chunk: ChunkPos) -> impl Iterator<Item = CellKey> + '_ {
        let (lo, hi) = CellKey::column_range(chunk);
        self.section_ids.range(lo..=hi).copied()
    }

    pub fn chunks_with_sections(&self) -> HashSet<ChunkPos> {
        self.section_ids.iter().map(|key| key.chunk()).collect()
    }

    /// Apply a column's new visibility to all of its sections.
    pub fn update_chunk_status(&mut self, chunk: ChunkPos, visibility: Visibility) {
        let keys: Vec<CellKey> = self.existing_sections_in_chunk(chunk).collect();
        for key in &keys {
            if let Some(section) = self.sections.get_mut(key) {
                section.set_visibility(visibility);
            }
        }
        tracing::debug!(?chunk, ?visibility, sections = keys.len(), "column visibility changed");
    }

    /// Number of sections.
    pub fn count(&self) -> usize {
        self.section_ids.len()
    }
}
