//! Per-section entity storage.
//!
//! A section owns the entities whose bottom-center position falls inside
//! it and keeps a counter per category, kept in step with membership.

use glam::DVec3;
use strata_common::{Aabb, EntityId};

/// Number of distinct entity categories a section keeps counters for.
pub const CATEGORY_COUNT: usize = 32;

/// What the spatial index needs to know about an entity.
pub trait EntityAccess {
    fn id(&self) -> EntityId;

    fn bounding_box(&self) -> Aabb;

    /// Bitmask of categories (bit `n` set = member of category `n`).
    fn categories(&self) -> u32;

    /// Point that decides the owning section: bottom center of the box.
    fn position(&self) -> DVec3 {
        let bbox = self.bounding_box();
        let center = bbox.center();
        DVec3::new(center.x, bbox.min.y, center.z)
    }
}

/// How far a column's entities are exposed to the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Visibility {
    #[default]
    Hidden,
    /// Loaded and tracked but not queryable.
    Tracked,
    Accessible,
}

impl Visibility {
    pub fn is_accessible(self) -> bool {
        self == Visibility::Accessible
    }

    pub fn is_tracked(self) -> bool {
        self != Visibility::Hidden
    }
}

/// Entities stored in one section, with per-category counts for cheap
/// rejection of typed queries.
#[derive(Debug, Clone)]
pub struct EntitySection<T> {
    entities: Vec<T>,
    counters: [u32; CATEGORY_COUNT],
    visibility: Visibility,
}

fn category_bits(mask: u32) -> impl Iterator<Item = usize> {
    (0..CATEGORY_COUNT).filter(move |bit| mask & (1 << bit) != 0)
}

impl<T: EntityAccess> EntitySection<T> {
    pub fn new(visibility: Visibility) -> Self {
        Self {
            entities: Vec::new(),
            counters: [0; CATEGORY_COUNT],
            visibility,
        }
    }

    pub fn add(&mut self, entity: T) {
        for bit in category_bits(entity.categories()) {
            self.counters[bit] += 1;
        }
        self.entities.push(entity);
    }

    pub fn remove(&mut self, id: EntityId) -> Option<T> {
        let index = self.entities.iter().position(|e| e.id() == id)?;
        let entity = self.entities.swap_remove(index);
        for bit in category_bits(entity.categories()) {
            self.counters[bit] = self.counters[bit].saturating_sub(1);
        }
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.entities.iter().find(|e| e.id() == id)
    }

    /// Mutable access for position updates. Category membership must not
    /// change through this; remove and re-add instead.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.entities.iter_mut().find(|e| e.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub(crate) fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;
    }

    /// Entities of `category` in this section. Zero for categories >= 32.
    pub fn category_count(&self, category: u8) -> u32 {
        self.counters.get(usize::from(category)).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entities.iter()
    }

    /// Visit entities whose box intersects `bbox`.
    pub fn entities_in(&self, bbox: &Aabb, mut f: impl FnMut(&T)) {
        for entity in &self.entities {
            if entity.bounding_box().intersects(bbox) {
                f(entity);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Mob {
        pub id: EntityId,
        pub bbox: Aabb,
        pub categories: u32,
    }

    impl Mob {
        pub(crate) fn at(x: f64, y: f64, z: f64, categories: u32) -> Self {
            Self {
                id: EntityId::new(),
                bbox: Aabb::new(DVec3::new(x - 0.3, y, z - 0.3), DVec3::new(x + 0.3, y + 1.8, z + 0.3)),
                categories,
            }
        }
    }

    impl EntityAccess for Mob {
        fn id(&self) -> EntityId {
            self.id
        }

        fn bounding_box(&self) -> Aabb {
            self.bbox
        }

        fn categories(&self) -> u32 {
            self.categories
        }
    }

    #[test]
    fn counters_follow_membership() {
        let mut section = EntitySection::new(Visibility::Accessible);
        let a = Mob::at(1.0, 1.0, 1.0, 0b101);
        let b = Mob::at(2.0, 1.0, 2.0, 0b001);
        let a_id = a.id;
        section.add(a);
        section.add(b);
        assert_eq!(section.category_count(0), 2);
        assert_eq!(section.category_count(2), 1);
        assert_eq!(section.category_count(1), 0);

        assert!(section.remove(a_id).is_some());
        assert!(section.remove(a_id).is_none());
        assert_eq!(section.category_count(0), 1);
        assert_eq!(section.category_count(2), 0);
        assert_eq!(section.category_count(40), 0);
    }

    #[test]
    fn position_is_bottom_center() {
        let mob = Mob::at(4.0, 10.0, -2.0, 0);
        let pos = mob.position();
        assert!((pos.x - 4.0).abs() < 1e-9);
        assert!((pos.y - 10.0).abs() < 1e-9);
        assert!((pos.z + 2.0).abs() < 1e-9);
    }

    #[test]
    fn box_filter() {
        let mut section = EntitySection::new(Visibility::Accessible);
        section.add(Mob::at(1.0, 0.0, 1.0, 1));
        section.add(Mob::at(10.0, 0.0, 10.0, 1));
        let mut hits = 0;
        section.entities_in(&Aabb::new(DVec3::ZERO, DVec3::splat(3.0)), |_| hits += 1);
        assert_eq!(hits, 1);
        assert!(Visibility::Tracked.is_tracked());
        assert!(!Visibility::Tracked.is_accessible());
    }
}
