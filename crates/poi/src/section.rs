//! Records of one section, keyed by position, and their stored form.

use crate::record::{Occupancy, PoiRecord};
use crate::registry::{PoiRegistry, PoiTypeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_common::{BlockPos, CellKey, SectionPos};
use strata_persist::SectionCodec;

/// POI records of one section. No two records share a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoiSection {
    records: BTreeMap<i64, PoiRecord>,
    /// False once loaded data is suspected stale; cleared by a rebuild
    /// from block data.
    valid: bool,
}

impl Default for PoiSection {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            valid: true,
        }
    }
}

impl PoiSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Returns false (and changes nothing) if the position
    /// is already taken.
    pub fn add(&mut self, record: PoiRecord) -> bool {
        match self.records.entry(record.pos.as_long()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub fn remove(&mut self, pos: BlockPos) -> Option<PoiRecord> {
        self.records.remove(&pos.as_long())
    }

    pub fn get(&self, pos: BlockPos) -> Option<&PoiRecord> {
        self.records.get(&pos.as_long())
    }

    pub fn get_mut(&mut self, pos: BlockPos) -> Option<&mut PoiRecord> {
        self.records.get_mut(&pos.as_long())
    }

    pub fn exists(&self, pos: BlockPos, type_pred: impl Fn(PoiTypeId) -> bool) -> bool {
        self.get(pos).is_some_and(|r| type_pred(r.kind))
    }

    pub fn type_at(&self, pos: BlockPos) -> Option<PoiTypeId> {
        self.get(pos).map(|r| r.kind)
    }

    pub fn free_tickets(&self, pos: BlockPos) -> u32 {
        self.get(pos).map_or(0, |r| r.free_tickets)
    }

    pub fn records<'a>(
        &'a self,
        type_pred: impl Fn(PoiTypeId) -> bool + 'a,
        occupancy: Occupancy,
    ) -> impl Iterator<Item = &'a PoiRecord> + 'a {
        self.records
            .values()
            .filter(move |r| type_pred(r.kind) && occupancy.matches(r))
    }

    pub fn all(&self) -> impl Iterator<Item = &PoiRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Rebuild an invalid section from `(pos, type)` pairs. Records that
    /// survive with the same type keep their ticket counts. Returns whether
    /// anything was rebuilt.
    pub fn refresh(
        &mut self,
        registry: &PoiRegistry,
        found: impl IntoIterator<Item = (BlockPos, PoiTypeId)>,
    ) -> bool {
        if self.valid {
            return false;
        }
        let previous = std::mem::take(&mut self.records);
        for (pos, kind) in found {
            let record = match previous.get(&pos.as_long()) {
                Some(old) if old.kind == kind => *old,
                _ => match registry.get(kind) {
                    Some(ty) => PoiRecord::new(pos, kind, ty.max_tickets),
                    None => continue,
                },
            };
            self.records.insert(pos.as_long(), record);
        }
        self.valid = true;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPoiRecord {
    pub pos: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub free_tickets: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPoiSection {
    #[serde(default)]
    pub valid: bool,
    pub records: Vec<StoredPoiRecord>,
}

/// Persists [`PoiSection`]s, naming types by registry name.
pub struct PoiSectionCodec {
    registry: Arc<PoiRegistry>,
}

impl PoiSectionCodec {
    pub fn new(registry: Arc<PoiRegistry>) -> Self {
        Self { registry }
    }
}

impl SectionCodec for PoiSectionCodec {
    type Section = PoiSection;
    type Stored = StoredPoiSection;

    fn create(&self, _key: CellKey) -> PoiSection {
        PoiSection::new()
    }

    fn encode(&self, _key: CellKey, section: &PoiSection) -> Option<StoredPoiSection> {
        // an empty section still has to remember it needs validation
        if section.is_empty() && section.is_valid() {
            return None;
        }
        let records = section
            .all()
            .filter_map(|r| {
                let name = self.registry.name(r.kind)?;
                Some(StoredPoiRecord {
                    pos: r.pos.as_long(),
                    kind: name.to_string(),
                    free_tickets: r.free_tickets,
                })
            })
            .collect();
        Some(StoredPoiSection {
            valid: section.is_valid(),
            records,
        })
    }

    fn decode(&self, key: CellKey, stored: StoredPoiSection) -> Result<PoiSection, String> {
        let section_pos = SectionPos::from(key);
        let mut section = PoiSection {
            records: BTreeMap::new(),
            valid: stored.valid,
        };
        for entry in stored.records {
            let pos = BlockPos::from_long(entry.pos);
            if pos.section() != section_pos {
                tracing::warn!(?pos, section = ?section_pos, "stored POI outside its section, skipping");
                continue;
            }
            let Some(kind) = self.registry.by_name(&entry.kind) else {
                tracing::warn!(?pos, kind = %entry.kind, "unknown POI type, skipping");
                continue;
            };
            let max_tickets = self.registry.get(kind).map_or(0, |t| t.max_tickets);
            let record = PoiRecord {
                pos,
                kind,
                max_tickets,
                free_tickets: entry.free_tickets.min(max_tickets),
            };
            if !section.add(record) {
                tracing::warn!(?pos, "duplicate stored POI, keeping the first");
            }
        }
        Ok(section)
    }
}
