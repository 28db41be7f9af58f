//! Rebuilding POI sections from block data.

use crate::index::{PoiError, PoiIndex};
use crate::registry::{BlockStateId, PoiTypeId};
use strata_common::{BlockPos, SECTION_SIZE, SectionPos};

/// Block data of one loaded section, supplied by the world layer.
pub trait SectionBlocks {
    /// State at section-local coordinates (each `0..16`).
    fn block_state(&self, x: i32, y: i32, z: i32) -> BlockStateId;

    /// Cheap palette test: false only if no state in the section can match.
    fn maybe_has(&self, pred: &dyn Fn(BlockStateId) -> bool) -> bool;
}

impl PoiIndex {
    fn scan_blocks(&self, section: SectionPos, blocks: &dyn SectionBlocks) -> Vec<(BlockPos, PoiTypeId)> {
        let base = section.min_block();
        section
            .blocks()
            .filter_map(|pos| {
                let state = blocks.block_state(pos.x - base.x, pos.y - base.y, pos.z - base.z);
                self.registry.for_state(state).map(|kind| (pos, kind))
            })
            .collect()
    }

    /// Bring a section's POIs in line with its blocks. A stored section
    /// marked invalid is rebuilt; an absent section is created only when
    /// the blocks may hold POI states.
    pub fn check_consistency_with_blocks(
        &mut self,
        section: SectionPos,
        blocks: &dyn SectionBlocks,
    ) -> Result<(), PoiError> {
        let registry = std::sync::Arc::clone(&self.registry);
        let may_have = blocks.maybe_has(&|state| registry.is_poi_state(state));
        let key = section.key();

        if self.load_section(key).is_some() {
            let found = if may_have {
                self.scan_blocks(section, blocks)
            } else {
                Vec::new()
            };
            let rebuilt = self
                .cache
                .get_mut(key)
                .is_some_and(|s| s.refresh(&registry, found));
            if rebuilt {
                tracing::debug!(?section, "rebuilt POI section from blocks");
                self.touched(key);
            }
            return Ok(());
        }

        if may_have {
            let found = self.scan_blocks(section, blocks);
            let poi = self.create_section(key)?;
            for (pos, kind) in found {
                let max_tickets = registry.get(kind).map_or(0, |t| t.max_tickets);
                poi.add(crate::record::PoiRecord::new(pos, kind, max_tickets));
            }
            tracing::debug!(?section, "created POI section from blocks");
            self.touched(key);
        }
        Ok(())
    }
}

/// Dense 16x16x16 block grid, mostly for tests and tools.
#[derive(Debug, Clone)]
pub struct BlockGrid {
    states: Vec<BlockStateId>,
}

impl BlockGrid {
    pub fn filled(state: BlockStateId) -> Self {
        Self {
            states: vec![state; (SECTION_SIZE * SECTION_SIZE * SECTION_SIZE) as usize],
        }
    }

    fn index(x: i32, y: i32, z: i32) -> usize {
        ((y * SECTION_SIZE + z) * SECTION_SIZE + x) as usize
    }

    pub fn set(&mut self, x: i32, y: i32, z: i32, state: BlockStateId) {
        self.states[Self::index(x, y, z)] = state;
    }
}

impl SectionBlocks for BlockGrid {
    fn block_state(&self, x: i32, y: i32, z: i32) -> BlockStateId {
        self.states[Self::index(x, y, z)]
    }

    fn maybe_has(&self, pred: &dyn Fn(BlockStateId) -> bool) -> bool {
        self.states.iter().any(|s| pred(*s))
    }
}
