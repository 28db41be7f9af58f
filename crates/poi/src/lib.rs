//! Point-of-interest indexing.
//!
//! POI records live in per-section containers persisted through
//! [`strata_persist::SectionCache`]. On top of that sit nearest-first
//! searches, ticket bookkeeping, a section-level distance field toward
//! "source" sections and a per-caller retry backoff.
//!
//! # Invariants
//! - At most one record per block position.
//! - `0 <= free_tickets <= max_tickets` for every record.
//! - Distance levels never exceed `max_depth + 1`; unreached sections are
//!   not stored.

pub mod backoff;
pub mod consistency;
pub mod distance;
pub mod index;
pub mod record;
pub mod registry;
pub mod search;
pub mod section;
pub mod seeker;

pub use backoff::{BackoffCache, JitteredLinearRetry};
pub use consistency::{BlockGrid, SectionBlocks};
pub use distance::{DistanceField, Neighborhood};
pub use index::{PoiError, PoiEvent, PoiIndex, SourcePredicate, VILLAGE_TAG};
pub use record::{Occupancy, PoiRecord};
pub use registry::{BlockStateId, PoiRegistry, PoiRegistryBuilder, PoiType, PoiTypeId, RegistryError};
pub use section::{PoiSection, PoiSectionCodec, StoredPoiRecord, StoredPoiSection};
pub use seeker::{PoiSeeker, SeekOutcome};

pub fn crate_info() -> &'static str {
    "strata-poi v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_common::{BlockPos, StrataConfig};

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("poi"));
    }

    #[test]
    fn index_survives_reopen_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = index::tests::registry();
        let config = StrataConfig::default();
        let bell = registry.by_name("bell").unwrap();
        let pos = BlockPos::new(-40, 70, 300);
        {
            let mut poi = PoiIndex::open(tmp.path(), Arc::clone(&registry), &config);
            poi.add(pos, bell).unwrap();
            assert!(poi.take(|k| k == bell, |_, _| true, pos, 4).is_some());
            poi.flush_all().unwrap();
        }

        let mut poi = PoiIndex::open(tmp.path(), registry, &config);
        assert_eq!(poi.type_at(pos), Some(bell));
        assert_eq!(poi.free_tickets(pos), 31);
        assert_eq!(poi.sections_to_village(pos.section()), 0);
    }
}
