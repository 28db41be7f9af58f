//! Shared building blocks for the storage core: cell addressing, bounding
//! boxes, entity ids and configuration.
//!
//! # Invariants
//! - Packing a coordinate and unpacking it is lossless inside the legal range.
//! - Packed section keys order by x first, so one x (or one column) is a
//!   contiguous key range.

pub mod config;
pub mod pos;
pub mod types;

pub use config::{
    BackoffConfig, CompressionKind, ConfigError, EntityPadding, FlushConfig, PoiConfig,
    RegionConfig, StrataConfig, StreamConfig, WorldBounds,
};
pub use pos::{
    BlockPos, CellKey, ChunkKey, ChunkPos, RegionPos, SECTION_SIZE, SectionPos, block_to_section,
    pos_to_section,
};
pub use types::{Aabb, EntityId};

pub fn crate_info() -> &'static str {
    "strata-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
