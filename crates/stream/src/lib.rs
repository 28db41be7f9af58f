//! Streaming: section-bucketed entity index and column visibility.
//!
//! # Invariants
//! - Queries only see entities in existing, non-empty, ACCESSIBLE sections.
//! - A query returns exactly the entities whose box intersects the query
//!   box, whichever section stores them.
//! - Per-category counters always equal the section's membership.

mod index;
mod section;
mod tracker;

pub use index::{EntitySpatialIndex, VisibilitySource};
pub use section::{CATEGORY_COUNT, EntityAccess, EntitySection, Visibility};
pub use tracker::{ColumnTracker, StreamStats, VisibilityChange};

pub fn crate_info() -> &'static str {
    "strata-stream v0.1.0"
}
