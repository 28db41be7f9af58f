use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use strata_common::{ChunkPos, StreamConfig};

use crate::section::Visibility;

/// Tracks which columns are loaded around a viewer and what visibility
/// each of them has. Loads and unloads are spread over updates by budget.
pub struct ColumnTracker {
    pub config: StreamConfig,
    viewer: Option<ChunkPos>,
    tracked: HashSet<ChunkPos>,
    stats: StreamStats,
}

/// Per-update streaming statistics for instrumentation.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub columns_loaded: usize,
    pub columns_unloaded: usize,
    pub total_tracked: usize,
    pub update_time: Duration,
}

/// A column whose visibility changed during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityChange {
    pub chunk: ChunkPos,
    pub from: Visibility,
    pub to: Visibility,
}

impl ColumnTracker {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            viewer: None,
            tracked: HashSet::new(),
            stats: StreamStats::default(),
        }
    }

    /// Move the viewer and apply at most one budget of loads and unloads.
    /// Nearer columns load first, farther ones unload first. Returns every
    /// visibility change, ordered by chunk.
    pub fn update(&mut self, viewer: ChunkPos) -> Vec<VisibilityChange> {
        let _span = tracing::info_span!("stream_update").entered();
        let start = Instant::now();

        let before: HashMap<ChunkPos, Visibility> = self
            .tracked
            .iter()
            .map(|c| (*c, self.visibility(*c)))
            .collect();

        let desired = columns_in_radius(viewer, self.config.preload_radius);

        let mut to_load: Vec<ChunkPos> = desired
            .iter()
            .filter(|c| !self.tracked.contains(c))
            .copied()
            .collect();
        to_load.sort_by_key(|c| (c.chebyshev(viewer), c.x, c.z));
        to_load.truncate(self.config.load_budget);

        let mut to_unload: Vec<ChunkPos> = self
            .tracked
            .iter()
            .filter(|c| !desired.contains(c))
            .copied()
            .collect();
        to_unload.sort_by_key(|c| (std::cmp::Reverse(c.chebyshev(viewer)), c.x, c.z));
        to_unload.truncate(self.config.unload_budget);

        self.viewer = Some(viewer);
        for c in &to_load {
            tracing::debug!(?c, "tracking column");
            self.tracked.insert(*c);
        }
        for c in &to_unload {
            tracing::debug!(?c, "dropping column");
            self.tracked.remove(c);
        }

        let mut changes: Vec<VisibilityChange> = before
            .keys()
            .chain(to_load.iter())
            .map(|chunk| VisibilityChange {
                chunk: *chunk,
                from: before.get(chunk).copied().unwrap_or_default(),
                to: self.visibility(*chunk),
            })
            .filter(|change| change.from != change.to)
            .collect();
        changes.sort_by_key(|change| (change.chunk.x, change.chunk.z));

        self.stats = StreamStats {
            columns_loaded: to_load.len(),
            columns_unloaded: to_unload.len(),
            total_tracked: self.tracked.len(),
            update_time: start.elapsed(),
        };

        tracing::trace!(
            loaded = to_load.len(),
            unloaded = to_unload.len(),
            total = self.tracked.len(),
            "stream update complete"
        );

        changes
    }

    /// Current visibility of a column; also the initial visibility for new
    /// entity sections.
    pub fn visibility(&self, chunk: ChunkPos) -> Visibility {
        match self.viewer {
            Some(viewer) if self.tracked.contains(&chunk) => {
                if chunk.chebyshev(viewer) <= self.config.active_radius {
                    Visibility::Accessible
                } else {
                    Visibility::Tracked
                }
            }
            _ => Visibility::Hidden,
        }
    }

    pub fn tracked(&self) -> &HashSet<ChunkPos> {
        &self.tracked
    }

    pub fn is_tracked(&self, chunk: ChunkPos) -> bool {
        self.tracked.contains(&chunk)
    }

    /// Tracked columns within the active radius of the viewer.
    pub fn accessible(&self) -> HashSet<ChunkPos> {
        self.tracked
            .iter()
            .filter(|c| self.visibility(**c).is_accessible())
            .copied()
            .collect()
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}

/// Columns within a square radius of `center`.
fn columns_in_radius(center: ChunkPos, radius: i32) -> HashSet<ChunkPos> {
    let mut result = HashSet::new();
    for dx in -radius..=radius {
        for dz in -radius..=radius {
            result.insert(ChunkPos::new(center.x + dx, center.z + dz));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(active: i32, preload: i32, budget: usize) -> StreamConfig {
        StreamConfig {
            active_radius: active,
            preload_radius: preload,
            load_budget: budget,
            unload_budget: budget,
        }
    }

    #[test]
    fn loads_within_budget_nearest_first() {
        let mut tracker = ColumnTracker::new(config(1, 2, 3));
        let changes = tracker.update(ChunkPos::new(0, 0));
        assert_eq!(tracker.stats().columns_loaded, 3);
        assert_eq!(changes.len(), 3);
        assert!(tracker.is_tracked(ChunkPos::new(0, 0)));
        assert!(changes.iter().all(|c| c.from == Visibility::Hidden && c.to == Visibility::Accessible));
    }

    #[test]
    fn converges_to_full_square() {
        let mut tracker = ColumnTracker::new(config(1, 2, 4));
        for _ in 0..10 {
            tracker.update(ChunkPos::new(0, 0));
        }
        assert_eq!(tracker.tracked().len(), 25);
        assert_eq!(tracker.accessible().len(), 9);
        assert_eq!(tracker.visibility(ChunkPos::new(2, 2)), Visibility::Tracked);
        assert_eq!(tracker.visibility(ChunkPos::new(3, 0)), Visibility::Hidden);
    }

    #[test]
    fn moving_viewer_demotes_and_unloads() {
        let mut tracker = ColumnTracker::new(config(0, 1, 100));
        tracker.update(ChunkPos::new(0, 0));
        assert_eq!(tracker.tracked().len(), 9);

        let changes = tracker.update(ChunkPos::new(1, 0));
        let old_center = changes.iter().find(|c| c.chunk == ChunkPos::new(0, 0)).unwrap();
        assert_eq!((old_center.from, old_center.to), (Visibility::Accessible, Visibility::Tracked));
        let dropped = changes.iter().find(|c| c.chunk == ChunkPos::new(-1, 0)).unwrap();
        assert_eq!(dropped.to, Visibility::Hidden);
        assert_eq!(tracker.stats().columns_unloaded, 3);
        assert_eq!(tracker.tracked().len(), 9);
    }

    #[test]
    fn stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.active_radius, 2);
        assert_eq!(config.preload_radius, 4);
        assert_eq!(config.load_budget, 4);
        assert_eq!(config.unload_budget, 4);
    }
}
