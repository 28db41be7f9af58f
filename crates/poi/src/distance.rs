//! Incremental multi-source distance over the section grid.
//!
//! Each section's level is its hop count to the nearest source section,
//! capped at `max_depth`. Levels beyond the cap are not stored; an absent
//! entry reads as `max_depth + 1`.
//!
//! Updates are queued with [`DistanceField::update`] and applied in one
//! batch by [`DistanceField::run_pending`]: removed sources first
//! invalidate every level that may have been derived from them, then a
//! bucket-ordered relaxation restores levels from the remaining sources and
//! the edge of the invalidated area.

use std::collections::{HashMap, HashSet};
use strata_common::{CellKey, SectionPos};

/// Which sections count as adjacent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Neighborhood {
    /// All 26 sections sharing a face, edge or corner.
    Moore,
    /// Caller-supplied offsets. The graph is treated as given, so
    /// asymmetric offsets produce directed propagation.
    Custom(Vec<(i32, i32, i32)>),
}

impl Neighborhood {
    fn offsets(&self) -> Vec<(i32, i32, i32)> {
        match self {
            Neighborhood::Moore => {
                let mut out = Vec::with_capacity(26);
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            if (dx, dy, dz) != (0, 0, 0) {
                                out.push((dx, dy, dz));
                            }
                        }
                    }
                }
                out
            }
            Neighborhood::Custom(offsets) => offsets.clone(),
        }
    }
}

pub struct DistanceField {
    max_depth: u8,
    offsets: Vec<(i32, i32, i32)>,
    levels: HashMap<CellKey, u8>,
    sources: HashSet<CellKey>,
    pending: HashMap<CellKey, bool>,
}

impl DistanceField {
    pub fn new(max_depth: u8) -> Self {
        Self::with_neighborhood(max_depth, Neighborhood::Moore)
    }

    pub fn with_neighborhood(max_depth: u8, neighborhood: Neighborhood) -> Self {
        Self {
            max_depth,
            offsets: neighborhood.offsets(),
            levels: HashMap::new(),
            sources: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    /// Level meaning "no source within reach".
    pub fn unreached(&self) -> u8 {
        self.max_depth.saturating_add(1)
    }

    /// Current level, as of the last [`run_pending`](Self::run_pending).
    pub fn level(&self, key: CellKey) -> u8 {
        self.levels.get(&key).copied().unwrap_or(self.unreached())
    }

    /// 0 for a source section, unreached otherwise.
    pub fn source_level(&self, key: CellKey) -> u8 {
        if self.sources.contains(&key) {
            0
        } else {
            self.unreached()
        }
    }

    /// Record whether `key` is a source. Takes effect on the next
    /// [`run_pending`](Self::run_pending); the latest call per key wins.
    pub fn update(&mut self, key: CellKey, is_source: bool) {
        self.pending.insert(key, is_source);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of sections holding a stored level.
    pub fn stored_levels(&self) -> usize {
        self.levels.len()
    }

    fn neighbors(&self, key: CellKey) -> impl Iterator<Item = CellKey> + '_ {
        let pos = SectionPos::from(key);
        self.offsets
            .iter()
            .map(move |&(dx, dy, dz)| SectionPos::new(pos.x + dx, pos.y + dy, pos.z + dz).key())
    }

    fn set_level(&mut self, key: CellKey, level: u8) {
        if level > self.max_depth {
            self.levels.remove(&key);
        } else {
            self.levels.insert(key, level);
        }
    }

    /// Apply every queued update. Returns the number of sections whose
    /// level was lowered during relaxation.
    pub fn run_pending(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let _span = tracing::info_span!("distance_propagation", updates = self.pending.len()).entered();
        let pending = std::mem::take(&mut self.pending);

        let mut removed = Vec::new();
        let mut added = Vec::new();
        for (key, is_source) in pending {
            match (is_source, self.sources.contains(&key)) {
                (true, false) => {
                    self.sources.insert(key);
                    added.push(key);
                }
                (false, true) => {
                    self.sources.remove(&key);
                    removed.push(key);
                }
                _ => {}
            }
        }

        let mut buckets: Vec<Vec<CellKey>> = vec![Vec::new(); self.max_depth as usize + 1];

        // raise: drop every level that may hang off a removed source
        let mut invalidated = Vec::new();
        let mut stack: Vec<(CellKey, u8)> = Vec::new();
        for key in removed {
            if let Some(level) = self.levels.remove(&key) {
                stack.push((key, level));
                invalidated.push(key);
            }
        }
        while let Some((key, level)) = stack.pop() {
            let dependents: Vec<CellKey> = self
                .neighbors(key)
                .filter(|n| self.levels.get(n) == Some(&(level + 1)) && !self.sources.contains(n))
                .collect();
            for n in dependents {
                self.levels.remove(&n);
                stack.push((n, level + 1));
                invalidated.push(n);
            }
        }
        let mut seen = HashSet::new();
        for key in &invalidated {
            let edge: Vec<(CellKey, u8)> = self
                .neighbors(*key)
                .filter_map(|n| self.levels.get(&n).map(|l| (n, *l)))
                .collect();
            for (n, level) in edge {
                if seen.insert(n) {
                    buckets[level as usize].push(n);
                }
            }
        }

        for key in added {
            self.set_level(key, 0);
            buckets[0].push(key);
        }

        // lower: relax outwards in level order
        let mut lowered = 0;
        for level in 0..buckets.len() {
            while let Some(key) = buckets[level].pop() {
                if self.levels.get(&key) != Some(&(level as u8)) {
                    continue;
                }
                if level as u8 >= self.max_depth {
                    continue;
                }
                let next = level as u8 + 1;
                let improved: Vec<CellKey> = self
                    .neighbors(key)
                    .filter(|n| self.level(*n) > next)
                    .collect();
                for n in improved {
                    self.set_level(n, next);
                    buckets[next as usize].push(n);
                    lowered += 1;
                }
            }
        }
        tracing::trace!(invalidated = invalidated.len(), lowered, "distance field updated");
        lowered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: i32, y: i32, z: i32) -> CellKey {
        SectionPos::new(x, y, z).key()
    }

    #[test]
    fn source_is_level_zero() {
        let mut field = DistanceField::new(6);
        field.update(key(0, 0, 0), true);
        field.run_pending();
        assert_eq!(field.level(key(0, 0, 0)), 0);
        assert_eq!(field.source_level(key(0, 0, 0)), 0);
        assert_eq!(field.level(key(1, 1, 1)), 1);
        assert_eq!(field.level(key(6, -6, 0)), 6);
        assert_eq!(field.level(key(7, 0, 0)), 7);
        assert_eq!(field.source_level(key(1, 0, 0)), 7);
    }

    #[test]
    fn nearest_source_wins() {
        let mut field = DistanceField::new(6);
        let probe = key(0, 0, 0);
        field.update(key(3, 0, 0), true);
        field.update(key(0, 0, -6), true);
        field.run_pending();
        assert_eq!(field.level(probe), 3);
    }

    #[test]
    fn probe_level_tracks_nearest_remaining_source() {
        let mut field = DistanceField::new(6);
        let probe = key(0, 4, 0);
        let three_away = key(3, 4, 0);
        let five_away = key(0, 9, -5);
        field.update(probe, true);
        field.update(three_away, true);
        field.update(five_away, true);
        field.run_pending();
        assert_eq!(field.level(probe), 0);
        assert_eq!(field.level(three_away), 0);

        // the probe loses its POI: two sources left at distance 3 and 5
        field.update(probe, false);
        field.run_pending();
        assert_eq!(field.level(probe), 3);
        assert_eq!(field.source_level(probe), 7);

        field.update(three_away, false);
        field.run_pending();
        assert_eq!(field.level(probe), 5);
        assert_eq!(field.level(three_away), 5);
    }

    #[test]
    fn unreachable_reports_max_plus_one_and_is_not_stored() {
        let mut field = DistanceField::new(3);
        field.update(key(0, 0, 0), true);
        field.run_pending();
        assert_eq!(field.level(key(10, 0, 0)), 4);
        // 7x7x7 cube around the source
        assert_eq!(field.stored_levels(), 343);
    }

    #[test]
    fn removing_a_source_raises_levels() {
        let mut field = DistanceField::new(6);
        let near = key(2, 0, 0);
        let far = key(-4, 0, 0);
        let probe = key(0, 0, 0);
        field.update(near, true);
        field.update(far, true);
        field.run_pending();
        assert_eq!(field.level(probe), 2);

        field.update(near, false);
        field.run_pending();
        assert_eq!(field.level(probe), 4);
        assert_eq!(field.level(near), 6);

        field.update(far, false);
        field.run_pending();
        assert_eq!(field.level(probe), 7);
        assert_eq!(field.stored_levels(), 0);
    }

    #[test]
    fn matches_full_recompute() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut field = DistanceField::new(4);
        let mut sources = HashSet::new();
        for _ in 0..60 {
            let k = key(rng.gen_range(-5..5), rng.gen_range(-2..2), rng.gen_range(-5..5));
            let on = rng.gen_bool(0.6);
            field.update(k, on);
            if on {
                sources.insert(k);
            } else {
                sources.remove(&k);
            }
            field.run_pending();
        }
        for x in -8..8 {
            for y in -5..5 {
                for z in -8..8 {
                    let probe = key(x, y, z);
                    let expected = sources
                        .iter()
                        .map(|s| {
                            let s = SectionPos::from(*s);
                            (s.x - x).abs().max((s.y - y).abs()).max((s.z - z).abs())
                        })
                        .min()
                        .map_or(5, |d| d.min(5)) as u8;
                    assert_eq!(field.level(probe), expected, "at ({x}, {y}, {z})");
                }
            }
        }
    }

    #[test]
    fn run_pending_is_idempotent_when_empty() {
        let mut field = DistanceField::new(6);
        assert_eq!(field.run_pending(), 0);
        field.update(key(0, 0, 0), false);
        assert_eq!(field.run_pending(), 0);
        assert_eq!(field.stored_levels(), 0);
    }

    #[test]
    fn custom_neighborhood_limits_spread() {
        let mut field =
            DistanceField::with_neighborhood(6, Neighborhood::Custom(vec![(1, 0, 0), (-1, 0, 0)]));
        field.update(key(0, 0, 0), true);
        field.run_pending();
        assert_eq!(field.level(key(3, 0, 0)), 3);
        assert_eq!(field.level(key(0, 1, 0)), 7);
    }
}
