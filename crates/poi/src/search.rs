//! Spatial queries over the POI index.
//!
//! Nearest-first searches walk chunks in Chebyshev rings around the origin
//! and stop once the next ring cannot hold anything closer than what was
//! already accepted. Caller predicates see candidates closest first. Range and square queries scan the covering chunk square.

use crate::index::{PoiError, PoiIndex};
use crate::record::{Occupancy, PoiRecord};
use crate::registry::PoiTypeId;
use rand::Rng;
use rand::seq::SliceRandom;
use strata_common::{BlockPos, ChunkPos, SectionPos, block_to_section};

/// Ordering of search results: distance, then lower y, then x, then z.
fn sort_key(record: &PoiRecord, origin: BlockPos) -> (i64, i32, i32, i32) {
    (
        record.pos.dist_sqr(origin),
        record.pos.y,
        record.pos.x,
        record.pos.z,
    )
}

/// Widest horizontal span a packed block position can cover.
const MAX_HORIZONTAL_REACH: i32 = 1 << 26;

/// Offer pending records closer than `bound` to `accept`, in result order.
fn settle(
    pending: &mut Vec<PoiRecord>,
    accepted: &mut Vec<PoiRecord>,
    origin: BlockPos,
    bound: i64,
    limit: usize,
    accept: &mut dyn FnMut(&PoiRecord) -> bool,
) {
    pending.sort_by_key(|r| sort_key(r, origin));
    let ready = pending.partition_point(|r| r.pos.dist_sqr(origin) < bound);
    for record in pending.drain(..ready) {
        if accepted.len() >= limit {
            break;
        }
        if accept(&record) {
            accepted.push(record);
        }
    }
}

impl PoiIndex {
    /// Section y range of `chunk` worth scanning for a query at `origin`.
    fn section_span(&self, origin: BlockPos, radius: i32) -> std::ops::Range<i32> {
        let bounds = self.bounds();
        let low = block_to_section(origin.y.saturating_sub(radius)).max(bounds.min_section);
        let high = (block_to_section(origin.y.saturating_add(radius)) + 1).min(bounds.max_section);
        low..high.max(low)
    }

    /// Records of `chunk` passing the type and occupancy filters, loading
    /// sections as needed.
    fn chunk_records(
        &mut self,
        chunk: ChunkPos,
        ys: std::ops::Range<i32>,
        type_pred: &dyn Fn(PoiTypeId) -> bool,
        occupancy: Occupancy,
        out: &mut Vec<PoiRecord>,
    ) {
        for y in ys {
            if let Some(section) = self.load_section(SectionPos::of(chunk, y).key()) {
                out.extend(section.records(type_pred, occupancy).copied());
            }
        }
    }

    /// Walk chunk rings outward from `origin`, handing records to `accept`
    /// in result order. A record is only offered once no unscanned chunk can
    /// hold anything that sorts before it. Stops after `limit` acceptances.
    fn walk_nearest(
        &mut self,
        type_pred: &dyn Fn(PoiTypeId) -> bool,
        accept: &mut dyn FnMut(&PoiRecord) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
        limit: usize,
    ) -> Vec<PoiRecord> {
        if limit == 0 || radius < 0 {
            return Vec::new();
        }
        let radius = radius.min(MAX_HORIZONTAL_REACH);
        let radius_sq = i64::from(radius) * i64::from(radius);
        let center = origin.chunk();
        let max_ring = (radius + 15) / 16 + 1;
        let ys = self.section_span(origin, radius);
        let mut pending: Vec<PoiRecord> = Vec::new();
        let mut accepted = Vec::new();
        let mut scratch = Vec::new();

        for ring in 0..=max_ring {
            let chunks = center.ring(ring);
            let ring_min = chunks
                .iter()
                .map(|c| c.min_dist_sqr_xz(origin))
                .min()
                .unwrap_or(i64::MAX);
            settle(&mut pending, &mut accepted, origin, ring_min, limit, accept);
            if accepted.len() >= limit || ring_min > radius_sq {
                break;
            }
            for chunk in chunks {
                if chunk.min_dist_sqr_xz(origin) > radius_sq {
                    continue;
                }
                scratch.clear();
                self.chunk_records(chunk, ys.clone(), type_pred, occupancy, &mut scratch);
                pending.extend(scratch.drain(..).filter(|r| r.pos.dist_sqr(origin) <= radius_sq));
            }
        }
        settle(&mut pending, &mut accepted, origin, i64::MAX, limit, accept);
        accepted
    }

    /// Up to `limit` nearest records within `radius` (euclidean, blocks)
    /// matching every filter, closest first.
    pub fn find_nearest_records(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        mut pos_pred: impl FnMut(BlockPos) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
        limit: usize,
    ) -> Vec<PoiRecord> {
        self.walk_nearest(&type_pred, &mut |r: &PoiRecord| pos_pred(r.pos), origin, radius, occupancy, limit)
    }

    /// Nearest matching position within `radius`.
    pub fn find_nearest(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        pos_pred: impl FnMut(BlockPos) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> Option<BlockPos> {
        self.find_nearest_records(type_pred, pos_pred, origin, radius, occupancy, 1)
            .first()
            .map(|r| r.pos)
    }

    /// Take a ticket from the nearest record with space that passes
    /// `tie_pred`. A record without free tickets is never chosen.
    pub fn take(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        tie_pred: impl Fn(PoiTypeId, BlockPos) -> bool,
        origin: BlockPos,
        radius: i32,
    ) -> Option<BlockPos> {
        let winner = self
            .walk_nearest(
                &type_pred,
                &mut |r: &PoiRecord| tie_pred(r.kind, r.pos),
                origin,
                radius,
                Occupancy::HasSpace,
                1,
            )
            .pop()?;
        if !self.acquire_at(winner.pos) {
            return None;
        }
        tracing::debug!(pos = ?winner.pos, kind = ?winner.kind, "took POI ticket");
        Some(winner.pos)
    }

    /// Matching records in one column, bottom to top.
    pub fn get_in_chunk(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        chunk: ChunkPos,
        occupancy: Occupancy,
    ) -> Vec<PoiRecord> {
        let mut out = Vec::new();
        let ys = self.bounds().sections();
        self.chunk_records(chunk, ys, &type_pred, occupancy, &mut out);
        out
    }

    /// Matching records whose x and z are within `radius` of `origin`.
    pub fn get_in_square(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> Vec<PoiRecord> {
        let reach = radius.div_euclid(16) + 1;
        let center = origin.chunk();
        let ys = self.bounds().sections();
        let mut out = Vec::new();
        for dx in -reach..=reach {
            for dz in -reach..=reach {
                let chunk = ChunkPos::new(center.x + dx, center.z + dz);
                self.chunk_records(chunk, ys.clone(), &type_pred, occupancy, &mut out);
            }
        }
        out.retain(|r| (r.pos.x - origin.x).abs() <= radius && (r.pos.z - origin.z).abs() <= radius);
        out
    }

    /// Matching records within euclidean `radius` of `origin`, unordered.
    pub fn get_in_range(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> Vec<PoiRecord> {
        let radius_sq = i64::from(radius) * i64::from(radius);
        let mut out = self.get_in_square(type_pred, origin, radius, occupancy);
        out.retain(|r| r.pos.dist_sqr(origin) <= radius_sq);
        out
    }

    pub fn count_in_range(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> usize {
        self.get_in_range(type_pred, origin, radius, occupancy).len()
    }

    pub fn find_all(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        pos_pred: impl Fn(BlockPos) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> Vec<BlockPos> {
        self.get_in_range(type_pred, origin, radius, occupancy)
            .into_iter()
            .map(|r| r.pos)
            .filter(|p| pos_pred(*p))
            .collect()
    }

    pub fn find_all_closest_first(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        pos_pred: impl Fn(BlockPos) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> Vec<(PoiTypeId, BlockPos)> {
        let mut records = self.get_in_range(type_pred, origin, radius, occupancy);
        records.retain(|r| pos_pred(r.pos));
        records.sort_by_key(|r| sort_key(r, origin));
        records.into_iter().map(|r| (r.kind, r.pos)).collect()
    }

    pub fn find_closest_with_type(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        origin: BlockPos,
        radius: i32,
        occupancy: Occupancy,
    ) -> Option<(PoiTypeId, BlockPos)> {
        self.find_nearest_records(type_pred, |_| true, origin, radius, occupancy, 1)
            .first()
            .map(|r| (r.kind, r.pos))
    }

    /// A random matching position within `radius`.
    pub fn get_random<R: Rng + ?Sized>(
        &mut self,
        type_pred: impl Fn(PoiTypeId) -> bool,
        pos_pred: impl Fn(BlockPos) -> bool,
        occupancy: Occupancy,
        origin: BlockPos,
        radius: i32,
        rng: &mut R,
    ) -> Option<BlockPos> {
        let mut records = self.get_in_range(type_pred, origin, radius, occupancy);
        // deterministic order before shuffling, for reproducible seeds
        records.sort_by_key(|r| sort_key(r, origin));
        records.shuffle(rng);
        records.into_iter().map(|r| r.pos).find(|p| pos_pred(*p))
    }

    /// Chunks around `origin` holding sections that are absent or marked
    /// invalid. The caller loads their block data and calls
    /// [`check_consistency_with_blocks`](PoiIndex::check_consistency_with_blocks).
    pub fn chunks_needing_validation(&mut self, origin: BlockPos, radius: i32) -> Vec<ChunkPos> {
        let reach = radius.div_euclid(16);
        let center = origin.chunk();
        let ys = self.bounds().sections();
        let mut out = Vec::new();
        for dx in -reach..=reach {
            for dz in -reach..=reach {
                let chunk = ChunkPos::new(center.x + dx, center.z + dz);
                let stale = ys.clone().any(|y| {
                    !self
                        .load_section(SectionPos::of(chunk, y).key())
                        .is_some_and(|s| s.is_valid())
                });
                if stale {
                    out.push(chunk);
                }
            }
        }
        out
    }

    /// Load the column holding `pos` if it is not resident.
    pub fn ensure_section(&mut self, pos: BlockPos) -> Result<(), PoiError> {
        self.cache.load_column(pos.chunk())?;
        self.process_loaded();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::index::tests::index;
    use crate::record::Occupancy;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use strata_common::{BlockPos, ChunkPos};
    use strata_persist::MemoryStore;

    #[test]
    fn nearest_within_radius() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bell = poi.registry().by_name("bell").unwrap();
        poi.add(BlockPos::new(0, 64, 0), bell).unwrap();
        let found = poi.find_nearest(|k| k == bell, |_| true, BlockPos::new(0, 64, 5), 16, Occupancy::Any);
        assert_eq!(found, Some(BlockPos::new(0, 64, 0)));
        let too_far = poi.find_nearest(|k| k == bell, |_| true, BlockPos::new(0, 64, 20), 16, Occupancy::Any);
        assert!(too_far.is_none());
    }

    #[test]
    fn ties_break_on_lower_y_then_position() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        let origin = BlockPos::new(0, 64, 0);
        let up = BlockPos::new(0, 67, 0);
        let down = BlockPos::new(0, 61, 0);
        let west = BlockPos::new(-3, 64, 0);
        let east = BlockPos::new(3, 64, 0);
        for pos in [up, east, down, west] {
            poi.add(pos, bed).unwrap();
        }
        let order: Vec<BlockPos> = poi
            .find_nearest_records(|_| true, |_| true, origin, 10, Occupancy::Any, 4)
            .into_iter()
            .map(|r| r.pos)
            .collect();
        assert_eq!(order, vec![down, west, east, up]);
    }

    #[test]
    fn ring_search_prefers_closer_chunk_across_rings() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        // origin near the east edge of chunk 0; the neighbour chunk is closer
        let origin = BlockPos::new(15, 64, 8);
        let same_chunk = BlockPos::new(0, 64, 8);
        let next_chunk = BlockPos::new(17, 64, 8);
        poi.add(same_chunk, bed).unwrap();
        poi.add(next_chunk, bed).unwrap();
        let found = poi.find_nearest(|_| true, |_| true, origin, 48, Occupancy::Any);
        assert_eq!(found, Some(next_chunk));
    }

    #[test]
    fn take_never_goes_negative() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        let pos = BlockPos::new(8, 64, 8);
        poi.add(pos, bed).unwrap();
        assert_eq!(poi.take(|k| k == bed, |_, _| true, pos, 4), Some(pos));
        assert_eq!(poi.free_tickets(pos), 0);
        poi.drain_events();
        assert_eq!(poi.take(|k| k == bed, |_, _| true, pos, 4), None);
        assert_eq!(poi.free_tickets(pos), 0);
        assert!(poi.drain_events().is_empty());
        assert_eq!(
            poi.find_nearest(|_| true, |_| true, pos, 4, Occupancy::IsOccupied),
            Some(pos)
        );
    }

    #[test]
    fn take_honours_tie_predicate() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        let near = BlockPos::new(1, 64, 0);
        let far = BlockPos::new(5, 64, 0);
        poi.add(near, bed).unwrap();
        poi.add(far, bed).unwrap();
        let taken = poi.take(|_| true, |_, p| p == far, BlockPos::new(0, 64, 0), 10);
        assert_eq!(taken, Some(far));
        assert_eq!(poi.free_tickets(near), 1);
    }

    #[test]
    fn take_offers_candidates_closest_first_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        let near = BlockPos::new(1, 64, 0);
        let mid = BlockPos::new(2, 64, 0);
        let far = BlockPos::new(40, 64, 0);
        for pos in [far, mid, near] {
            poi.add(pos, bed).unwrap();
        }
        let seen = std::cell::RefCell::new(Vec::new());
        let taken = poi.take(
            |_| true,
            |_, p| {
                seen.borrow_mut().push(p);
                p == mid
            },
            BlockPos::new(0, 64, 0),
            64,
        );
        assert_eq!(taken, Some(mid));
        assert_eq!(seen.into_inner(), vec![near, mid]);
    }

    #[test]
    fn huge_radius_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        let origin = BlockPos::new(0, 64, 0);
        let pos = BlockPos::new(3, 64, 0);
        poi.add(pos, bed).unwrap();
        assert_eq!(
            poi.find_nearest(|_| true, |_| true, origin, i32::MAX, Occupancy::Any),
            Some(pos)
        );
        assert_eq!(poi.take(|_| true, |_, _| true, origin, i32::MAX), Some(pos));
        assert_eq!(poi.free_tickets(pos), 0);
    }

    #[test]
    fn range_queries_agree() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        let bell = poi.registry().by_name("bell").unwrap();
        let origin = BlockPos::new(0, 64, 0);
        poi.add(BlockPos::new(10, 64, 0), bed).unwrap();
        poi.add(BlockPos::new(-20, 64, 0), bell).unwrap();
        // inside the square, outside the circle
        poi.add(BlockPos::new(20, 64, 20), bed).unwrap();
        poi.add(BlockPos::new(60, 64, 0), bed).unwrap();

        assert_eq!(poi.get_in_square(|_| true, origin, 24, Occupancy::Any).len(), 3);
        assert_eq!(poi.count_in_range(|_| true, origin, 24, Occupancy::Any), 2);
        assert_eq!(poi.count_in_range(|k| k == bed, origin, 24, Occupancy::Any), 1);
        let closest = poi.find_all_closest_first(|_| true, |_| true, origin, 24, Occupancy::Any);
        assert_eq!(
            closest,
            vec![(bed, BlockPos::new(10, 64, 0)), (bell, BlockPos::new(-20, 64, 0))]
        );
        assert_eq!(
            poi.find_closest_with_type(|_| true, origin, 24, Occupancy::Any),
            Some((bed, BlockPos::new(10, 64, 0)))
        );
        let all = poi.find_all(|_| true, |p| p.x < 0, origin, 24, Occupancy::Any);
        assert_eq!(all, vec![BlockPos::new(-20, 64, 0)]);
        assert_eq!(poi.get_in_chunk(|_| true, ChunkPos::new(0, 0), Occupancy::Any).len(), 1);
    }

    #[test]
    fn random_pick_respects_filters() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        for x in 0..8 {
            poi.add(BlockPos::new(x, 64, 0), bed).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let pick = poi
                .get_random(|_| true, |p| p.x % 2 == 0, Occupancy::Any, BlockPos::new(0, 64, 0), 16, &mut rng)
                .unwrap();
            assert_eq!(pick.x % 2, 0);
        }
        assert!(poi
            .get_random(|_| true, |p| p.x > 100, Occupancy::Any, BlockPos::new(0, 64, 0), 16, &mut rng)
            .is_none());
    }

    #[test]
    fn vertical_bounds_limit_scan() {
        let store = Arc::new(MemoryStore::new());
        let mut poi = index(&store);
        let bed = poi.registry().by_name("bed").unwrap();
        poi.add(BlockPos::new(0, -64, 0), bed).unwrap();
        poi.add(BlockPos::new(0, 319, 0), bed).unwrap();
        let low = poi.find_nearest(|_| true, |_| true, BlockPos::new(0, -64, 0), 48, Occupancy::Any);
        assert_eq!(low, Some(BlockPos::new(0, -64, 0)));
        let none = poi.find_nearest(|_| true, |_| true, BlockPos::new(0, 100, 0), 48, Occupancy::Any);
        assert!(none.is_none());
    }
}
