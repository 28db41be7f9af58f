//! Caller-side acquire loop with per-position backoff.

use crate::backoff::BackoffCache;
use crate::index::PoiIndex;
use crate::record::Occupancy;
use crate::registry::PoiTypeId;
use rand::Rng;
use strata_common::{BlockPos, StrataConfig};

/// Outcome of one [`PoiSeeker::acquire`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeekOutcome {
    Acquired(BlockPos),
    /// Candidates existed but none was reachable; all went under backoff.
    Unreachable(Vec<BlockPos>),
    NoCandidates,
}

/// Finds and claims POIs for one caller, backing off from positions it
/// repeatedly failed to reach.
#[derive(Debug, Clone)]
pub struct PoiSeeker {
    backoff: BackoffCache,
    batch_size: usize,
    radius: i32,
}

impl PoiSeeker {
    pub fn new(config: &StrataConfig) -> Self {
        Self {
            backoff: BackoffCache::new(config.backoff),
            batch_size: config.poi.batch_size,
            radius: config.poi.search_radius,
        }
    }

    pub fn backoff(&self) -> &BackoffCache {
        &self.backoff
    }

    /// One acquire attempt at tick `time`. `reachable` receives the batch
    /// of nearest candidates and returns the one it can reach, if any.
    pub fn acquire<R: Rng + ?Sized>(
        &mut self,
        index: &mut PoiIndex,
        type_pred: impl Fn(PoiTypeId) -> bool,
        origin: BlockPos,
        time: u64,
        rng: &mut R,
        reachable: impl FnOnce(&[(PoiTypeId, BlockPos)]) -> Option<BlockPos>,
    ) -> SeekOutcome {
        self.backoff.prune(time);
        let backoff = &mut self.backoff;
        let candidates: Vec<(PoiTypeId, BlockPos)> = index
            .find_nearest_records(
                &type_pred,
                |pos| backoff.allows(pos, time, rng),
                origin,
                self.radius,
                Occupancy::HasSpace,
                self.batch_size,
            )
            .into_iter()
            .map(|r| (r.kind, r.pos))
            .collect();
        if candidates.is_empty() {
            return SeekOutcome::NoCandidates;
        }

        if let Some(target) = reachable(&candidates) {
            if index.type_at(target).is_some() {
                let taken = index.take(&type_pred, |_, pos| pos == target, target, 1);
                if taken.is_some() {
                    self.backoff.clear();
                    tracing::debug!(pos = ?target, "acquired POI");
                    return SeekOutcome::Acquired(target);
                }
            }
        }

        let positions: Vec<BlockPos> = candidates.iter().map(|(_, pos)| *pos).collect();
        for pos in &positions {
            self.backoff.back_off(*pos, time, rng);
        }
        tracing::trace!(count = positions.len(), "POI candidates unreachable, backing off");
        SeekOutcome::Unreachable(positions)
    }
}
