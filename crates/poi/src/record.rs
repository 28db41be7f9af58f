use crate::registry::PoiTypeId;
use serde::{Deserialize, Serialize};
use strata_common::BlockPos;

/// One point of interest. `free_tickets` never exceeds `max_tickets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoiRecord {
    pub pos: BlockPos,
    pub kind: PoiTypeId,
    pub max_tickets: u32,
    pub free_tickets: u32,
}

impl PoiRecord {
    pub fn new(pos: BlockPos, kind: PoiTypeId, max_tickets: u32) -> Self {
        Self {
            pos,
            kind,
            max_tickets,
            free_tickets: max_tickets,
        }
    }

    pub fn has_space(&self) -> bool {
        self.free_tickets > 0
    }

    pub fn is_occupied(&self) -> bool {
        self.free_tickets != self.max_tickets
    }

    /// Take one ticket. False when none are left.
    pub fn acquire_ticket(&mut self) -> bool {
        if self.free_tickets == 0 {
            return false;
        }
        self.free_tickets -= 1;
        true
    }

    /// Return one ticket. False when every ticket is already free.
    pub fn release_ticket(&mut self) -> bool {
        if self.free_tickets >= self.max_tickets {
            return false;
        }
        self.free_tickets += 1;
        true
    }
}

/// Occupancy filter applied by searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occupancy {
    HasSpace,
    IsOccupied,
    Any,
}

impl Occupancy {
    pub fn matches(self, record: &PoiRecord) -> bool {
        match self {
            Occupancy::HasSpace => record.has_space(),
            Occupancy::IsOccupied => record.is_occupied(),
            Occupancy::Any => true,
        }
    }
}
