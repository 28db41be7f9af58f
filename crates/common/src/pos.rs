//! Cell addressing: block, section, chunk and region coordinates and their
//! packed 64-bit keys.

use serde::{Deserialize, Serialize};

/// Edge length of a section and a chunk, in blocks.
pub const SECTION_SIZE: i32 = 16;
/// Edge length of a region, in chunks.
pub const REGION_SIZE: i32 = 32;

const BLOCK_X_BITS: u32 = 26;
const BLOCK_Z_BITS: u32 = 26;
const BLOCK_Y_BITS: u32 = 12;
const BLOCK_X_SHIFT: u32 = BLOCK_Y_BITS + BLOCK_Z_BITS;
const BLOCK_Z_SHIFT: u32 = BLOCK_Y_BITS;

const SECTION_X_BITS: u32 = 22;
const SECTION_Z_BITS: u32 = 22;
const SECTION_Y_BITS: u32 = 20;
const SECTION_X_SHIFT: u32 = SECTION_Y_BITS + SECTION_Z_BITS;
const SECTION_Z_SHIFT: u32 = SECTION_Y_BITS;

const fn mask(bits: u32) -> i64 {
    (1i64 << bits) - 1
}

/// Packed section coordinate. Ordering follows the signed value, which sorts
/// by x, then z, then y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey(pub i64);

/// Packed chunk (column) coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey(pub i64);

/// Absolute block coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Pack into 64 bits: 26 bits of x, 26 bits of z, 12 bits of y.
    pub fn as_long(self) -> i64 {
        ((self.x as i64 & mask(BLOCK_X_BITS)) << BLOCK_X_SHIFT)
            | ((self.z as i64 & mask(BLOCK_Z_BITS)) << BLOCK_Z_SHIFT)
            | (self.y as i64 & mask(BLOCK_Y_BITS))
    }

    pub fn from_long(packed: i64) -> Self {
        let x = packed >> BLOCK_X_SHIFT;
        let z = (packed << (64 - BLOCK_X_SHIFT)) >> (64 - BLOCK_Z_BITS);
        let y = (packed << (64 - BLOCK_Y_BITS)) >> (64 - BLOCK_Y_BITS);
        Self::new(x as i32, y as i32, z as i32)
    }

    pub fn section(self) -> SectionPos {
        SectionPos::new(
            block_to_section(self.x),
            block_to_section(self.y),
            block_to_section(self.z),
        )
    }

    pub fn chunk(self) -> ChunkPos {
        ChunkPos::new(block_to_section(self.x), block_to_section(self.z))
    }

    /// Squared euclidean distance between block coordinates.
    pub fn dist_sqr(self, other: BlockPos) -> i64 {
        let dx = (self.x - other.x) as i64;
        let dy = (self.y - other.y) as i64;
        let dz = (self.z - other.z) as i64;
        dx * dx + dy * dy + dz * dz
    }

    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

/// Section coordinate (a 16x16x16 cell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SectionPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn of(chunk: ChunkPos, y: i32) -> Self {
        Self::new(chunk.x, y, chunk.z)
    }

    /// Pack into a cell key: 22 bits of x, 22 bits of z, 20 bits of y.
    pub fn key(self) -> CellKey {
        CellKey(pack(self.x, self.y, self.z))
    }

    pub fn chunk(self) -> ChunkPos {
        ChunkPos::new(self.x, self.z)
    }

    /// Lowest-coordinate block inside the section.
    pub fn min_block(self) -> BlockPos {
        BlockPos::new(
            self.x * SECTION_SIZE,
            self.y * SECTION_SIZE,
            self.z * SECTION_SIZE,
        )
    }

    /// All 4096 block positions inside the section, x fastest.
    pub fn blocks(self) -> impl Iterator<Item = BlockPos> {
        let base = self.min_block();
        (0..SECTION_SIZE).flat_map(move |ly| {
            (0..SECTION_SIZE).flat_map(move |lz| {
                (0..SECTION_SIZE).map(move |lx| base.offset(lx, ly, lz))
            })
        })
    }
}

impl From<CellKey> for SectionPos {
    fn from(key: CellKey) -> Self {
        let (x, y, z) = unpack(key.0);
        Self::new(x, y, z)
    }
}

impl From<SectionPos> for CellKey {
    fn from(pos: SectionPos) -> Self {
        pos.key()
    }
}

impl CellKey {
    pub fn x(self) -> i32 {
        unpack(self.0).0
    }

    pub fn y(self) -> i32 {
        unpack(self.0).1
    }

    pub fn z(self) -> i32 {
        unpack(self.0).2
    }

    /// The column this section belongs to.
    pub fn chunk(self) -> ChunkPos {
        let (x, _, z) = unpack(self.0);
        ChunkPos::new(x, z)
    }

    /// Smallest key sharing this key's x coordinate.
    pub fn x_range_start(x: i32) -> CellKey {
        CellKey(pack(x, 0, 0))
    }

    /// Largest key sharing this key's x coordinate.
    pub fn x_range_end(x: i32) -> CellKey {
        CellKey(pack(x, -1, -1))
    }

    /// Inclusive key bounds covering every section of one column.
    pub fn column_range(chunk: ChunkPos) -> (CellKey, CellKey) {
        (
            CellKey(pack(chunk.x, 0, chunk.z)),
            CellKey(pack(chunk.x, -1, chunk.z)),
        )
    }
}

/// Pack a section coordinate into a 64-bit key.
pub fn pack(x: i32, y: i32, z: i32) -> i64 {
    ((x as i64 & mask(SECTION_X_BITS)) << SECTION_X_SHIFT)
        | ((z as i64 & mask(SECTION_Z_BITS)) << SECTION_Z_SHIFT)
        | (y as i64 & mask(SECTION_Y_BITS))
}

/// Unpack a 64-bit key into its section coordinate.
pub fn unpack(key: i64) -> (i32, i32, i32) {
    let x = key >> SECTION_X_SHIFT;
    let z = (key << (64 - SECTION_X_SHIFT)) >> (64 - SECTION_Z_BITS);
    let y = (key << (64 - SECTION_Y_BITS)) >> (64 - SECTION_Y_BITS);
    (x as i32, y as i32, z as i32)
}

/// Column of a packed section key.
pub fn chunk_of(key: CellKey) -> ChunkKey {
    key.chunk().key()
}

pub fn block_to_section(coord: i32) -> i32 {
    coord >> 4
}

/// Section coordinate containing a floating point position.
pub fn pos_to_section(coord: f64) -> i32 {
    block_to_section(coord.floor() as i32)
}

/// Chunk (column) coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn key(self) -> ChunkKey {
        ChunkKey((self.x as u32 as i64) | ((self.z as i64) << 32))
    }

    pub fn region(self) -> RegionPos {
        RegionPos::new(self.x >> 5, self.z >> 5)
    }

    /// Slot of this chunk inside its region's directory.
    pub fn region_slot(self) -> usize {
        ((self.x & (REGION_SIZE - 1)) + (self.z & (REGION_SIZE - 1)) * REGION_SIZE) as usize
    }

    pub fn min_block_x(self) -> i32 {
        self.x * SECTION_SIZE
    }

    pub fn min_block_z(self) -> i32 {
        self.z * SECTION_SIZE
    }

    /// Chebyshev distance in chunks.
    pub fn chebyshev(self, other: ChunkPos) -> i32 {
        (self.x - other.x).abs().max((self.z - other.z).abs())
    }

    /// Chunks at exactly Chebyshev distance `ring` from this one.
    pub fn ring(self, ring: i32) -> Vec<ChunkPos> {
        if ring == 0 {
            return vec![self];
        }
        let mut out = Vec::with_capacity((8 * ring) as usize);
        for dx in -ring..=ring {
            out.push(ChunkPos::new(self.x + dx, self.z - ring));
            out.push(ChunkPos::new(self.x + dx, self.z + ring));
        }
        for dz in (-ring + 1)..ring {
            out.push(ChunkPos::new(self.x - ring, self.z + dz));
            out.push(ChunkPos::new(self.x + ring, self.z + dz));
        }
        out
    }

    /// Squared horizontal distance from a block to the nearest block column of
    /// this chunk.
    pub fn min_dist_sqr_xz(self, pos: BlockPos) -> i64 {
        let axis = |coord: i32, min: i32| -> i64 {
            let max = min + SECTION_SIZE - 1;
            if coord < min {
                (min - coord) as i64
            } else if coord > max {
                (coord - max) as i64
            } else {
                0
            }
        };
        let dx = axis(pos.x, self.min_block_x());
        let dz = axis(pos.z, self.min_block_z());
        dx * dx + dz * dz
    }
}

impl From<ChunkKey> for ChunkPos {
    fn from(key: ChunkKey) -> Self {
        ChunkPos::new(key.0 as i32, (key.0 >> 32) as i32)
    }
}

/// Region coordinate: a 32x32 group of chunks stored in one container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk stored in `slot` of this region.
    pub fn chunk_at_slot(self, slot: usize) -> ChunkPos {
        let slot = slot as i32;
        ChunkPos::new(
            self.x * REGION_SIZE + slot % REGION_SIZE,
            self.z * REGION_SIZE + slot / REGION_SIZE,
        )
    }

    pub fn file_name(self) -> String {
        format!("r.{}.{}.region", self.x, self.z)
    }

    /// Inverse of [`file_name`](Self::file_name).
    pub fn from_file_name(name: &str) -> Option<Self> {
        let mut parts = name.strip_prefix("r.")?.strip_suffix(".region")?.split('.');
        let x = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(x, z))
    }
}
