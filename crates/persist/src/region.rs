//! Region container file: 1024 chunk slots per file, payloads in whole
//! 4096-byte sectors.
//!
//! Layout:
//! ```text
//! sector 0   1024 x u32 BE  location  (sector_offset << 8 | sector_count)
//! sector 1   1024 x u32 BE  last-write timestamp (unix seconds)
//! sector 2.. payload frames, each padded to a sector boundary
//! ```
//!
//! # Invariants
//! - No two live slots' sector ranges overlap.
//! - A slot that fails validation on open is treated as missing; it never
//!   invalidates sibling slots.

use crate::codec::{self, CodecError, PayloadFormat};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use strata_common::{ChunkPos, CompressionKind, RegionConfig, RegionPos};

pub const SECTOR_BYTES: usize = 4096;
pub const SLOT_COUNT: usize = 1024;
const HEADER_SECTORS: u32 = 2;
const HEADER_BYTES: u64 = HEADER_SECTORS as u64 * SECTOR_BYTES as u64;
const MAX_SLOT_SECTORS: usize = 255;

/// Errors from region file operations.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("cannot open region file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("payload for {chunk:?} needs {sectors} sectors (max {MAX_SLOT_SECTORS})")]
    PayloadTooLarge { chunk: ChunkPos, sectors: usize },
    #[error("chunk {chunk:?} is not stored in region {region:?}")]
    OutsideRegion { chunk: ChunkPos, region: RegionPos },
}

impl RegionError {
    /// Whether the failure only affects one chunk's payload.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegionError::Codec(_))
    }
}

/// Options applied to every region file opened by a storage.
#[derive(Debug, Clone, Copy)]
pub struct RegionOptions {
    pub sync_writes: bool,
    pub compression: CompressionKind,
    pub zstd_level: i32,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            sync_writes: false,
            compression: CompressionKind::Zstd,
            zstd_level: 3,
        }
    }
}

impl From<&RegionConfig> for RegionOptions {
    fn from(config: &RegionConfig) -> Self {
        Self {
            sync_writes: config.sync_writes,
            compression: config.compression,
            zstd_level: config.zstd_level,
        }
    }
}

/// Directory entry of one chunk slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotEntry {
    pub sector_offset: u32,
    pub sector_count: u32,
    pub timestamp: u32,
}

impl SlotEntry {
    fn from_location(location: u32, timestamp: u32) -> Self {
        Self {
            sector_offset: location >> 8,
            sector_count: location & 0xFF,
            timestamp,
        }
    }

    fn location(&self) -> u32 {
        (self.sector_offset << 8) | self.sector_count
    }

    pub fn is_empty(&self) -> bool {
        self.sector_count == 0
    }

    pub fn byte_offset(&self) -> u64 {
        self.sector_offset as u64 * SECTOR_BYTES as u64
    }

    fn end(&self) -> u32 {
        self.sector_offset + self.sector_count
    }
}

/// Free sector runs, first-fit, coalesced on release.
#[derive(Debug, Default)]
struct FreeList {
    /// start sector -> run length
    runs: BTreeMap<u32, u32>,
    /// First sector past the end of the file.
    end: u32,
}

impl FreeList {
    fn allocate(&mut self, count: u32) -> u32 {
        let found = self
            .runs
            .iter()
            .find(|(_, len)| **len >= count)
            .map(|(start, len)| (*start, *len));
        match found {
            Some((start, len)) => {
                self.runs.remove(&start);
                if len > count {
                    self.runs.insert(start + count, len - count);
                }
                start
            }
            None => {
                let start = self.end;
                self.end += count;
                start
            }
        }
    }

    fn release(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        let mut start = start;
        let mut len = count;
        if let Some((&prev_start, &prev_len)) = self.runs.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.runs.get(&(start + len)) {
            self.runs.remove(&(start + len));
            len += next_len;
        }
        self.runs.insert(start, len);
    }

    fn free_sectors(&self) -> u32 {
        self.runs.values().sum()
    }
}

/// One open region container file.
pub struct RegionFile {
    path: PathBuf,
    region: RegionPos,
    file: File,
    slots: Vec<SlotEntry>,
    free: FreeList,
    options: RegionOptions,
}

impl RegionFile {
    /// Open or create a region file, validating every directory slot.
    pub fn open(
        path: impl AsRef<Path>,
        region: RegionPos,
        options: RegionOptions,
    ) -> Result<Self, RegionError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| RegionError::Open {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len();
        if len < HEADER_BYTES {
            file.set_len(HEADER_BYTES).map_err(open_err)?;
        }
        let len = len.max(HEADER_BYTES);

        let mut header = vec![0u8; HEADER_BYTES as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let file_sectors = len.div_ceil(SECTOR_BYTES as u64) as u32;
        let mut slots = vec![SlotEntry::default(); SLOT_COUNT];
        let mut claimed = vec![false; file_sectors as usize];
        claimed[..HEADER_SECTORS as usize].fill(true);

        for (index, slot) in slots.iter_mut().enumerate() {
            let location = read_u32(&header, index * 4);
            if location == 0 {
                continue;
            }
            let timestamp = read_u32(&header, SECTOR_BYTES + index * 4);
            let entry = SlotEntry::from_location(location, timestamp);
            let chunk = region.chunk_at_slot(index);
            if entry.sector_count == 0 || entry.sector_offset < HEADER_SECTORS {
                tracing::warn!(?chunk, ?entry, path = %path.display(), "invalid slot location, treating as missing");
                continue;
            }
            if entry.end() > file_sectors {
                tracing::warn!(?chunk, ?entry, file_sectors, path = %path.display(), "slot extends past end of file, treating as missing");
                continue;
            }
            let range = entry.sector_offset as usize..entry.end() as usize;
            if claimed[range.clone()].iter().any(|c| *c) {
                tracing::warn!(?chunk, ?entry, path = %path.display(), "slot overlaps another slot, treating as missing");
                continue;
            }
            claimed[range].fill(true);
            *slot = entry;
        }

        let mut free = FreeList {
            runs: BTreeMap::new(),
            end: file_sectors,
        };
        let mut run_start: Option<u32> = None;
        for (sector, used) in claimed.iter().enumerate() {
            let sector = sector as u32;
            match (used, run_start) {
                (false, None) => run_start = Some(sector),
                (true, Some(start)) => {
                    free.release(start, sector - start);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            free.release(start, file_sectors - start);
        }

        tracing::debug!(
            path = %path.display(),
            live = slots.iter().filter(|s| !s.is_empty()).count(),
            free_sectors = free.free_sectors(),
            "opened region file"
        );

        Ok(Self {
            path,
            region,
            file,
            slots,
            free,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region(&self) -> RegionPos {
        self.region
    }

    fn slot_index(&self, chunk: ChunkPos) -> Result<usize, RegionError> {
        if chunk.region() != self.region {
            return Err(RegionError::OutsideRegion {
                chunk,
                region: self.region,
            });
        }
        Ok(chunk.region_slot())
    }

    pub fn has_chunk(&self, chunk: ChunkPos) -> bool {
        self.slot_index(chunk)
            .map(|i| !self.slots[i].is_empty())
            .unwrap_or(false)
    }

    /// Directory entry for a chunk (empty if absent or outside this region).
    pub fn slot(&self, chunk: ChunkPos) -> SlotEntry {
        self.slot_index(chunk)
            .map(|i| self.slots[i])
            .unwrap_or_default()
    }

    /// Every live slot with its chunk coordinate.
    pub fn slots(&self) -> impl Iterator<Item = (ChunkPos, SlotEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_empty())
            .map(|(i, s)| (self.region.chunk_at_slot(i), *s))
    }

    /// Read and inflate a chunk's payload. `None` if the slot is empty.
    pub fn read(&mut self, chunk: ChunkPos) -> Result<Option<Vec<u8>>, RegionError> {
        let Some(raw) = self.read_raw(chunk)? else {
            return Ok(None);
        };
        Ok(Some(codec::decode_frame(&raw)?))
    }

    /// The framed bytes of a chunk, sector padding included.
    pub fn read_raw(&mut self, chunk: ChunkPos) -> Result<Option<Vec<u8>>, RegionError> {
        let entry = self.slots[self.slot_index(chunk)?];
        if entry.is_empty() {
            return Ok(None);
        }
        let mut buf = Vec::with_capacity(entry.sector_count as usize * SECTOR_BYTES);
        self.file.seek(SeekFrom::Start(entry.byte_offset()))?;
        (&mut self.file)
            .take(entry.sector_count as u64 * SECTOR_BYTES as u64)
            .read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    /// Store `data` for a chunk, or clear the slot when `None`.
    pub fn write(&mut self, chunk: ChunkPos, data: Option<&[u8]>) -> Result<(), RegionError> {
        let Some(data) = data else {
            return self.clear(chunk);
        };
        let index = self.slot_index(chunk)?;
        let frame = codec::encode_frame(
            data,
            PayloadFormat::from(self.options.compression),
            self.options.zstd_level,
        )?;
        let sectors = frame.len().div_ceil(SECTOR_BYTES);
        if sectors > MAX_SLOT_SECTORS {
            return Err(RegionError::PayloadTooLarge { chunk, sectors });
        }
        let sectors = sectors as u32;

        let old = self.slots[index];
        let start = if !old.is_empty() && old.sector_count >= sectors {
            self.free
                .release(old.sector_offset + sectors, old.sector_count - sectors);
            old.sector_offset
        } else {
            let start = self.free.allocate(sectors);
            if !old.is_empty() {
                self.free.release(old.sector_offset, old.sector_count);
            }
            start
        };

        let mut padded = frame;
        padded.resize(sectors as usize * SECTOR_BYTES, 0);
        self.file
            .seek(SeekFrom::Start(start as u64 * SECTOR_BYTES as u64))?;
        self.file.write_all(&padded)?;

        let entry = SlotEntry {
            sector_offset: start,
            sector_count: sectors,
            timestamp: now_seconds(),
        };
        self.write_entry(index, entry)?;
        tracing::trace!(?chunk, start, sectors, "wrote chunk payload");
        Ok(())
    }

    /// Free a chunk's sectors and zero its directory entry.
    pub fn clear(&mut self, chunk: ChunkPos) -> Result<(), RegionError> {
        let index = self.slot_index(chunk)?;
        let old = self.slots[index];
        if old.is_empty() {
            return Ok(());
        }
        self.free.release(old.sector_offset, old.sector_count);
        self.write_entry(index, SlotEntry::default())?;
        tracing::trace!(?chunk, "cleared chunk slot");
        Ok(())
    }

    fn write_entry(&mut self, index: usize, entry: SlotEntry) -> Result<(), RegionError> {
        self.file.seek(SeekFrom::Start(index as u64 * 4))?;
        self.file.write_all(&entry.location().to_be_bytes())?;
        self.file
            .seek(SeekFrom::Start((SECTOR_BYTES + index * 4) as u64))?;
        self.file.write_all(&entry.timestamp.to_be_bytes())?;
        self.slots[index] = entry;
        if self.options.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RegionError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Sectors currently on the free-list.
    pub fn free_sectors(&self) -> u32 {
        self.free.free_sectors()
    }

    /// Total sectors spanned by the file (header included).
    pub fn total_sectors(&self) -> u32 {
        self.free.end
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn now_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> RegionFile {
        RegionFile::open(
            dir.join("r.0.0.region"),
            RegionPos::new(0, 0),
            RegionOptions::default(),
        )
        .unwrap()
    }

    /// Incompressible bytes, so the sector count is predictable.
    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn write_then_read_returns_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = open(tmp.path());
        let chunk = ChunkPos::new(5, 9);
        region.write(chunk, Some(b"hello region")).unwrap();
        assert_eq!(region.read(chunk).unwrap().unwrap(), b"hello region");
        assert!(region.has_chunk(chunk));
        assert!(region.slot(chunk).timestamp > 0);
    }

    #[test]
    fn missing_chunk_reads_none() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = open(tmp.path());
        assert!(region.read(ChunkPos::new(1, 1)).unwrap().is_none());
    }

    #[test]
    fn clear_keeps_neighbours_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = open(tmp.path());
        let a = ChunkPos::new(0, 0);
        let b = ChunkPos::new(1, 0);
        let c = ChunkPos::new(2, 0);
        let (da, db, dc) = (noise(5000, 1), noise(9000, 2), noise(100, 3));
        region.write(a, Some(&da)).unwrap();
        region.write(b, Some(&db)).unwrap();
        region.write(c, Some(&dc)).unwrap();

        region.write(b, None).unwrap();
        assert!(region.read(b).unwrap().is_none());
        assert_eq!(region.read(a).unwrap().unwrap(), da);
        assert_eq!(region.read(c).unwrap().unwrap(), dc);
        assert!(region.free_sectors() >= 3);
    }

    #[test]
    fn freed_sectors_are_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = open(tmp.path());
        let a = ChunkPos::new(0, 0);
        let b = ChunkPos::new(0, 1);
        region.write(a, Some(&noise(10_000, 7))).unwrap();
        let end_before = region.total_sectors();
        region.write(a, None).unwrap();
        region.write(b, Some(&noise(6_000, 8))).unwrap();
        assert_eq!(region.total_sectors(), end_before);
        assert_eq!(region.slot(b).sector_offset, 2);
    }

    #[test]
    fn rewrite_in_place_when_it_fits_and_grows_elsewhere() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = open(tmp.path());
        let a = ChunkPos::new(3, 3);
        let b = ChunkPos::new(4, 3);
        region.write(a, Some(&noise(9_000, 1))).unwrap();
        region.write(b, Some(&noise(100, 2))).unwrap();
        let first = region.slot(a);
        assert_eq!(first.sector_count, 3);

        region.write(a, Some(&noise(5_000, 3))).unwrap();
        let shrunk = region.slot(a);
        assert_eq!(shrunk.sector_offset, first.sector_offset);
        assert_eq!(shrunk.sector_count, 2);

        let big = noise(20_000, 4);
        region.write(a, Some(&big)).unwrap();
        let grown = region.slot(a);
        assert_ne!(grown.sector_offset, first.sector_offset);
        assert_eq!(region.read(a).unwrap().unwrap(), big);
        assert_eq!(region.read(b).unwrap().unwrap(), noise(100, 2));
    }

    #[test]
    fn reopen_preserves_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let chunk = ChunkPos::new(31, 31);
        {
            let mut region = open(tmp.path());
            region.write(chunk, Some(b"persisted")).unwrap();
            region.flush().unwrap();
        }
        let mut region = open(tmp.path());
        assert_eq!(region.read(chunk).unwrap().unwrap(), b"persisted");
        assert_eq!(region.slots().count(), 1);
    }

    #[test]
    fn corrupt_slot_is_missing_without_touching_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let good = ChunkPos::new(0, 0);
        let bad = ChunkPos::new(1, 0);
        let overlapping = ChunkPos::new(2, 0);
        {
            let mut region = open(tmp.path());
            region.write(good, Some(b"good")).unwrap();
            region.write(bad, Some(b"bad")).unwrap();
        }
        let path = tmp.path().join("r.0.0.region");
        let mut bytes = std::fs::read(&path).unwrap();
        // bad slot points far past the end of the file
        bytes[bad.region_slot() * 4..bad.region_slot() * 4 + 4]
            .copy_from_slice(&((9_000u32 << 8) | 1).to_be_bytes());
        // another slot claims the good slot's sector
        let good_location = read_u32(&bytes, good.region_slot() * 4);
        bytes[overlapping.region_slot() * 4..overlapping.region_slot() * 4 + 4]
            .copy_from_slice(&good_location.to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let mut region = open(tmp.path());
        assert!(region.read(bad).unwrap().is_none());
        assert!(region.read(overlapping).unwrap().is_none());
        assert_eq!(region.read(good).unwrap().unwrap(), b"good");
    }

    #[test]
    fn corrupt_payload_is_a_transient_error() {
        let tmp = tempfile::tempdir().unwrap();
        let chunk = ChunkPos::new(0, 2);
        {
            let mut region = open(tmp.path());
            region.write(chunk, Some(b"payload")).unwrap();
        }
        let path = tmp.path().join("r.0.0.region");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[2 * SECTOR_BYTES] = 0x7f;
        std::fs::write(&path, &bytes).unwrap();

        let mut region = open(tmp.path());
        let err = region.read(chunk).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn oversized_payload_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = RegionFile::open(
            tmp.path().join("r.0.0.region"),
            RegionPos::new(0, 0),
            RegionOptions {
                compression: CompressionKind::None,
                ..RegionOptions::default()
            },
        )
        .unwrap();
        let result = region.write(ChunkPos::new(0, 0), Some(&vec![0u8; 256 * SECTOR_BYTES]));
        assert!(matches!(result, Err(RegionError::PayloadTooLarge { .. })));
        assert!(!region.has_chunk(ChunkPos::new(0, 0)));
    }

    #[test]
    fn chunk_from_other_region_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut region = open(tmp.path());
        let result = region.write(ChunkPos::new(32, 0), Some(b"x"));
        assert!(matches!(result, Err(RegionError::OutsideRegion { .. })));
    }

    #[test]
    fn free_list_coalesces() {
        let mut free = FreeList {
            runs: BTreeMap::new(),
            end: 20,
        };
        free.release(5, 2);
        free.release(9, 3);
        free.release(7, 2);
        assert_eq!(free.runs.len(), 1);
        assert_eq!(free.runs.get(&5), Some(&7));
        assert_eq!(free.allocate(4), 5);
        assert_eq!(free.allocate(10), 20);
        assert_eq!(free.end, 30);
    }
}
