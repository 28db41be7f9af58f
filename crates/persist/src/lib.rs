//! Persistence: region container files, compound documents, a generic
//! per-section cache and a background IO worker.
//!
//! # Invariants
//! - No two live slots of a region file share a sector.
//! - A damaged slot or section is reported as absent, never as a crash.
//! - Documents written by a newer format are rejected, not partially applied.

pub mod codec;
pub mod document;
pub mod io;
pub mod region;
pub mod section_cache;
pub mod storage;

pub use codec::{CodecError, PayloadFormat};
pub use document::{
    CURRENT_DATA_VERSION, ChunkDocument, ChunkStatus, ColumnDocument, DocumentError,
    decode_document, encode_document,
};
pub use io::{ColumnDecoder, DecodedColumn, IntegrationTask, IoPriority, IoScheduler};
pub use region::{RegionError, RegionFile, RegionOptions, SECTOR_BYTES, SLOT_COUNT, SlotEntry};
pub use section_cache::{CacheError, FlushBudget, FlushStats, SectionCache, SectionCodec};
pub use storage::{ColumnStore, MemoryStore, RegionStorage, StoreError};

pub fn crate_info() -> &'static str {
    "strata-persist v0.1.0"
}
