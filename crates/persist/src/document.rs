//! Compound documents: self-describing CBOR key/value trees carrying a
//! `data_version`.
//!
//! A document written by a newer format than [`CURRENT_DATA_VERSION`] is
//! rejected before its body is decoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_common::ChunkPos;

/// Format version written into every new document.
pub const CURRENT_DATA_VERSION: u32 = 1;

/// Errors from encoding or decoding documents.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("document data version {found} is newer than supported {supported}")]
    NewerVersion { found: u32, supported: u32 },
    #[error("document for chunk {found:?} stored at {expected:?}")]
    WrongLocation { expected: ChunkPos, found: ChunkPos },
}

#[derive(Deserialize)]
struct VersionProbe {
    data_version: u32,
}

pub fn encode_document<T: Serialize + ?Sized>(doc: &T) -> Result<Vec<u8>, DocumentError> {
    let mut buf = Vec::new();
    ciborium::into_writer(doc, &mut buf).map_err(|e| DocumentError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decode a document after checking its version.
pub fn decode_document<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DocumentError> {
    let probe: VersionProbe =
        ciborium::from_reader(bytes).map_err(|e| DocumentError::CborDecode(e.to_string()))?;
    if probe.data_version > CURRENT_DATA_VERSION {
        return Err(DocumentError::NewerVersion {
            found: probe.data_version,
            supported: CURRENT_DATA_VERSION,
        });
    }
    ciborium::from_reader(bytes).map_err(|e| DocumentError::CborDecode(e.to_string()))
}

/// Per-column document holding the stored form of each non-empty section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDocument<S> {
    pub data_version: u32,
    pub sections: BTreeMap<i32, S>,
}

impl<S> ColumnDocument<S> {
    pub fn new(sections: BTreeMap<i32, S>) -> Self {
        Self {
            data_version: CURRENT_DATA_VERSION,
            sections,
        }
    }
}

/// Generation progress of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Empty,
    StructureStarts,
    Biomes,
    Noise,
    Surface,
    Features,
    Light,
    Full,
}

/// A palette-compressed container blob (block states or biomes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaletteBlob {
    pub palette: Vec<String>,
    pub data: Vec<i64>,
}

/// One vertical section of a chunk document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionEntry {
    pub y: i8,
    pub block_states: Option<PaletteBlob>,
    pub biomes: Option<PaletteBlob>,
    pub block_light: Option<Vec<u8>>,
    pub sky_light: Option<Vec<u8>>,
}

/// A scheduled block or fluid tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTick {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub delay: i32,
    pub priority: i32,
}

/// Structure starts by name plus chunk references per structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureData {
    pub starts: BTreeMap<String, ciborium::Value>,
    pub references: BTreeMap<String, Vec<i64>>,
}

/// The full per-chunk world document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub data_version: u32,
    pub x_pos: i32,
    pub z_pos: i32,
    pub status: ChunkStatus,
    pub last_update: i64,
    pub inhabited_time: i64,
    pub sections: Vec<SectionEntry>,
    pub heightmaps: BTreeMap<String, Vec<i64>>,
    pub structures: StructureData,
    pub block_ticks: Vec<ScheduledTick>,
    pub fluid_ticks: Vec<ScheduledTick>,
    pub block_entities: Vec<ciborium::Value>,
    pub post_processing: Vec<Vec<i16>>,
}

impl ChunkDocument {
    pub fn new(chunk: ChunkPos, status: ChunkStatus) -> Self {
        Self {
            data_version: CURRENT_DATA_VERSION,
            x_pos: chunk.x,
            z_pos: chunk.z,
            status,
            last_update: 0,
            inhabited_time: 0,
            sections: Vec::new(),
            heightmaps: BTreeMap::new(),
            structures: StructureData::default(),
            block_ticks: Vec::new(),
            fluid_ticks: Vec::new(),
            block_entities: Vec::new(),
            post_processing: Vec::new(),
        }
    }

    pub fn chunk(&self) -> ChunkPos {
        ChunkPos::new(self.x_pos, self.z_pos)
    }

    pub fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        encode_document(self)
    }

    /// Decode a document read from `expected`'s slot, rejecting misplaced data.
    pub fn decode_for(expected: ChunkPos, bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc: ChunkDocument = decode_document(bytes)?;
        if doc.chunk() != expected {
            return Err(DocumentError::WrongLocation {
                expected,
                found: doc.chunk(),
            });
        }
        Ok(doc)
    }

    pub fn section(&self, y: i8) -> Option<&SectionEntry> {
        self.sections.iter().find(|s| s.y == y)
    }
}
