//! POI type catalogue, built once at startup and shared by `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Numeric block-state id supplied by the world layer.
pub type BlockStateId = u32;

/// Index of a type inside its [`PoiRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoiTypeId(pub u16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoiType {
    pub id: PoiTypeId,
    pub name: String,
    /// Tickets a fresh record of this type starts with.
    pub max_tickets: u32,
    /// How close (in blocks) a visitor must get to use the POI.
    pub valid_range: u32,
    pub block_states: Vec<BlockStateId>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("POI type {0:?} registered twice")]
    DuplicateName(String),
    #[error("block state {state} claimed by both {first:?} and {second:?}")]
    DuplicateState {
        state: BlockStateId,
        first: String,
        second: String,
    },
    #[error("tag {tag:?} names unknown POI type {name:?}")]
    UnknownTagMember { tag: String, name: String },
    #[error("too many POI types")]
    TooManyTypes,
}

#[derive(Debug, Default)]
pub struct PoiRegistryBuilder {
    types: Vec<(String, u32, u32, Vec<BlockStateId>)>,
    tags: Vec<(String, Vec<String>)>,
}

impl PoiRegistryBuilder {
    pub fn register(
        mut self,
        name: impl Into<String>,
        max_tickets: u32,
        valid_range: u32,
        block_states: impl IntoIterator<Item = BlockStateId>,
    ) -> Self {
        self.types.push((
            name.into(),
            max_tickets,
            valid_range,
            block_states.into_iter().collect(),
        ));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>, members: &[&str]) -> Self {
        self.tags
            .push((tag.into(), members.iter().map(|m| m.to_string()).collect()));
        self
    }

    pub fn build(self) -> Result<PoiRegistry, RegistryError> {
        let mut registry = PoiRegistry::default();
        for (name, max_tickets, valid_range, block_states) in self.types {
            if registry.by_name.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
            let index = u16::try_from(registry.types.len()).map_err(|_| RegistryError::TooManyTypes)?;
            let id = PoiTypeId(index);
            for &state in &block_states {
                if let Some(&other) = registry.by_state.get(&state) {
                    return Err(RegistryError::DuplicateState {
                        state,
                        first: registry.types[other.0 as usize].name.clone(),
                        second: name,
                    });
                }
                registry.by_state.insert(state, id);
            }
            registry.by_name.insert(name.clone(), id);
            registry.types.push(PoiType {
                id,
                name,
                max_tickets,
                valid_range,
                block_states,
            });
        }
        for (tag, members) in self.tags {
            let mut ids = HashSet::new();
            for name in members {
                let Some(&id) = registry.by_name.get(&name) else {
                    return Err(RegistryError::UnknownTagMember { tag, name });
                };
                ids.insert(id);
            }
            registry.tags.entry(tag).or_default().extend(ids);
        }
        tracing::debug!(types = registry.types.len(), tags = registry.tags.len(), "POI registry built");
        Ok(registry)
    }
}

#[derive(Debug, Default)]
pub struct PoiRegistry {
    types: Vec<PoiType>,
    by_name: HashMap<String, PoiTypeId>,
    by_state: HashMap<BlockStateId, PoiTypeId>,
    tags: HashMap<String, HashSet<PoiTypeId>>,
}

impl PoiRegistry {
    pub fn builder() -> PoiRegistryBuilder {
        PoiRegistryBuilder::default()
    }

    pub fn get(&self, id: PoiTypeId) -> Option<&PoiType> {
        self.types.get(id.0 as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<PoiTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: PoiTypeId) -> Option<&str> {
        self.get(id).map(|t| t.name.as_str())
    }

    /// The type a block state marks as a POI, if any.
    pub fn for_state(&self, state: BlockStateId) -> Option<PoiTypeId> {
        self.by_state.get(&state).copied()
    }

    pub fn is_poi_state(&self, state: BlockStateId) -> bool {
        self.by_state.contains_key(&state)
    }

    pub fn has_tag(&self, id: PoiTypeId, tag: &str) -> bool {
        self.tags.get(tag).is_some_and(|ids| ids.contains(&id))
    }

    pub fn types(&self) -> impl Iterator<Item = &PoiType> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
