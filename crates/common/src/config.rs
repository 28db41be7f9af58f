//! Runtime configuration for the storage core.
//!
//! Loaded from JSON; every field has a default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub world: WorldBounds,
    pub region: RegionConfig,
    pub flush: FlushConfig,
    pub poi: PoiConfig,
    pub backoff: BackoffConfig,
    pub entities: EntityPadding,
    pub stream: StreamConfig,
}

/// Vertical section bounds of the world accessor (max is exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldBounds {
    pub min_section: i32,
    pub max_section: i32,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min_section: -4,
            max_section: 20,
        }
    }
}

impl WorldBounds {
    pub fn sections(&self) -> std::ops::Range<i32> {
        self.min_section..self.max_section
    }

    pub fn contains_section(&self, y: i32) -> bool {
        self.sections().contains(&y)
    }

    pub fn min_block_y(&self) -> i32 {
        self.min_section * 16
    }

    /// One past the highest block y.
    pub fn max_block_y(&self) -> i32 {
        self.max_section * 16
    }
}

/// Payload compression used for new writes. Reads accept every known tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Zstd,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Maximum simultaneously open region files.
    pub cache_size: usize,
    /// fsync after every write.
    pub sync_writes: bool,
    pub compression: CompressionKind,
    pub zstd_level: i32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            sync_writes: false,
            compression: CompressionKind::Zstd,
            zstd_level: 3,
        }
    }
}

/// Per-tick save budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub max_columns_per_tick: usize,
    pub budget_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_columns_per_tick: 64,
            budget_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoiConfig {
    /// Deepest level the distance field stores; farther sections report
    /// `max_depth + 1`.
    pub max_depth: u8,
    /// Default search radius in blocks.
    pub search_radius: i32,
    /// Candidates gathered per acquire attempt.
    pub batch_size: usize,
}

impl Default for PoiConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            search_radius: 48,
            batch_size: 5,
        }
    }
}

/// Jittered linear retry timings, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_increase: u32,
    pub max_increase: u32,
    pub max_delay: u32,
    /// Entries whose last attempt is this old are dropped.
    pub stale_after: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_increase: 40,
            max_increase: 80,
            max_delay: 400,
            stale_after: 400,
        }
    }
}

/// Margin added around entity queries before converting to sections, so
/// entities whose origin sits in a neighbouring section are still found.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPadding {
    pub horizontal: f64,
    pub below: f64,
    pub above: f64,
}

impl Default for EntityPadding {
    fn default() -> Self {
        Self {
            horizontal: 2.0,
            below: 4.0,
            above: 0.0,
        }
    }
}

/// Column streaming radii and per-update budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Radius (in chunks) around the viewer whose columns are accessible.
    pub active_radius: i32,
    /// Radius (in chunks) around the viewer whose columns are tracked.
    pub preload_radius: i32,
    pub load_budget: usize,
    pub unload_budget: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            active_radius: 2,
            preload_radius: 4,
            load_budget: 4,
            unload_budget: 4,
        }
    }
}

impl StrataConfig {
    /// Read a JSON config file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: StrataConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: StrataConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world.min_section >= self.world.max_section {
            return Err(ConfigError::Invalid {
                field: "world",
                reason: format!(
                    "min_section {} must be below max_section {}",
                    self.world.min_section, self.world.max_section
                ),
            });
        }
        if self.region.cache_size == 0 {
            return Err(ConfigError::Invalid {
                field: "region.cache_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.poi.max_depth == 0 || self.poi.max_depth > 254 {
            return Err(ConfigError::Invalid {
                field: "poi.max_depth",
                reason: format!("{} not in 1..=254", self.poi.max_depth),
            });
        }
        if self.poi.search_radius < 0 {
            return Err(ConfigError::Invalid {
                field: "poi.search_radius",
                reason: "must not be negative".into(),
            });
        }
        if self.backoff.min_increase > self.backoff.max_increase {
            return Err(ConfigError::Invalid {
                field: "backoff",
                reason: "min_increase exceeds max_increase".into(),
            });
        }
        if self.stream.active_radius > self.stream.preload_radius {
            return Err(ConfigError::Invalid {
                field: "stream",
                reason: "active_radius exceeds preload_radius".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StrataConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poi.max_depth, 6);
        assert_eq!(config.backoff.max_delay, 400);
        assert_eq!(config.world.sections().len(), 24);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = StrataConfig::from_json(r#"{ "poi": { "max_depth": 3 } }"#).unwrap();
        assert_eq!(config.poi.max_depth, 3);
        assert_eq!(config.poi.search_radius, 48);
        assert_eq!(config.region.cache_size, 256);
    }

    #[test]
    fn compression_parses_lowercase() {
        let config =
            StrataConfig::from_json(r#"{ "region": { "compression": "none" } }"#).unwrap();
        assert_eq!(config.region.compression, CompressionKind::None);
    }

    #[test]
    fn invalid_depth_rejected() {
        let result = StrataConfig::from_json(r#"{ "poi": { "max_depth": 0 } }"#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "poi.max_depth",
                ..
            })
        ));
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("strata.json");
        std::fs::write(&path, r#"{ "world": { "min_section": 0, "max_section": 16 } }"#).unwrap();
        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.world.min_block_y(), 0);
        assert_eq!(config.world.max_block_y(), 256);
    }
}
