//! # Unified Configuration System
//!
//! All tunables of the render core live in one serializable tree so an application
//! can ship a single TOML or RON file.
//!
//! ## Configuration Categories
//!
//! - **Engine Config**: logging and debug behaviour
//! - **Pool Config**: generation eviction limits for buffer pools
//! - **Draw Config**: distance culling and commit-pass limits for draw operations
//! - **Device Config**: settings for the headless device (memory budget)

use serde::{Serialize, Deserialize};

pub use crate::config::{Config, ConfigError};

/// # Engine Configuration
///
/// Core engine behaviour that affects every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default log filter, used when `RUST_LOG` is unset
    pub log_level: String,
    /// Check buffer pool consistency after every frame
    pub debug_mode: bool,
}

impl EngineConfig {
    /// Create a new engine configuration
    pub fn new() -> Self {
        Self {
            log_level: "info".to_string(),
            debug_mode: cfg!(debug_assertions),
        }
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable debug mode
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// # Buffer Pool Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on generations evicted by a single commit
    ///
    /// `None` evicts until the allocation succeeds or one generation remains.
    pub max_evictions_per_commit: Option<u32>,
    /// Destroy device buffers as soon as eviction or reaping leaves them empty
    pub reap_empty_buffers: bool,
}

impl PoolConfig {
    /// Create a pool configuration with unbounded eviction
    pub fn new() -> Self {
        Self {
            max_evictions_per_commit: None,
            reap_empty_buffers: true,
        }
    }


    /// Limit evictions per commit
    pub fn with_max_evictions(mut self, limit: u32) -> Self {
        self.max_evictions_per_commit = Some(limit);
        self
    }

    /// Keep emptied buffers alive for reuse by later commits
    pub fn with_buffer_reuse(mut self) -> Self {
        self.reap_empty_buffers = false;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// # Draw Operation Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawConfig {
    /// Draw distance for nodes that do not set their own (`None` = unlimited)
    pub default_draw_distance: Option<f32>,
    /// Maximum commit/draw passes one draw operation may take
    pub max_commit_passes: u32,
}

impl DrawConfig {
    /// Create a draw configuration with unlimited distance
    pub fn new() -> Self {
        Self {
            default_draw_distance: None,
            max_commit_passes: 4,
        }
    }

    /// Set the fallback draw distance
    pub fn with_draw_distance(mut self, distance: f32) -> Self {
        self.default_draw_distance = Some(distance);
        self
    }
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// # Headless Device Configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Total bytes of buffer memory the device may hand out (`None` = unlimited)
    pub memory_budget_bytes: Option<u64>,
}

impl DeviceConfig {
    /// Set the memory budget
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = Some(bytes);
        self
    }
}

/// # Complete Render Core Configuration
///
/// Top-level configuration that encompasses all subsystems. This is the structure
/// applications should load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderCoreConfig {
    /// Engine core configuration
    pub engine: EngineConfig,
    /// Buffer pool configuration
    pub pools: PoolConfig,
    /// Draw operation configuration
    pub draw: DrawConfig,
    /// Headless device configuration
    pub device: DeviceConfig,
}

impl Config for RenderCoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid("log level cannot be empty".to_string()));
        }

        if self.draw.max_commit_passes == 0 {
            return Err(ConfigError::Invalid("max commit passes must be at least 1".to_string()));
        }

        if let Some(distance) = self.draw.default_draw_distance {
            if !(distance.is_finite() && distance > 0.0) {
                return Err(ConfigError::Invalid(format!("draw distance must be positive, got {distance}")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RenderCoreConfig {
        RenderCoreConfig {
            engine: EngineConfig::new().with_log_level("debug").with_debug(true),
            pools: PoolConfig::default().with_max_evictions(3),
            draw: DrawConfig::new().with_draw_distance(250.0),
            device: DeviceConfig::default().with_memory_budget(1 << 20),
        }
    }

    #[test]
    fn test_toml_round_trip() {
        let config = sample();
        let text = config.to_toml_string().unwrap();
        assert_eq!(RenderCoreConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = sample();
        let text = config.to_ron_string().unwrap();
        assert_eq!(RenderCoreConfig::from_ron_str(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RenderCoreConfig::from_toml_str("[draw]\nmax_commit_passes = 2\n").unwrap();
        assert_eq!(config.draw.max_commit_passes, 2);
        assert_eq!(config.draw.default_draw_distance, None);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_validation_rejects_zero_passes() {
        let result = RenderCoreConfig::from_toml_str("[draw]\nmax_commit_passes = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let result = RenderCoreConfig::load_from_file("render.yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
