//! # Core Engine Module
//!
//! Shared configuration for every subsystem of the render core.
//!
//! ## Organization
//!
//! - **Config**: Unified configuration tree for pools, draw operations and the device
//! - **Foundation**: Low-level utilities (math, handles, logging)

pub mod config;

// Re-export foundation modules for convenience
pub use crate::foundation;

// Re-export commonly used config types
pub use config::{
    RenderCoreConfig,
    EngineConfig,
    PoolConfig,
    DrawConfig,
    DeviceConfig,
    Config,
    ConfigError,
};
