//! # Render Core
//!
//! The core of a real-time 3D renderer layered over a stateful, immediate-mode
//! graphics device.
//!
//! ## Features
//!
//! - **Generational Buffer Pools**: meshes share large device buffers, committed one
//!   generation at a time and evicted oldest-first under memory pressure
//! - **Aggregated State**: a stack of [`RenderState`](render::RenderState)s is
//!   composed into one effective state and entered with redundant device calls elided
//! - **Render Targets**: a dependency graph of render goals executed in dependency
//!   order, each exactly once per hit
//! - **Headless Device**: an in-memory device that records every call, for tests
//!   and tools
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::headless(RenderCoreConfig::default())?;
//!
//!     let camera = engine.scene.add_camera(Camera::default());
//!     let root = engine.scene.root();
//!
//!     let main = engine.targets.create("main");
//!     engine.targets.add_step(main, Step::Clear(ClearOp::new([0.0, 0.0, 0.0, 1.0], 1.0)))?;
//!     engine.targets.add_step(main, Step::Draw(DrawOp::new(root, camera)))?;
//!
//!     engine.render_frame(&[main])?;
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Core engine modules
pub mod core;
pub mod config;

pub mod foundation;
pub mod memory;
pub mod render;
pub mod scene;
pub mod graph;

mod engine;

pub use engine::{Engine, FrameReport};
pub use render::{RenderError, RenderResult};

/// Common imports for render core users
pub mod prelude {
    pub use crate::{
        Engine, FrameReport,
        RenderError, RenderResult,
        foundation::{
            collections::{CameraId, NodeId, TargetId},
            math::{Vec3, Mat4, Transform},
        },
        memory::IntervalSet,
        render::{
            BlendMode, ColorTargetId, FormatId, GraphicsDevice, HeadlessDevice, IndexType,
            MaterialId, Mesh, RenderContext, RenderState, ShaderId, StateFlags, UniformValue,
            VertexFormat,
        },
        scene::{Camera, Drawable, SceneGraph},
        graph::{ClearOp, DrawOp, Step, TargetGraph},
        core::config::{RenderCoreConfig, PoolConfig, DrawConfig, DeviceConfig, Config},
    };
}
