//! # Render Dependency Graph
//!
//! Rendering work is described as a graph of [`Target`]s: render goals that list the
//! steps producing them (scene draws, clears, hits of other targets) and the targets
//! they depend on. Hitting a target runs its whole dependency closure in dependency
//! order, each member exactly once, with every target's base state pushed around its
//! steps.
//!
//! ## Execution
//!
//! ```text
//! hit(T1)  deps: T1 -> T2 -> T3
//!   closure {T1, T2, T3}
//!   pass 1: ready {T3}  -> execute
//!   pass 2: ready {T2}  -> execute
//!   pass 3: ready {T1}  -> execute
//! ```
//!
//! Everything a step needs is borrowed through a [`Frame`], so the graph itself never
//! owns the scene, the pools or the device.

pub mod draw_op;
pub mod target;

pub use draw_op::{DrawOp, DrawReport};
pub use target::{ClearOp, HitReport, Step, Target, TargetGraph};

use crate::core::DrawConfig;
use crate::render::{PoolSet, RenderContext};
use crate::scene::SceneGraph;

/// Borrowed engine state for one round of execution
pub struct Frame<'a> {
    /// Scene the draw operations read
    pub scene: &'a SceneGraph,
    /// Buffer pools the draw operations feed
    pub pools: &'a mut PoolSet,
    /// Device and state stack
    pub ctx: &'a mut RenderContext,
    /// Culling and commit limits
    pub config: &'a DrawConfig,
}

impl<'a> Frame<'a> {
    /// Bundle borrowed engine state
    pub fn new(
        scene: &'a SceneGraph,
        pools: &'a mut PoolSet,
        ctx: &'a mut RenderContext,
        config: &'a DrawConfig,
    ) -> Self {
        Self { scene, pools, ctx, config }
    }
}
