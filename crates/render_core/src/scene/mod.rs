//! Scene management system
//!
//! The scene is what draw operations look at: a tree of transformable nodes, some of
//! which carry meshes, plus the cameras they are viewed through.
//!
//! ## Architecture
//!
//! ```text
//! SceneGraph (nodes + cameras)
//!      ↓ SceneWalker (pre-order, skip-children)
//! DrawOp (distance culling, pool feeding)
//!      ↓
//! RenderContext / BufferPool (device)
//! ```

mod scene_graph;
mod camera;

pub use scene_graph::{Drawable, SceneGraph, SceneNode, SceneWalker, WalkEntry};
pub use camera::{Camera, Projection};
