//! # Rendering System
//!
//! Everything that talks to the graphics device lives here: the device trait and its
//! headless implementation, the mesh payloads, the generational buffer pools that
//! back meshes with shared GPU buffers, and the state machinery that turns a stack of
//! [`RenderState`]s into the minimum number of device calls.
//!
//! ## Architecture
//!
//! - **Device**: [`GraphicsDevice`] is the only path to the GPU; [`HeadlessDevice`]
//!   implements it in memory
//! - **Buffers**: [`GpuBuffer`] pairs a device buffer with an [`IntervalSet`](crate::memory::IntervalSet)
//!   of its free space
//! - **Pools**: [`BufferPool`] groups meshes into generations and commits each
//!   generation with one allocation per buffer kind, evicting the oldest generation
//!   under memory pressure
//! - **State**: [`RenderState`] values are composed on the [`RenderContext`] stack and
//!   entered with redundant calls elided
//!
//! ## Error Model
//!
//! Out-of-memory while committing a generation is handled inside the pool. Everything
//! else surfaces as a [`RenderError`]; contract violations are typed errors rather
//! than panics.

pub mod device;
pub mod headless;
pub mod mesh;
pub mod buffer;
pub mod buffer_pool;
pub mod state;
pub mod context;

pub use device::{
    BufferId, BufferKind, ColorTargetId, DeviceError, DeviceResult, DrawCall, GraphicsDevice, ShaderId,
};
pub use headless::{DeviceCall, HeadlessDevice};
pub use mesh::{FormatId, IndexType, Mesh, MeshId, VertexFormat};
pub use buffer::{GpuBuffer, Span};
pub use buffer_pool::{BufferPool, CommitReport, GenerationId, MeshBacking, PoolSet, PoolStats};
pub use state::{BlendMode, MaterialId, RenderState, StateFlags, UniformBag, UniformValue};
pub use context::{ContextStats, RenderContext};

use crate::config::ConfigError;
use crate::foundation::collections::{CameraId, NodeId, TargetId};
use crate::memory::IntervalError;

/// Rendering system error types
///
/// Every fallible operation of the render core reports one of these. Device and
/// interval errors are wrapped unchanged so callers can still match on the cause.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// The graphics device reported an error
    ///
    /// Out-of-memory reaching this level means the caller allocated outside a pool;
    /// pools handle it internally.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Configuration failed to load or validate
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Free-space bookkeeping was asked to do something impossible
    ///
    /// Indicates a double free or a release of space that was never allocated.
    #[error("Interval error: {0}")]
    Interval(#[from] IntervalError),

    /// A generation could not be committed even after evicting every older one
    #[error("Out of GPU memory: {requested} bytes requested with {generations} generation(s) left")]
    OutOfMemory {
        /// Bytes the failed allocation asked for
        requested: u64,
        /// Generations still resident when the pool gave up
        generations: usize,
    },

    /// A mesh was given to a pool of a different vertex format
    #[error("Vertex format mismatch: pool uses {expected:?}, mesh uses {actual:?}")]
    FormatMismatch {
        /// Format of the pool
        expected: FormatId,
        /// Format of the mesh
        actual: FormatId,
    },

    /// Mesh payload does not match its declared counts or format
    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    /// `pop_state` was called with nothing on the stack
    #[error("State stack underflow")]
    StateStackUnderflow,

    /// The dependency closure of a hit contains a cycle
    ///
    /// Carries the targets that could never become ready.
    #[error("Dependency cycle between targets {targets:?}")]
    DependencyCycle {
        /// Targets left unscheduled
        targets: Vec<TargetId>,
    },

    /// A target was hit while it was already executing
    #[error("Target {0:?} hit while already in progress")]
    RecursiveHit(TargetId),

    /// Target handle does not resolve
    #[error("Unknown target {0:?}")]
    UnknownTarget(TargetId),

    /// Camera handle does not resolve
    #[error("Unknown camera {0:?}")]
    UnknownCamera(CameraId),

    /// Scene node handle does not resolve
    #[error("Unknown scene node {0:?}")]
    UnknownNode(NodeId),

    /// Reparenting would detach the root or put a node under its own subtree
    #[error("Cannot move scene node {node:?} under {parent:?}")]
    InvalidReparent {
        /// Node being moved
        node: NodeId,
        /// Requested parent
        parent: NodeId,
    },

    /// A draw operation stopped making progress
    ///
    /// Raised when a commit/draw pass draws nothing, or the pass limit is reached,
    /// while meshes are still waiting.
    #[error("Draw stalled with {remaining} mesh(es) undrawn")]
    CommitStalled {
        /// Drawables left undrawn
        remaining: usize,
    },

    /// Internal bookkeeping no longer holds together
    ///
    /// Only reported by the consistency checks run in debug mode.
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
