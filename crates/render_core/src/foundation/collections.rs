//! Handle types for arena-owned engine objects
//!
//! Scene nodes, cameras, render targets and pooled GPU buffers live in `SlotMap`
//! arenas. Their keys are stable, generation-checked handles: a key to a removed
//! object simply stops resolving instead of aliasing a new one.

pub use slotmap::{SlotMap, SecondaryMap};

slotmap::new_key_type! {
    /// Handle to a node in a [`SceneGraph`](crate::scene::SceneGraph)
    pub struct NodeId;

    /// Handle to a camera registered with a [`SceneGraph`](crate::scene::SceneGraph)
    pub struct CameraId;

    /// Handle to a [`Target`](crate::graph::Target) in a [`TargetGraph`](crate::graph::TargetGraph)
    pub struct TargetId;

    /// Handle to a GPU buffer owned by a [`BufferPool`](crate::render::BufferPool)
    pub struct BufferKey;
}
