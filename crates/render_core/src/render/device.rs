//! Graphics device abstraction
//!
//! This module defines the trait the render core talks to. It models one stateful,
//! immediate-mode device with a single current context: every call takes effect
//! immediately, in call order, and the device keeps its toggles, bindings and
//! uniforms until they are changed again.
//!
//! Buffer allocation is the only call that may fail *recoverably*
//! ([`DeviceError::OutOfMemory`]); buffer pools react to it by evicting old
//! generations. Every other error is treated as fatal by the caller.

use std::any::Any;
use super::state::{BlendMode, StateFlags, UniformValue};
use super::mesh::IndexType;

/// Device handle of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Device handle of a compiled shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(pub u32);

/// Device handle of a color render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorTargetId(pub u32);

impl ColorTargetId {
    /// The default framebuffer
    pub const SCREEN: ColorTargetId = ColorTargetId(0);
}

/// What a buffer stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex attributes
    Vertex,
    /// Element (index) data
    Element,
}

/// Parameters of one indexed draw call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    /// Buffer holding the vertices
    pub vertex_buffer: BufferId,
    /// Byte offset of the first vertex
    pub vertex_offset: u64,
    /// Bytes per vertex
    pub vertex_stride: u32,
    /// Buffer holding the indices
    pub element_buffer: BufferId,
    /// Byte offset of the first index
    pub element_offset: u64,
    /// Number of indices to draw
    pub index_count: u32,
    /// Width of each index
    pub index_type: IndexType,
}

/// Errors reported by a graphics device
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Not enough device memory for the allocation; the caller may free memory and retry
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
        /// Bytes still available
        available: u64,
    },

    /// The buffer handle does not name a live buffer
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),

    /// A write or draw would reach past the end of a buffer
    #[error("access [{offset}, +{len}) is outside buffer {buffer:?} of {capacity} bytes")]
    OutOfRange {
        /// Buffer accessed
        buffer: BufferId,
        /// Start of the access
        offset: u64,
        /// Length of the access
        len: u64,
        /// Size of the buffer
        capacity: u64,
    },

    /// Unrecoverable device failure
    #[error("device failure: {0}")]
    Fatal(String),
}

/// Result type for device calls
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Stateful immediate-mode graphics device
///
/// Implementations own the real API context. The render core never caches device
/// handles beyond what this trait returns, and never calls it from more than one
/// thread.
pub trait GraphicsDevice {
    /// Allocate a buffer of exactly `size` bytes
    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DeviceResult<BufferId>;

    /// Release a buffer and its memory
    fn destroy_buffer(&mut self, buffer: BufferId) -> DeviceResult<()>;

    /// Copy `data` into a buffer at `offset`
    fn upload(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// Issue one indexed draw with the currently bound state
    fn draw_indexed(&mut self, call: &DrawCall) -> DeviceResult<()>;

    /// Enable or disable one toggle (`flag` holds exactly one bit)
    fn set_flag(&mut self, flag: StateFlags, enabled: bool) -> DeviceResult<()>;

    /// Change the blend mode (never called with `BlendMode::DontCare`)
    fn set_blend(&mut self, mode: BlendMode) -> DeviceResult<()>;

    /// Make a shader program current
    fn bind_shader(&mut self, shader: ShaderId) -> DeviceResult<()>;

    /// Make a color target current
    fn bind_color_target(&mut self, target: ColorTargetId) -> DeviceResult<()>;

    /// Set a uniform of the current shader
    fn set_uniform(&mut self, name: &str, value: &UniformValue) -> DeviceResult<()>;

    /// Clear the current color target and/or the depth buffer
    fn clear(&mut self, color: Option<[f32; 4]>, depth: Option<f32>) -> DeviceResult<()>;

    /// Bytes of buffer memory currently allocated
    fn memory_used(&self) -> u64;

    /// Downcast to the concrete device type
    fn as_any(&self) -> &dyn Any;

    /// Downcast to the concrete device type mutably
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
