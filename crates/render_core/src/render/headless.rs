//! Headless graphics device
//!
//! [`HeadlessDevice`] implements [`GraphicsDevice`] entirely in memory. It keeps a
//! shadow copy of every buffer, tracks the toggles and bindings a real device would
//! hold, enforces an optional memory budget, and records every call it receives so
//! that tests and tools can inspect exactly what the render core asked for.

use std::any::Any;
use std::collections::HashMap;
use crate::core::DeviceConfig;
use super::device::{
    BufferId, BufferKind, ColorTargetId, DeviceError, DeviceResult, DrawCall, GraphicsDevice, ShaderId,
};
use super::state::{BlendMode, StateFlags, UniformValue};

/// One recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    /// A buffer was created
    CreateBuffer {
        /// New handle
        id: BufferId,
        /// What the buffer stores
        kind: BufferKind,
        /// Size in bytes
        size: u64,
    },
    /// A buffer was destroyed
    DestroyBuffer(BufferId),
    /// Bytes were copied into a buffer
    Upload {
        /// Target buffer
        buffer: BufferId,
        /// Destination offset
        offset: u64,
        /// Number of bytes written
        len: u64,
    },
    /// An indexed draw was issued
    DrawIndexed(DrawCall),
    /// A toggle was changed
    SetFlag {
        /// The single flag changed
        flag: StateFlags,
        /// New value
        enabled: bool,
    },
    /// The blend mode was changed
    SetBlend(BlendMode),
    /// A shader was bound
    BindShader(ShaderId),
    /// A color target was bound
    BindColorTarget(ColorTargetId),
    /// A uniform was written
    SetUniform {
        /// Uniform name
        name: String,
        /// Value written
        value: UniformValue,
    },
    /// The current target was cleared
    Clear {
        /// Clear color, if the color buffer was cleared
        color: Option<[f32; 4]>,
        /// Clear depth, if the depth buffer was cleared
        depth: Option<f32>,
    },
}

#[derive(Debug)]
struct ShadowBuffer {
    kind: BufferKind,
    data: Vec<u8>,
}

/// In-memory device that records every call
#[derive(Debug)]
pub struct HeadlessDevice {
    buffers: HashMap<BufferId, ShadowBuffer>,
    next_buffer: u64,
    memory_used: u64,
    memory_budget: Option<u64>,
    fail_allocations: bool,
    record_calls: bool,
    calls: Vec<DeviceCall>,
    flags: StateFlags,
    blend: Option<BlendMode>,
    shader: Option<ShaderId>,
    color_target: ColorTargetId,
    uniforms: HashMap<String, UniformValue>,
    draw_count: u64,
}

impl HeadlessDevice {
    /// Create a device with unlimited memory
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_buffer: 1,
            memory_used: 0,
            memory_budget: None,
            fail_allocations: false,
            record_calls: true,
            calls: Vec::new(),
            flags: StateFlags::empty(),
            blend: None,
            shader: None,
            color_target: ColorTargetId::SCREEN,
            uniforms: HashMap::new(),
            draw_count: 0,
        }
    }

    /// Create a device from configuration
    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut device = Self::new();
        device.memory_budget = config.memory_budget_bytes;
        device
    }

    /// Limit the total bytes of buffer memory
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Change the memory budget (`None` = unlimited)
    pub fn set_memory_budget(&mut self, bytes: Option<u64>) {
        self.memory_budget = bytes;
    }

    /// Make every buffer allocation report out-of-memory
    pub fn set_fail_allocations(&mut self, fail: bool) {
        self.fail_allocations = fail;
    }

    /// Turn call recording on or off (long-running tools switch it off)
    pub fn set_recording(&mut self, record: bool) {
        self.record_calls = record;
    }

    /// Calls recorded since creation or the last [`clear_calls`](Self::clear_calls)
    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    /// Take the recorded calls, leaving the log empty
    pub fn take_calls(&mut self) -> Vec<DeviceCall> {
        std::mem::take(&mut self.calls)
    }

    /// Forget recorded calls
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Shadow contents of a live buffer
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|shadow| shadow.data.as_slice())
    }

    /// Kind of a live buffer
    pub fn buffer_kind(&self, buffer: BufferId) -> Option<BufferKind> {
        self.buffers.get(&buffer).map(|shadow| shadow.kind)
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Total indexed draws issued
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    /// Currently enabled toggles
    pub fn enabled_flags(&self) -> StateFlags {
        self.flags
    }

    /// Current blend mode, `None` until first set
    pub fn blend(&self) -> Option<BlendMode> {
        self.blend
    }

    /// Currently bound shader
    pub fn bound_shader(&self) -> Option<ShaderId> {
        self.shader
    }

    /// Currently bound color target
    pub fn bound_color_target(&self) -> ColorTargetId {
        self.color_target
    }

    /// Current value of a uniform of the bound shader
    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    fn record(&mut self, call: DeviceCall) {
        if self.record_calls {
            self.calls.push(call);
        }
    }

    fn shadow(&self, buffer: BufferId) -> DeviceResult<&ShadowBuffer> {
        self.buffers.get(&buffer).ok_or(DeviceError::UnknownBuffer(buffer))
    }

    fn check_range(&self, buffer: BufferId, offset: u64, len: u64) -> DeviceResult<()> {
        let capacity = self.shadow(buffer)?.data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(DeviceError::OutOfRange { buffer, offset, len, capacity });
        }
        Ok(())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DeviceResult<BufferId> {
        let available = self
            .memory_budget
            .map_or(u64::MAX, |budget| budget.saturating_sub(self.memory_used));

        if self.fail_allocations || size > available {
            log::trace!("Headless allocation of {} bytes refused ({} available)", size, available);
            return Err(DeviceError::OutOfMemory { requested: size, available });
        }

        let len = usize::try_from(size)
            .map_err(|_| DeviceError::Fatal(format!("buffer of {size} bytes exceeds host memory")))?;

        let id = BufferId(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(id, ShadowBuffer { kind, data: vec![0; len] });
        self.memory_used += size;
        self.record(DeviceCall::CreateBuffer { id, kind, size });
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> DeviceResult<()> {
        let shadow = self.buffers.remove(&buffer).ok_or(DeviceError::UnknownBuffer(buffer))?;
        self.memory_used -= shadow.data.len() as u64;
        self.record(DeviceCall::DestroyBuffer(buffer));
        Ok(())
    }

    fn upload(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let len = data.len() as u64;
        self.check_range(buffer, offset, len)?;

        if let Some(shadow) = self.buffers.get_mut(&buffer) {
            // check_range guarantees both conversions fit
            let start = offset as usize;
            shadow.data[start..start + data.len()].copy_from_slice(data);
        }
        self.record(DeviceCall::Upload { buffer, offset, len });
        Ok(())
    }

    fn draw_indexed(&mut self, call: &DrawCall) -> DeviceResult<()> {
        self.shadow(call.vertex_buffer)?;
        let index_bytes = u64::from(call.index_count) * u64::from(call.index_type.size());
        self.check_range(call.element_buffer, call.element_offset, index_bytes)?;

        self.draw_count += 1;
        self.record(DeviceCall::DrawIndexed(*call));
        Ok(())
    }

    fn set_flag(&mut self, flag: StateFlags, enabled: bool) -> DeviceResult<()> {
        if flag.bits().count_ones() != 1 {
            return Err(DeviceError::Fatal(format!("set_flag expects a single flag, got {flag:?}")));
        }
        self.flags.set(flag, enabled);
        self.record(DeviceCall::SetFlag { flag, enabled });
        Ok(())
    }

    fn set_blend(&mut self, mode: BlendMode) -> DeviceResult<()> {
        if mode == BlendMode::DontCare {
            return Err(DeviceError::Fatal("DontCare is not a device blend mode".to_string()));
        }
        self.blend = Some(mode);
        self.record(DeviceCall::SetBlend(mode));
        Ok(())
    }

    fn bind_shader(&mut self, shader: ShaderId) -> DeviceResult<()> {
        if self.shader != Some(shader) {
            // Uniform values belong to the program they were set on
            self.uniforms.clear();
        }
        self.shader = Some(shader);
        self.record(DeviceCall::BindShader(shader));
        Ok(())
    }

    fn bind_color_target(&mut self, target: ColorTargetId) -> DeviceResult<()> {
        self.color_target = target;
        self.record(DeviceCall::BindColorTarget(target));
        Ok(())
    }

    fn set_uniform(&mut self, name: &str, value: &UniformValue) -> DeviceResult<()> {
        self.uniforms.insert(name.to_string(), value.clone());
        self.record(DeviceCall::SetUniform { name: name.to_string(), value: value.clone() });
        Ok(())
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: Option<f32>) -> DeviceResult<()> {
        self.record(DeviceCall::Clear { color, depth });
        Ok(())
    }

    fn memory_used(&self) -> u64 {
        self.memory_used
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Test device that breaks on its first draw
///
/// The draw itself fails, and so does every later state change, which lets tests
/// observe how errors raised while unwinding the state stack are reported.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct BrittleDevice {
    inner: HeadlessDevice,
    broken: bool,
}

#[cfg(test)]
impl BrittleDevice {
    fn refuse(&self, what: &str) -> DeviceResult<()> {
        if self.broken {
            return Err(DeviceError::Fatal(format!("{what} refused")));
        }
        Ok(())
    }
}

#[cfg(test)]
impl GraphicsDevice for BrittleDevice {
    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> DeviceResult<BufferId> {
        self.inner.create_buffer(kind, size)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> DeviceResult<()> {
        self.inner.destroy_buffer(buffer)
    }

    fn upload(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.inner.upload(buffer, offset, data)
    }

    fn draw_indexed(&mut self, _call: &DrawCall) -> DeviceResult<()> {
        self.broken = true;
        self.refuse("draw")
    }

    fn set_flag(&mut self, flag: StateFlags, enabled: bool) -> DeviceResult<()> {
        self.refuse("flag change")?;
        self.inner.set_flag(flag, enabled)
    }

    fn set_blend(&mut self, mode: BlendMode) -> DeviceResult<()> {
        self.refuse("blend change")?;
        self.inner.set_blend(mode)
    }

    fn bind_shader(&mut self, shader: ShaderId) -> DeviceResult<()> {
        self.refuse("shader bind")?;
        self.inner.bind_shader(shader)
    }

    fn bind_color_target(&mut self, target: ColorTargetId) -> DeviceResult<()> {
        self.refuse("target bind")?;
        self.inner.bind_color_target(target)
    }

    fn set_uniform(&mut self, name: &str, value: &UniformValue) -> DeviceResult<()> {
        self.inner.set_uniform(name, value)
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: Option<f32>) -> DeviceResult<()> {
        self.inner.clear(color, depth)
    }

    fn memory_used(&self) -> u64 {
        self.inner.memory_used()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::mesh::IndexType;

    #[test]
    fn test_budget_is_enforced() {
        let mut device = HeadlessDevice::new().with_memory_budget(100);

        let a = device.create_buffer(BufferKind::Vertex, 60).unwrap();
        assert_eq!(
            device.create_buffer(BufferKind::Element, 60),
            Err(DeviceError::OutOfMemory { requested: 60, available: 40 })
        );

        device.destroy_buffer(a).unwrap();
        assert_eq!(device.memory_used(), 0);
        assert!(device.create_buffer(BufferKind::Element, 60).is_ok());
    }

    #[test]
    fn test_upload_writes_shadow_copy() {
        let mut device = HeadlessDevice::new();
        let buffer = device.create_buffer(BufferKind::Vertex, 8).unwrap();

        device.upload(buffer, 2, &[1, 2, 3]).unwrap();
        assert_eq!(device.buffer_contents(buffer), Some(&[0, 0, 1, 2, 3, 0, 0, 0][..]));

        assert!(matches!(
            device.upload(buffer, 6, &[9, 9, 9]),
            Err(DeviceError::OutOfRange { .. })
        ));
        assert_eq!(device.upload(BufferId(99), 0, &[1]), Err(DeviceError::UnknownBuffer(BufferId(99))));
    }

    #[test]
    fn test_draw_checks_element_range() {
        let mut device = HeadlessDevice::new();
        let vertices = device.create_buffer(BufferKind::Vertex, 36).unwrap();
        let elements = device.create_buffer(BufferKind::Element, 6).unwrap();

        let mut call = DrawCall {
            vertex_buffer: vertices,
            vertex_offset: 0,
            vertex_stride: 12,
            element_buffer: elements,
            element_offset: 0,
            index_count: 3,
            index_type: IndexType::U16,
        };
        device.draw_indexed(&call).unwrap();
        assert_eq!(device.draw_count(), 1);

        call.index_type = IndexType::U32;
        assert!(device.draw_indexed(&call).is_err());
    }

    #[test]
    fn test_records_state_calls_in_order() {
        let mut device = HeadlessDevice::new();
        device.set_flag(StateFlags::DEPTH_TEST, true).unwrap();
        device.bind_shader(ShaderId(3)).unwrap();
        device.set_uniform("tint", &UniformValue::Float(0.5)).unwrap();

        assert_eq!(device.calls(), &[
            DeviceCall::SetFlag { flag: StateFlags::DEPTH_TEST, enabled: true },
            DeviceCall::BindShader(ShaderId(3)),
            DeviceCall::SetUniform { name: "tint".to_string(), value: UniformValue::Float(0.5) },
        ]);

        device.bind_shader(ShaderId(4)).unwrap();
        assert_eq!(device.uniform("tint"), None);
        assert!(device.set_flag(StateFlags::DEPTH_TEST | StateFlags::CULL_FACE, true).is_err());
    }
}
