//! The explicit "currently active" device state
//!
//! A [`RenderContext`] owns the graphics device together with everything the render
//! core knows about its current state: the stack of pushed [`RenderState`]s, their
//! aggregate, and what has actually been sent to the device. Passing the context by
//! reference replaces process-wide globals, so independent contexts can coexist.
//!
//! # State Stack
//!
//! ```text
//! push(B)          stack: [A, B]
//!   aggregate      B.underlay(A)
//!   enter          diff against the device, emit only what changed
//! pop()            stack: [A]  -> aggregate A, enter
//! ```
//!
//! Entering never resets anything a state does not care about: bits nobody cares
//! about keep whatever value the device already has.
//!
//! # Mutation
//!
//! States are shared as `Rc<RenderState>`. Changing a state that is on the stack goes
//! through [`RenderContext::update_state`] or [`RenderContext::set_uniform`], which
//! copy the state on write, swap the copy into the stack and bring the device up to
//! date before returning.

use std::collections::HashMap;
use std::rc::Rc;
use super::device::{ColorTargetId, GraphicsDevice, ShaderId};
use super::state::{BlendMode, MaterialId, RenderState, StateFlags, UniformValue};
use super::{RenderError, RenderResult};

/// Counters of device work issued and avoided
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// States entered (one per push, pop and in-place update)
    pub enters: u64,
    /// Toggle calls issued
    pub flag_changes: u64,
    /// Blend calls issued
    pub blend_changes: u64,
    /// Shader binds issued
    pub shader_binds: u64,
    /// Color target binds issued
    pub target_binds: u64,
    /// Uniform writes issued
    pub uniforms_sent: u64,
    /// Uniform writes skipped because the device already had the value
    pub uniforms_skipped: u64,
    /// Clears issued
    pub clears: u64,
}

/// What the device currently has
#[derive(Debug)]
struct ActiveState {
    flags: StateFlags,
    blend: Option<BlendMode>,
    shader: Option<ShaderId>,
    color_target: Option<ColorTargetId>,
    material: Option<MaterialId>,
    uniforms: HashMap<String, UniformValue>,
}

/// Device plus state stack
pub struct RenderContext {
    device: Box<dyn GraphicsDevice>,
    stack: Vec<Rc<RenderState>>,
    effective: RenderState,
    active: ActiveState,
    stats: ContextStats,
}

impl RenderContext {
    /// Wrap a device
    ///
    /// The device is assumed to start with every toggle disabled and nothing bound.
    pub fn new(device: Box<dyn GraphicsDevice>) -> Self {
        Self {
            device,
            stack: Vec::new(),
            effective: RenderState::default(),
            active: ActiveState {
                flags: StateFlags::empty(),
                blend: None,
                shader: None,
                color_target: None,
                material: None,
                uniforms: HashMap::new(),
            },
            stats: ContextStats::default(),
        }
    }

    /// The device
    pub fn device(&self) -> &dyn GraphicsDevice {
        self.device.as_ref()
    }

    /// The device, mutably
    ///
    /// Calls made directly through this reference bypass elision tracking.
    pub fn device_mut(&mut self) -> &mut dyn GraphicsDevice {
        self.device.as_mut()
    }

    /// Downcast the device to its concrete type
    pub fn device_as<D: 'static>(&self) -> Option<&D> {
        self.device.as_any().downcast_ref::<D>()
    }

    /// Downcast the device to its concrete type mutably
    pub fn device_as_mut<D: 'static>(&mut self) -> Option<&mut D> {
        self.device.as_any_mut().downcast_mut::<D>()
    }

    /// Number of states on the stack
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Aggregate of the whole stack
    pub fn effective_state(&self) -> &RenderState {
        &self.effective
    }

    /// Material whose uniforms are currently forwarded
    pub fn bound_material(&self) -> Option<MaterialId> {
        self.active.material
    }

    /// True when `state` is on the stack
    pub fn is_active(&self, state: &Rc<RenderState>) -> bool {
        self.stack.iter().any(|entry| Rc::ptr_eq(entry, state))
    }

    /// Device work counters
    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    /// Push a state and enter the new aggregate
    pub fn push_state(&mut self, state: Rc<RenderState>) -> RenderResult<()> {
        self.stack.push(state);
        self.refresh()
    }

    /// Pop the top state and enter what is left
    pub fn pop_state(&mut self) -> RenderResult<Rc<RenderState>> {
        let state = self.stack.pop().ok_or(RenderError::StateStackUnderflow)?;
        self.refresh()?;
        Ok(state)
    }

    /// Mutate a state, keeping the device in step when the state is active
    ///
    /// An active state is copied before `f` runs. The copy replaces the original on
    /// the stack and is entered before this returns, so nothing ever observes a
    /// half-applied change. `state` points at the copy afterwards.
    pub fn update_state<F>(&mut self, state: &mut Rc<RenderState>, f: F) -> RenderResult<()>
    where
        F: FnOnce(&mut RenderState),
    {
        if !self.is_active(state) {
            f(Rc::make_mut(state));
            return Ok(());
        }

        let original = Rc::clone(state);
        f(Rc::make_mut(state));
        self.replace_on_stack(&original, state);
        self.refresh()
    }

    /// Store a uniform in `state` and forward it if it is visible right now
    ///
    /// The value is written to the state and, when the state is on the stack, no
    /// higher state overrides it, and `material` is global or bound, straight to the
    /// device as well, without re-entering the stack.
    pub fn set_uniform(
        &mut self,
        state: &mut Rc<RenderState>,
        material: MaterialId,
        name: &str,
        value: UniformValue,
    ) -> RenderResult<()> {
        let Some(position) = self.stack.iter().rposition(|entry| Rc::ptr_eq(entry, state)) else {
            Rc::make_mut(state).set_uniform(material, name, value);
            return Ok(());
        };

        let original = Rc::clone(state);
        Rc::make_mut(state).set_uniform(material, name, value.clone());
        self.replace_on_stack(&original, state);

        let shadowed = self.stack[position + 1..]
            .iter()
            .any(|upper| upper.uniform(material, name).is_some());
        if shadowed {
            return Ok(());
        }

        self.effective.set_uniform(material, name, value);
        if material == MaterialId::GLOBAL || Some(material) == self.active.material {
            if let Some(resolved) = self.resolved_uniform(name) {
                self.send_uniform(name, &resolved)?;
            }
        }
        Ok(())
    }

    /// Make `material` current and forward its uniforms
    pub fn bind_material(&mut self, material: MaterialId) -> RenderResult<()> {
        if self.active.material == Some(material) {
            return Ok(());
        }
        self.active.material = Some(material);
        self.forward_uniforms()
    }

    /// Write a uniform that belongs to no state, such as a per-draw matrix
    pub fn set_transient_uniform(&mut self, name: &str, value: &UniformValue) -> RenderResult<()> {
        self.send_uniform(name, value)
    }

    /// Switch the device to `target` if it is not already bound
    pub fn prep_color_target(&mut self, target: ColorTargetId) -> RenderResult<()> {
        if self.active.color_target != Some(target) {
            self.device.bind_color_target(target)?;
            self.active.color_target = Some(target);
            self.stats.target_binds += 1;
        }
        Ok(())
    }

    /// Clear the color and/or depth buffer of `target`, or of the effective target
    pub fn clear(
        &mut self,
        target: Option<ColorTargetId>,
        color: Option<[f32; 4]>,
        depth: Option<f32>,
    ) -> RenderResult<()> {
        if let Some(target) = target.or(self.effective.color_target()) {
            self.prep_color_target(target)?;
        }
        self.device.clear(color, depth)?;
        self.stats.clears += 1;
        Ok(())
    }

    fn replace_on_stack(&mut self, original: &Rc<RenderState>, replacement: &Rc<RenderState>) {
        for entry in &mut self.stack {
            if Rc::ptr_eq(entry, original) {
                *entry = Rc::clone(replacement);
            }
        }
    }

    fn aggregate(&self) -> RenderState {
        let mut states = self.stack.iter().rev();
        let Some(top) = states.next() else {
            return RenderState::default();
        };
        states.fold(RenderState::clone(top), |upper, lower| upper.underlay(lower))
    }

    fn refresh(&mut self) -> RenderResult<()> {
        self.effective = self.aggregate();
        self.enter()
    }

    /// Bring the device in line with the effective state
    fn enter(&mut self) -> RenderResult<()> {
        self.stats.enters += 1;

        let care = self.effective.care_about();
        let wanted = self.effective.flags();
        let changed = (wanted ^ self.active.flags) & care;
        for flag in changed.iter() {
            let enabled = wanted.contains(flag);
            self.device.set_flag(flag, enabled)?;
            self.active.flags.set(flag, enabled);
            self.stats.flag_changes += 1;
        }

        let blend = self.effective.blend();
        if blend != BlendMode::DontCare && self.active.blend != Some(blend) {
            self.device.set_blend(blend)?;
            self.active.blend = Some(blend);
            self.stats.blend_changes += 1;
        }

        if let Some(shader) = self.effective.shader() {
            if self.active.shader != Some(shader) {
                self.device.bind_shader(shader)?;
                self.active.shader = Some(shader);
                self.active.uniforms.clear();
                self.stats.shader_binds += 1;
            }
        }

        if let Some(target) = self.effective.color_target() {
            self.prep_color_target(target)?;
        }

        self.forward_uniforms()
    }

    /// Effective value of a uniform: the bound material's entry wins over the global one
    fn resolved_uniform(&self, name: &str) -> Option<UniformValue> {
        self.active
            .material
            .filter(|material| *material != MaterialId::GLOBAL)
            .and_then(|material| self.effective.uniform(material, name))
            .or_else(|| self.effective.uniform(MaterialId::GLOBAL, name))
            .cloned()
    }

    fn forward_uniforms(&mut self) -> RenderResult<()> {
        let mut names: Vec<String> = Vec::new();
        for material in [Some(MaterialId::GLOBAL), self.active.material].into_iter().flatten() {
            if let Some(bag) = self.effective.uniforms_for(material) {
                for (name, _) in bag.iter() {
                    if !names.iter().any(|known| known == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }

        for name in names {
            if let Some(value) = self.resolved_uniform(&name) {
                self.send_uniform(&name, &value)?;
            }
        }
        Ok(())
    }

    fn send_uniform(&mut self, name: &str, value: &UniformValue) -> RenderResult<()> {
        if self.active.shader.is_none() {
            return Ok(());
        }
        if self.active.uniforms.get(name) == Some(value) {
            self.stats.uniforms_skipped += 1;
            return Ok(());
        }

        log::trace!("Uniform {} <- {:?}", name, value);
        self.device.set_uniform(name, value)?;
        self.active.uniforms.insert(name.to_string(), value.clone());
        self.stats.uniforms_sent += 1;
        Ok(())
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("depth", &self.stack.len())
            .field("effective", &self.effective)
            .field("active", &self.active)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
