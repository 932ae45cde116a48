//! Device-state intent and its composition rules
//!
//! A [`RenderState`] describes what a piece of rendering *wants* from the device:
//! which boolean toggles should be on or off, which blend mode, shader and color
//! target to use, and which uniform values each material should see. A state only
//! speaks for the parts it cares about; everything else is inherited from the states
//! beneath it on the context stack.
//!
//! # Composition
//!
//! ```text
//! upper.underlay(lower)
//!     flags:   upper's cared bits, lower fills bits upper does not care about
//!     blend:   upper unless DontCare
//!     shader:  upper.or(lower)
//!     target:  upper.or(lower)
//!     uniforms: per material, upper's names override lower's
//! ```

use std::collections::BTreeMap;
use bitflags::bitflags;
use serde::{Serialize, Deserialize};
use crate::foundation::math::Mat4;
use super::device::{ColorTargetId, ShaderId};

bitflags! {
    /// Boolean device toggles a state can have an opinion on
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct StateFlags: u32 {
        /// Depth comparison against the depth buffer
        const DEPTH_TEST = 1 << 0;
        /// Depth buffer writes
        const DEPTH_WRITE = 1 << 1;
        /// Back-face culling
        const CULL_FACE = 1 << 2;
        /// Scissor rectangle test
        const SCISSOR_TEST = 1 << 3;
        /// Stencil test
        const STENCIL_TEST = 1 << 4;
        /// Color buffer writes
        const COLOR_WRITE = 1 << 5;
        /// Rasterize as lines instead of filled triangles
        const WIREFRAME = 1 << 6;
        /// Multisample rasterization
        const MULTISAMPLE = 1 << 7;
    }
}

/// Framebuffer blending modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// No opinion; inherit whatever is below
    #[default]
    DontCare,
    /// No blending (fully opaque)
    Opaque,
    /// Standard alpha blending
    Alpha,
    /// Additive blending for glows and particles
    Additive,
    /// Multiplicative blending for shadows and tinting
    Multiplicative,
    /// Pre-multiplied alpha
    Premultiplied,
}

/// Identifier of a material whose uniforms a state can override
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MaterialId(pub u32);

impl MaterialId {
    /// Uniforms under this id are forwarded regardless of the bound material
    pub const GLOBAL: MaterialId = MaterialId(0);
}

/// A typed uniform value
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    /// Single float
    Float(f32),
    /// Signed integer
    Int(i32),
    /// Two-component vector
    Vec2([f32; 2]),
    /// Three-component vector
    Vec3([f32; 3]),
    /// Four-component vector or color
    Vec4([f32; 4]),
    /// 4x4 matrix
    Mat4(Mat4),
    /// Texture unit index
    Sampler(u32),
}

/// Named uniform values of one material, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniformBag {
    entries: Vec<(String, UniformValue)>,
}

impl UniformBag {
    /// Store a value, overwriting an entry with the same name
    pub fn set(&mut self, name: impl Into<String>, value: UniformValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Look up a value by name
    pub fn get(&self, name: &str) -> Option<&UniformValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    /// Remove a value by name
    pub fn remove(&mut self, name: &str) -> Option<UniformValue> {
        let index = self.entries.iter().position(|(existing, _)| existing == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Iterate over `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &UniformValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the bag holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fill in entries from `lower` whose names this bag does not define
    fn underlay(&mut self, lower: &UniformBag) {
        for (name, value) in lower.iter() {
            if self.get(name).is_none() {
                self.entries.push((name.to_string(), value.clone()));
            }
        }
    }
}

/// Device-state intent with "don't care" semantics
///
/// States are plain values: two states are equal when they would compose the same
/// way, regardless of where they came from. They are shared as `Rc<RenderState>`
/// and cloned on write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderState {
    flags: StateFlags,
    care_about: StateFlags,
    blend: BlendMode,
    shader: Option<ShaderId>,
    color_target: Option<ColorTargetId>,
    uniforms: BTreeMap<MaterialId, UniformBag>,
}

impl RenderState {
    /// A state with no opinion on anything
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `flags` to be enabled or disabled
    pub fn with_flags(mut self, flags: StateFlags, enabled: bool) -> Self {
        self.set_flags(flags, enabled);
        self
    }

    /// Set the blend mode
    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    /// Set the shader
    pub fn with_shader(mut self, shader: ShaderId) -> Self {
        self.shader = Some(shader);
        self
    }

    /// Set the color target
    pub fn with_color_target(mut self, target: ColorTargetId) -> Self {
        self.color_target = Some(target);
        self
    }

    /// Add a uniform override
    pub fn with_uniform(mut self, material: MaterialId, name: impl Into<String>, value: UniformValue) -> Self {
        self.set_uniform(material, name, value);
        self
    }

    /// Require `flags` to be enabled or disabled, marking them cared about
    pub fn set_flags(&mut self, flags: StateFlags, enabled: bool) {
        self.care_about |= flags;
        self.flags.set(flags, enabled);
    }

    /// Stop caring about `flags`
    pub fn dont_care(&mut self, flags: StateFlags) {
        self.care_about.remove(flags);
        self.flags.remove(flags);
    }

    /// Set or clear the blend mode (`BlendMode::DontCare` clears)
    pub fn set_blend(&mut self, blend: BlendMode) {
        self.blend = blend;
    }

    /// Set or clear the shader
    pub fn set_shader(&mut self, shader: Option<ShaderId>) {
        self.shader = shader;
    }

    /// Set or clear the color target
    pub fn set_color_target(&mut self, target: Option<ColorTargetId>) {
        self.color_target = target;
    }

    /// Store a uniform for one material, overwriting a same-named entry
    pub fn set_uniform(&mut self, material: MaterialId, name: impl Into<String>, value: UniformValue) {
        self.uniforms.entry(material).or_default().set(name, value);
    }

    /// Flag values; only bits in [`care_about`](Self::care_about) are meaningful
    pub fn flags(&self) -> StateFlags {
        self.flags
    }

    /// Mask of flag bits this state has an opinion on
    pub fn care_about(&self) -> StateFlags {
        self.care_about
    }

    /// The requested value of one flag, `None` when not cared about
    pub fn flag(&self, flag: StateFlags) -> Option<bool> {
        self.care_about.contains(flag).then(|| self.flags.contains(flag))
    }

    /// Blend mode
    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    /// Shader, if this state selects one
    pub fn shader(&self) -> Option<ShaderId> {
        self.shader
    }

    /// Color target, if this state selects one
    pub fn color_target(&self) -> Option<ColorTargetId> {
        self.color_target
    }

    /// Uniform overrides of one material
    pub fn uniforms_for(&self, material: MaterialId) -> Option<&UniformBag> {
        self.uniforms.get(&material)
    }

    /// Look up one uniform override
    pub fn uniform(&self, material: MaterialId, name: &str) -> Option<&UniformValue> {
        self.uniforms_for(material)?.get(name)
    }

    /// Compose `lower` underneath this state
    ///
    /// Everything this state cares about wins; `lower` fills the gaps.
    pub fn underlay(&self, lower: &RenderState) -> RenderState {
        let inherited = lower.care_about - self.care_about;

        let mut uniforms = self.uniforms.clone();
        for (material, bag) in &lower.uniforms {
            uniforms.entry(*material).or_default().underlay(bag);
        }

        RenderState {
            flags: (self.flags & self.care_about) | (lower.flags & inherited),
            care_about: self.care_about | lower.care_about,
            blend: match self.blend {
                BlendMode::DontCare => lower.blend,
                blend => blend,
            },
            shader: self.shader.or(lower.shader),
            color_target: self.color_target.or(lower.color_target),
            uniforms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_state(rng: &mut StdRng) -> RenderState {
        let care = StateFlags::from_bits_truncate(rng.gen());
        let values = StateFlags::from_bits_truncate(rng.gen());
        let mut state = RenderState::new();
        state.set_flags(care & values, true);
        state.set_flags(care - values, false);
        state
    }

    #[test]
    fn test_underlay_never_overrides_cared_bits() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let lower = random_state(&mut rng);
            let upper = random_state(&mut rng);
            let composed = upper.underlay(&lower);

            for flag in StateFlags::all().iter() {
                match (upper.flag(flag), lower.flag(flag)) {
                    (Some(value), _) => assert_eq!(composed.flag(flag), Some(value)),
                    (None, Some(value)) => assert_eq!(composed.flag(flag), Some(value)),
                    (None, None) => assert_eq!(composed.flag(flag), None),
                }
            }
        }
    }

    #[test]
    fn test_underlay_blend_and_bindings() {
        let lower = RenderState::new()
            .with_blend(BlendMode::Alpha)
            .with_shader(ShaderId(1))
            .with_color_target(ColorTargetId(4));
        let upper = RenderState::new().with_shader(ShaderId(2));

        let composed = upper.underlay(&lower);
        assert_eq!(composed.blend(), BlendMode::Alpha);
        assert_eq!(composed.shader(), Some(ShaderId(2)));
        assert_eq!(composed.color_target(), Some(ColorTargetId(4)));

        let opaque = RenderState::new().with_blend(BlendMode::Opaque);
        assert_eq!(opaque.underlay(&lower).blend(), BlendMode::Opaque);
    }

    #[test]
    fn test_underlay_merges_uniform_bags_by_name() {
        let material = MaterialId(3);
        let lower = RenderState::new()
            .with_uniform(material, "tint", UniformValue::Vec4([1.0, 0.0, 0.0, 1.0]))
            .with_uniform(material, "gloss", UniformValue::Float(0.5));
        let upper = RenderState::new()
            .with_uniform(material, "tint", UniformValue::Vec4([0.0, 1.0, 0.0, 1.0]));

        let composed = upper.underlay(&lower);
        assert_eq!(composed.uniform(material, "tint"), Some(&UniformValue::Vec4([0.0, 1.0, 0.0, 1.0])));
        assert_eq!(composed.uniform(material, "gloss"), Some(&UniformValue::Float(0.5)));
        assert_eq!(composed.uniform(MaterialId::GLOBAL, "tint"), None);
    }

    #[test]
    fn test_set_uniform_overwrites_same_name() {
        let mut state = RenderState::new();
        state.set_uniform(MaterialId::GLOBAL, "time", UniformValue::Float(1.0));
        state.set_uniform(MaterialId::GLOBAL, "time", UniformValue::Float(2.0));

        let bag = state.uniforms_for(MaterialId::GLOBAL).unwrap();
        assert_eq!(bag.len(), 1);
        assert_eq!(bag.get("time"), Some(&UniformValue::Float(2.0)));
    }

    #[test]
    fn test_dont_care_releases_flag() {
        let mut state = RenderState::new().with_flags(StateFlags::DEPTH_TEST | StateFlags::CULL_FACE, true);
        state.dont_care(StateFlags::CULL_FACE);
        assert_eq!(state.flag(StateFlags::DEPTH_TEST), Some(true));
        assert_eq!(state.flag(StateFlags::CULL_FACE), None);
        assert_eq!(state, RenderState::new().with_flags(StateFlags::DEPTH_TEST, true));
    }
}
