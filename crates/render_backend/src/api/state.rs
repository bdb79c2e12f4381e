//! Fixed-function pipeline sub-state descriptions.
//!
//! Pipelines copy these structs out of transient create-info into owned
//! storage, hash them for cache lookups, and hand them to the driver for
//! compilation. Hashing follows the non-cryptographic 32-bit mix used
//! throughout the caches: fast and well distributed, with full struct
//! equality as the authoritative comparison after any hash hit.

use bitflags::bitflags;

use crate::api::types::{
    BlendFactor, BlendOp, CompareOp, CullMode, FrontFace, LogicOp, PolygonMode, PrimitiveTopology,
    Rect2D, StencilOp, VertexInputFormat, VertexInputRate, Viewport,
};

/// Golden-ratio 32-bit hash combiner:
/// `seed ^= value + 0x9e3779b9 + (seed << 6) + (seed >> 2)`.
///
/// Collisions are expected; every cache built on this verifies candidates
/// with full equality.
pub fn hash_combine(seed: u32, value: u32) -> u32 {
    seed ^ value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

bitflags! {
    /// Color channels a blend attachment may write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ColorComponentFlags: u32 {
        /// Red channel.
        const R = 1 << 0;
        /// Green channel.
        const G = 1 << 1;
        /// Blue channel.
        const B = 1 << 2;
        /// Alpha channel.
        const A = 1 << 3;
    }
}

impl ColorComponentFlags {
    /// All four channels writable.
    pub fn all_channels() -> Self {
        ColorComponentFlags::R | ColorComponentFlags::G | ColorComponentFlags::B | ColorComponentFlags::A
    }
}

/// Stencil behavior for one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilOpState {
    /// Applied when the stencil test fails.
    pub fail_op: StencilOp,
    /// Applied when both stencil and depth tests pass.
    pub pass_op: StencilOp,
    /// Applied when the stencil test passes but the depth test fails.
    pub depth_fail_op: StencilOp,
    /// Stencil comparison function.
    pub compare_op: CompareOp,
    /// Bits participating in the comparison.
    pub compare_mask: u32,
    /// Bits writable by the stencil operations.
    pub write_mask: u32,
    /// Reference value for the comparison.
    pub reference: u32,
}

impl StencilOpState {
    /// Mix of every field except `reference`, which is combined last.
    pub(crate) fn mix_ops(&self, seed: u32) -> u32 {
        let mut h = hash_combine(seed, self.fail_op as u32);
        h = hash_combine(h, self.pass_op as u32);
        h = hash_combine(h, self.depth_fail_op as u32);
        h = hash_combine(h, self.compare_op as u32);
        h = hash_combine(h, self.compare_mask);
        hash_combine(h, self.write_mask)
    }

    fn mix(&self, seed: u32) -> u32 {
        hash_combine(self.mix_ops(seed), self.reference)
    }
}

/// Depth and stencil test configuration.
///
/// May be baked into a pipeline at creation or left dynamic; when dynamic,
/// the pipeline compiles one native variant per distinct value seen at draw
/// time, keyed by [`DepthStencilState::state_hash`] with full equality
/// confirming every hit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthStencilState {
    /// Enable the depth test.
    pub depth_test_enable: bool,
    /// Enable depth writes.
    pub depth_write_enable: bool,
    /// Depth comparison function.
    pub depth_compare_op: CompareOp,
    /// Enable the depth bounds test.
    pub depth_bounds_test_enable: bool,
    /// Lower depth bound. Never NaN; callers supply values in [0, 1].
    pub min_depth_bounds: f32,
    /// Upper depth bound. Never NaN; callers supply values in [0, 1].
    pub max_depth_bounds: f32,
    /// Enable the stencil test.
    pub stencil_test_enable: bool,
    /// Front-face stencil behavior.
    pub front: StencilOpState,
    /// Back-face stencil behavior.
    pub back: StencilOpState,
}

// Depth bounds are validated, finite values; bitwise comparison is total.
impl Eq for DepthStencilState {}

impl std::hash::Hash for DepthStencilState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.state_hash());
    }
}

impl DepthStencilState {
    /// 32-bit mix over every field.
    ///
    /// Distinct states can collide; callers must confirm candidates by
    /// equality. Exposed so tests can construct deliberate collisions.
    pub fn state_hash(&self) -> u32 {
        self.back.mix(self.prefix_hash())
    }

    /// Mix of every field except the back face, which is combined last.
    pub(crate) fn prefix_hash(&self) -> u32 {
        let mut h = hash_combine(0, u32::from(self.depth_test_enable));
        h = hash_combine(h, u32::from(self.depth_write_enable));
        h = hash_combine(h, self.depth_compare_op as u32);
        h = hash_combine(h, u32::from(self.depth_bounds_test_enable));
        h = hash_combine(h, self.min_depth_bounds.to_bits());
        h = hash_combine(h, self.max_depth_bounds.to_bits());
        h = hash_combine(h, u32::from(self.stencil_test_enable));
        self.front.mix(h)
    }
}

/// Builds two unequal depth/stencil states with identical hashes by
/// solving the final combine step for the back-face reference value.
#[cfg(test)]
pub(crate) fn colliding_depth_stencil_pair() -> (DepthStencilState, DepthStencilState) {
    let mut a = DepthStencilState::default();
    a.stencil_test_enable = true;
    a.front.compare_mask = 0x0f;
    a.back.reference = 1;
    let target = a.state_hash();

    let mut b = a;
    b.front.compare_mask = 0xf0;
    let m = b.back.mix_ops(b.prefix_hash());
    b.back.reference = (m ^ target)
        .wrapping_sub(0x9e37_79b9)
        .wrapping_sub(m << 6)
        .wrapping_sub(m >> 2);
    (a, b)
}

/// Rasterizer fixed-function configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizationState {
    /// Which faces are discarded.
    pub cull_mode: CullMode,
    /// Fill, line, or point rasterization.
    pub polygon_mode: PolygonMode,
    /// Winding order considered front-facing.
    pub front_face: FrontFace,
}

impl RasterizationState {
    pub(crate) fn mix(&self, seed: u32) -> u32 {
        let mut h = hash_combine(seed, self.cull_mode as u32);
        h = hash_combine(h, self.polygon_mode as u32);
        hash_combine(h, self.front_face as u32)
    }
}

/// Primitive assembly configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InputAssemblyState {
    /// Primitive topology.
    pub topology: PrimitiveTopology,
    /// Enable strip-restart on the maximum index value.
    pub primitive_restart_enable: bool,
}

impl InputAssemblyState {
    pub(crate) fn mix(&self, seed: u32) -> u32 {
        let h = hash_combine(seed, self.topology as u32);
        hash_combine(h, u32::from(self.primitive_restart_enable))
    }
}

/// Static viewport/scissor configuration.
///
/// Pipelines created without one treat viewport and scissor as dynamic
/// state supplied per draw.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportState {
    /// The viewport rectangle and depth range.
    pub viewport: Viewport,
    /// The scissor rectangle.
    pub scissor: Rect2D,
}

impl ViewportState {
    pub(crate) fn mix(&self, seed: u32) -> u32 {
        let mut h = hash_combine(seed, self.viewport.x.to_bits());
        h = hash_combine(h, self.viewport.y.to_bits());
        h = hash_combine(h, self.viewport.width.to_bits());
        h = hash_combine(h, self.viewport.height.to_bits());
        h = hash_combine(h, self.viewport.min_depth.to_bits());
        h = hash_combine(h, self.viewport.max_depth.to_bits());
        h = hash_combine(h, self.scissor.offset.x as u32);
        h = hash_combine(h, self.scissor.offset.y as u32);
        h = hash_combine(h, self.scissor.extent.width);
        hash_combine(h, self.scissor.extent.height)
    }
}

/// One vertex buffer binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexInputBinding {
    /// Byte stride between consecutive elements.
    pub stride: u32,
    /// Per-vertex or per-instance advance.
    pub input_rate: VertexInputRate,
}

/// One vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexInputAttribute {
    /// Shader input location.
    pub location: u32,
    /// Index of the buffer binding supplying this attribute.
    pub binding: u32,
    /// Byte offset within the bound element.
    pub offset: u32,
    /// Attribute data format.
    pub format: VertexInputFormat,
}

/// Complete vertex input layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexInputState {
    /// Buffer binding descriptions.
    pub buffer_bindings: Vec<VertexInputBinding>,
    /// Attribute descriptions.
    pub attributes: Vec<VertexInputAttribute>,
}

impl VertexInputState {
    pub(crate) fn mix(&self, seed: u32) -> u32 {
        let mut h = seed;
        for binding in &self.buffer_bindings {
            h = hash_combine(h, binding.stride);
            h = hash_combine(h, binding.input_rate as u32);
        }
        for attr in &self.attributes {
            h = hash_combine(h, attr.location);
            h = hash_combine(h, attr.binding);
            h = hash_combine(h, attr.offset);
            h = hash_combine(h, attr.format as u32);
        }
        h
    }
}

/// Blend configuration applied to every color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColorBlendState {
    /// Enable the framebuffer logic op (mutually exclusive with blending).
    pub logic_op_enable: bool,
    /// The logic op when enabled.
    pub logic_op: LogicOp,
    /// Enable blending.
    pub blend_enable: bool,
    /// Source color factor.
    pub src_color_blend_factor: BlendFactor,
    /// Destination color factor.
    pub dst_color_blend_factor: BlendFactor,
    /// Color combination operator.
    pub color_blend_op: BlendOp,
    /// Source alpha factor.
    pub src_alpha_blend_factor: BlendFactor,
    /// Destination alpha factor.
    pub dst_alpha_blend_factor: BlendFactor,
    /// Alpha combination operator.
    pub alpha_blend_op: BlendOp,
    /// Constant color referenced by constant blend factors.
    pub blend_constants: [f32; 4],
    /// Writable color channels.
    pub color_component_write_bits: ColorComponentFlags,
}

impl ColorBlendState {
    pub(crate) fn mix(&self, seed: u32) -> u32 {
        let mut h = hash_combine(seed, u32::from(self.logic_op_enable));
        h = hash_combine(h, self.logic_op as u32);
        h = hash_combine(h, u32::from(self.blend_enable));
        h = hash_combine(h, self.src_color_blend_factor as u32);
        h = hash_combine(h, self.dst_color_blend_factor as u32);
        h = hash_combine(h, self.color_blend_op as u32);
        h = hash_combine(h, self.src_alpha_blend_factor as u32);
        h = hash_combine(h, self.dst_alpha_blend_factor as u32);
        h = hash_combine(h, self.alpha_blend_op as u32);
        for c in self.blend_constants {
            h = hash_combine(h, c.to_bits());
        }
        hash_combine(h, self.color_component_write_bits.bits())
    }
}

/// Multisample configuration. The scene graph renders single-sampled; this
/// exists so the pipeline bundle is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MultisampleState {
    /// Samples per pixel.
    pub sample_count: u32,
}

impl Default for MultisampleState {
    fn default() -> Self {
        MultisampleState { sample_count: 1 }
    }
}

impl MultisampleState {
    pub(crate) fn mix(&self, seed: u32) -> u32 {
        hash_combine(seed, self.sample_count)
    }
}
