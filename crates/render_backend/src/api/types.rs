//! Portable value types shared by the recording and execution layers.
//!
//! These are the driver-agnostic equivalents of the native enums: the
//! rendering core records state in these terms and the driver backend
//! translates them when commands are replayed.

use bitflags::bitflags;

/// Pixel formats understood by the backend.
///
/// The set is intentionally practical rather than exhaustive: it covers the
/// formats the scene-graph core actually produces, plus the depth/stencil
/// formats render targets need. Formats without native sampling support are
/// marked emulated and widened during upload (see
/// [`Format::storage_format`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Undefined/unspecified format.
    #[default]
    Undefined,
    /// 8-bit single channel, unsigned normalized.
    R8Unorm,
    /// 8-bit two channel, unsigned normalized.
    R8G8Unorm,
    /// 24-bit RGB, unsigned normalized. Emulated: stored as RGBA.
    R8G8B8Unorm,
    /// 32-bit RGBA, unsigned normalized.
    R8G8B8A8Unorm,
    /// 32-bit BGRA, unsigned normalized.
    B8G8R8A8Unorm,
    /// 16-bit packed 5-6-5 RGB.
    R5G6B5UnormPack16,
    /// 16-bit packed 4-4-4-4 RGBA.
    R4G4B4A4UnormPack16,
    /// 32-bit float single channel.
    R32Sfloat,
    /// Two-plane chroma-subsampled YUV (Y plane + interleaved CbCr).
    G8B8R82Plane420Unorm,
    /// 16-bit depth.
    D16Unorm,
    /// 32-bit float depth.
    D32Sfloat,
    /// Packed 24-bit depth with 8-bit stencil.
    D24UnormS8Uint,
}

impl Format {
    /// Bytes per pixel of the format as stored on the GPU.
    ///
    /// Planar YUV formats report the Y-plane stride contribution (1 byte);
    /// callers dealing with plane data address planes individually.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::R8G8Unorm | Format::R5G6B5UnormPack16 | Format::R4G4B4A4UnormPack16 | Format::D16Unorm => 2,
            Format::R8G8B8Unorm => 3,
            Format::R8G8B8A8Unorm | Format::B8G8R8A8Unorm | Format::R32Sfloat | Format::D32Sfloat | Format::D24UnormS8Uint => 4,
            Format::G8B8R82Plane420Unorm => 1,
        }
    }

    /// Whether the format has no native texel layout and is converted in
    /// software on upload.
    pub fn is_emulated(self) -> bool {
        matches!(self, Format::R8G8B8Unorm)
    }

    /// The format actually stored on the GPU. Identity except for emulated
    /// formats, which widen to their closest supported layout.
    pub fn storage_format(self) -> Format {
        match self {
            Format::R8G8B8Unorm => Format::R8G8B8A8Unorm,
            other => other,
        }
    }

    /// Whether the format carries a depth aspect.
    pub fn has_depth(self) -> bool {
        matches!(self, Format::D16Unorm | Format::D32Sfloat | Format::D24UnormS8Uint)
    }

    /// Whether the format carries a stencil aspect.
    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint)
    }

    /// Whether the format is chroma-subsampled and needs YCbCr conversion
    /// to be sampled.
    pub fn is_ycbcr(self) -> bool {
        matches!(self, Format::G8B8R82Plane420Unorm)
    }
}

/// Depth/stencil comparison functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    /// Test never passes.
    Never,
    /// Passes when incoming < stored.
    #[default]
    Less,
    /// Passes when incoming == stored.
    Equal,
    /// Passes when incoming <= stored.
    LessOrEqual,
    /// Passes when incoming > stored.
    Greater,
    /// Passes when incoming != stored.
    NotEqual,
    /// Passes when incoming >= stored.
    GreaterOrEqual,
    /// Test always passes.
    Always,
}

/// Stencil buffer update operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    /// Keep the stored value.
    #[default]
    Keep,
    /// Write zero.
    Zero,
    /// Replace with the reference value.
    Replace,
    /// Increment, clamping at maximum.
    IncrementAndClamp,
    /// Decrement, clamping at zero.
    DecrementAndClamp,
    /// Bitwise invert.
    Invert,
    /// Increment with wraparound.
    IncrementAndWrap,
    /// Decrement with wraparound.
    DecrementAndWrap,
}

/// Blend multiplication factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum BlendFactor {
    #[default]
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

/// Blend combination operators, including the advanced blend equations the
/// scene graph uses for layer compositing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
    // Advanced equations; require the driver's advanced-blend capability.
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
}

impl BlendOp {
    /// Whether this operator is one of the advanced blend equations.
    pub fn is_advanced(self) -> bool {
        matches!(
            self,
            BlendOp::Multiply | BlendOp::Screen | BlendOp::Overlay | BlendOp::Darken | BlendOp::Lighten
        )
    }
}

/// Blend equation applied dynamically to attachment zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendEquation {
    /// Source color factor.
    pub src_color: BlendFactor,
    /// Destination color factor.
    pub dst_color: BlendFactor,
    /// Color combine operation.
    pub color_op: BlendOp,
    /// Source alpha factor.
    pub src_alpha: BlendFactor,
    /// Destination alpha factor.
    pub dst_alpha: BlendFactor,
    /// Alpha combine operation.
    pub alpha_op: BlendOp,
}

/// Framebuffer logical operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum LogicOp {
    #[default]
    Clear,
    And,
    AndReverse,
    Copy,
    AndInverted,
    NoOp,
    Xor,
    Or,
    Nor,
    Equivalent,
    Invert,
    OrReverse,
    CopyInverted,
    OrInverted,
    Nand,
    Set,
}

/// Primitive assembly topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

/// Triangle facing considered front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    /// Counter-clockwise winding is front-facing.
    #[default]
    CounterClockwise,
    /// Clockwise winding is front-facing.
    Clockwise,
}

/// Face culling selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

/// Polygon rasterization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

/// Per-vertex attribute formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum VertexInputFormat {
    #[default]
    Undefined,
    Float,
    Fvector2,
    Fvector3,
    Fvector4,
    Integer,
    Ivector2,
    Ivector3,
    Ivector4,
}

/// Whether a vertex binding advances per vertex or per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum VertexInputRate {
    #[default]
    PerVertex,
    PerInstance,
}

/// Index element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum IndexFormat {
    #[default]
    Uint16,
    Uint32,
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum TextureType {
    #[default]
    Texture2D,
    TextureCubemap,
}

/// Physical arrangement of texel memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureTiling {
    /// Driver-chosen, GPU-optimal layout. Not host addressable.
    #[default]
    Optimal,
    /// Row-major linear layout; eligible for direct host writes.
    Linear,
}

/// Image layout states tracked across transfer and sampling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum TextureLayout {
    #[default]
    Undefined,
    General,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
    ColorAttachment,
    DepthStencilAttachment,
    PresentSrc,
}

/// Texture filtering modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum SamplerFilter {
    #[default]
    Nearest,
    Linear,
}

/// Mipmap selection modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum SamplerMipmapMode {
    #[default]
    Nearest,
    Linear,
}

/// Texture coordinate wrapping modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum SamplerAddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

/// What happens to an attachment's contents at render pass begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum AttachmentLoadOp {
    #[default]
    Load,
    Clear,
    DontCare,
}

/// What happens to an attachment's contents at render pass end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(missing_docs)]
pub enum AttachmentStoreOp {
    #[default]
    Store,
    DontCare,
}

/// Color model used when sampling luma/chroma formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum YcbcrModel {
    /// Pass components through unconverted.
    Identity,
    /// BT.601 conversion.
    #[default]
    Bt601,
    /// BT.709 conversion.
    Bt709,
    /// BT.2020 conversion.
    Bt2020,
}

/// Encoded channel range of luma/chroma data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum YcbcrRange {
    /// Full 0..255 range.
    Full,
    /// Studio swing 16..235 range.
    #[default]
    Narrow,
}

/// Placement of chroma samples relative to luma samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChromaLocation {
    /// Chroma sample shares position with the even luma sample.
    #[default]
    CositedEven,
    /// Chroma sample sits between luma samples.
    Midpoint,
}

bitflags! {
    /// Allowed uses of a texture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsageFlags: u32 {
        /// May be bound for sampling.
        const SAMPLE = 1 << 0;
        /// May be used as a color attachment.
        const COLOR_ATTACHMENT = 1 << 1;
        /// May be used as a depth/stencil attachment.
        const DEPTH_STENCIL_ATTACHMENT = 1 << 2;
        /// May be a copy source.
        const TRANSFER_SRC = 1 << 3;
        /// May be a copy destination.
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    /// Allowed uses of a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsageFlags: u32 {
        /// May be a copy source.
        const TRANSFER_SRC = 1 << 0;
        /// May be a copy destination.
        const TRANSFER_DST = 1 << 1;
        /// May back a uniform block.
        const UNIFORM_BUFFER = 1 << 2;
        /// May back a storage block.
        const STORAGE_BUFFER = 1 << 3;
        /// May supply index data.
        const INDEX_BUFFER = 1 << 4;
        /// May supply vertex data.
        const VERTEX_BUFFER = 1 << 5;
        /// May supply indirect draw parameters.
        const INDIRECT_BUFFER = 1 << 6;
    }
}

bitflags! {
    /// Recording hints for a command buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandBufferUsageFlags: u32 {
        /// The buffer is submitted once, then reset or recycled.
        const ONE_TIME_SUBMIT = 1 << 0;
        /// Secondary buffer executed entirely inside a render pass.
        const RENDER_PASS_CONTINUE = 1 << 1;
        /// May be resubmitted while still pending.
        const SIMULTANEOUS_USE = 1 << 2;
    }
}

bitflags! {
    /// Behavior of a command-buffer submission.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SubmitFlags: u32 {
        /// Replay the submitted buffers synchronously before returning.
        const FLUSH = 1 << 0;
    }
}

bitflags! {
    /// Memory access hints for host-visible allocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryUsageFlags: u32 {
        /// Host writes the memory.
        const CPU_WRITE = 1 << 0;
        /// Host reads the memory back.
        const CPU_READ = 1 << 1;
        /// Device-local only; never host mapped.
        const GPU_ONLY = 1 << 2;
    }
}

/// Unsigned 2D size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    /// Width in texels/pixels.
    pub width: u32,
    /// Height in texels/pixels.
    pub height: u32,
}

impl Extent2D {
    /// Extent from raw dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Extent2D { width, height }
    }
}

/// Signed 2D position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Offset2D {
    /// X coordinate.
    pub x: i32,
    /// Y coordinate.
    pub y: i32,
}

/// Axis-aligned rectangle: offset plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2D {
    /// Top-left corner.
    pub offset: Offset2D,
    /// Size.
    pub extent: Extent2D,
}

impl Rect2D {
    /// Rectangle from raw coordinates.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Rect2D {
            offset: Offset2D { x, y },
            extent: Extent2D { width, height },
        }
    }

    /// Whether two rectangles share at least one pixel.
    ///
    /// The union span on each axis is compared against the summed extents;
    /// strict inequality means touching edges do not count as overlap, and
    /// zero-area rectangles never intersect anything.
    pub fn intersects(&self, other: &Rect2D) -> bool {
        let (ax, ay) = (i64::from(self.offset.x), i64::from(self.offset.y));
        let (bx, by) = (i64::from(other.offset.x), i64::from(other.offset.y));
        let (aw, ah) = (i64::from(self.extent.width), i64::from(self.extent.height));
        let (bw, bh) = (i64::from(other.extent.width), i64::from(other.extent.height));

        let span_x = (ax + aw).max(bx + bw) - ax.min(bx);
        let span_y = (ay + ah).max(by + bh) - ay.min(by);
        span_x < aw + bw && span_y < ah + bh
    }
}

/// Floating-point viewport rectangle with depth range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub width: f32,
    /// Height.
    pub height: f32,
    /// Near depth bound.
    pub min_depth: f32,
    /// Far depth bound.
    pub max_depth: f32,
}

/// Clear payload for one attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Color attachment clear, RGBA.
    Color([f32; 4]),
    /// Depth/stencil attachment clear.
    DepthStencil {
        /// Depth clear value.
        depth: f32,
        /// Stencil clear value.
        stencil: u32,
    },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0.0; 4])
    }
}
