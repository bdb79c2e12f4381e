//! Translation from portable backend types to their `ash::vk` equivalents.

use ash::vk;

use crate::api::types::{
    AttachmentLoadOp, AttachmentStoreOp, BlendFactor, BlendOp, BufferUsageFlags, ChromaLocation,
    ClearValue, CompareOp, CullMode, Extent2D, Format, FrontFace, IndexFormat, LogicOp, Offset2D,
    PolygonMode, PrimitiveTopology, Rect2D, SamplerAddressMode, SamplerFilter, SamplerMipmapMode,
    StencilOp, TextureLayout, TextureTiling, TextureType, TextureUsageFlags, VertexInputFormat,
    Viewport, YcbcrModel, YcbcrRange,
};
use crate::api::state::ColorComponentFlags;

pub fn format(value: Format) -> vk::Format {
    match value {
        Format::Undefined => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8G8Unorm => vk::Format::R8G8_UNORM,
        Format::R8G8B8Unorm => vk::Format::R8G8B8_UNORM,
        Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::R5G6B5UnormPack16 => vk::Format::R5G6B5_UNORM_PACK16,
        Format::R4G4B4A4UnormPack16 => vk::Format::R4G4B4A4_UNORM_PACK16,
        Format::R32Sfloat => vk::Format::R32_SFLOAT,
        Format::G8B8R82Plane420Unorm => vk::Format::G8_B8R8_2PLANE_420_UNORM,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Sfloat => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Aspect flags implied by a format.
pub fn aspect(value: Format) -> vk::ImageAspectFlags {
    if value.has_depth() {
        if value.has_stencil() {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn compare_op(value: CompareOp) -> vk::CompareOp {
    match value {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn stencil_op(value: StencilOp) -> vk::StencilOp {
    match value {
        StencilOp::Keep => vk::StencilOp::KEEP,
        StencilOp::Zero => vk::StencilOp::ZERO,
        StencilOp::Replace => vk::StencilOp::REPLACE,
        StencilOp::IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
        StencilOp::DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
        StencilOp::Invert => vk::StencilOp::INVERT,
        StencilOp::IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
        StencilOp::DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
    }
}

pub fn blend_factor(value: BlendFactor) -> vk::BlendFactor {
    match value {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
        BlendFactor::OneMinusConstantColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
        BlendFactor::ConstantAlpha => vk::BlendFactor::CONSTANT_ALPHA,
        BlendFactor::OneMinusConstantAlpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
        BlendFactor::SrcAlphaSaturate => vk::BlendFactor::SRC_ALPHA_SATURATE,
    }
}

pub fn blend_op(value: BlendOp) -> vk::BlendOp {
    match value {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
        BlendOp::Multiply => vk::BlendOp::MULTIPLY_EXT,
        BlendOp::Screen => vk::BlendOp::SCREEN_EXT,
        BlendOp::Overlay => vk::BlendOp::OVERLAY_EXT,
        BlendOp::Darken => vk::BlendOp::DARKEN_EXT,
        BlendOp::Lighten => vk::BlendOp::LIGHTEN_EXT,
    }
}

pub fn logic_op(value: LogicOp) -> vk::LogicOp {
    match value {
        LogicOp::Clear => vk::LogicOp::CLEAR,
        LogicOp::And => vk::LogicOp::AND,
        LogicOp::AndReverse => vk::LogicOp::AND_REVERSE,
        LogicOp::Copy => vk::LogicOp::COPY,
        LogicOp::AndInverted => vk::LogicOp::AND_INVERTED,
        LogicOp::NoOp => vk::LogicOp::NO_OP,
        LogicOp::Xor => vk::LogicOp::XOR,
        LogicOp::Or => vk::LogicOp::OR,
        LogicOp::Nor => vk::LogicOp::NOR,
        LogicOp::Equivalent => vk::LogicOp::EQUIVALENT,
        LogicOp::Invert => vk::LogicOp::INVERT,
        LogicOp::OrReverse => vk::LogicOp::OR_REVERSE,
        LogicOp::CopyInverted => vk::LogicOp::COPY_INVERTED,
        LogicOp::OrInverted => vk::LogicOp::OR_INVERTED,
        LogicOp::Nand => vk::LogicOp::NAND,
        LogicOp::Set => vk::LogicOp::SET,
    }
}

pub fn topology(value: PrimitiveTopology) -> vk::PrimitiveTopology {
    match value {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
    }
}

pub fn front_face(value: FrontFace) -> vk::FrontFace {
    match value {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn cull_mode(value: CullMode) -> vk::CullModeFlags {
    match value {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
        CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
    }
}

pub fn polygon_mode(value: PolygonMode) -> vk::PolygonMode {
    match value {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
        PolygonMode::Point => vk::PolygonMode::POINT,
    }
}

pub fn vertex_format(value: VertexInputFormat) -> vk::Format {
    match value {
        VertexInputFormat::Undefined => vk::Format::UNDEFINED,
        VertexInputFormat::Float => vk::Format::R32_SFLOAT,
        VertexInputFormat::Fvector2 => vk::Format::R32G32_SFLOAT,
        VertexInputFormat::Fvector3 => vk::Format::R32G32B32_SFLOAT,
        VertexInputFormat::Fvector4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexInputFormat::Integer => vk::Format::R32_SINT,
        VertexInputFormat::Ivector2 => vk::Format::R32G32_SINT,
        VertexInputFormat::Ivector3 => vk::Format::R32G32B32_SINT,
        VertexInputFormat::Ivector4 => vk::Format::R32G32B32A32_SINT,
    }
}

pub fn index_type(value: IndexFormat) -> vk::IndexType {
    match value {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

pub fn image_type(value: TextureType) -> vk::ImageType {
    match value {
        TextureType::Texture2D | TextureType::TextureCubemap => vk::ImageType::TYPE_2D,
    }
}

pub fn tiling(value: TextureTiling) -> vk::ImageTiling {
    match value {
        TextureTiling::Optimal => vk::ImageTiling::OPTIMAL,
        TextureTiling::Linear => vk::ImageTiling::LINEAR,
    }
}

pub fn image_layout(value: TextureLayout) -> vk::ImageLayout {
    match value {
        TextureLayout::Undefined => vk::ImageLayout::UNDEFINED,
        TextureLayout::General => vk::ImageLayout::GENERAL,
        TextureLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        TextureLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        TextureLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        TextureLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        TextureLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        TextureLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Access mask and pipeline stage a layout is consumed or produced at.
/// Barriers derive their masks from the layout pair, the way the original
/// transfer paths always have.
pub fn layout_access(value: TextureLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match value {
        TextureLayout::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        TextureLayout::General => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
        TextureLayout::TransferSrc => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        TextureLayout::TransferDst => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        TextureLayout::ShaderReadOnly => {
            (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER)
        }
        TextureLayout::ColorAttachment => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        TextureLayout::DepthStencilAttachment => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        TextureLayout::PresentSrc => {
            (vk::AccessFlags::MEMORY_READ, vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
    }
}

pub fn filter(value: SamplerFilter) -> vk::Filter {
    match value {
        SamplerFilter::Nearest => vk::Filter::NEAREST,
        SamplerFilter::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode(value: SamplerMipmapMode) -> vk::SamplerMipmapMode {
    match value {
        SamplerMipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerMipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode(value: SamplerAddressMode) -> vk::SamplerAddressMode {
    match value {
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        SamplerAddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
    }
}

pub fn load_op(value: AttachmentLoadOp) -> vk::AttachmentLoadOp {
    match value {
        AttachmentLoadOp::Load => vk::AttachmentLoadOp::LOAD,
        AttachmentLoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        AttachmentLoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn store_op(value: AttachmentStoreOp) -> vk::AttachmentStoreOp {
    match value {
        AttachmentStoreOp::Store => vk::AttachmentStoreOp::STORE,
        AttachmentStoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub fn ycbcr_model(value: YcbcrModel) -> vk::SamplerYcbcrModelConversion {
    match value {
        YcbcrModel::Identity => vk::SamplerYcbcrModelConversion::RGB_IDENTITY,
        YcbcrModel::Bt601 => vk::SamplerYcbcrModelConversion::YCBCR_601,
        YcbcrModel::Bt709 => vk::SamplerYcbcrModelConversion::YCBCR_709,
        YcbcrModel::Bt2020 => vk::SamplerYcbcrModelConversion::YCBCR_2020,
    }
}

pub fn ycbcr_range(value: YcbcrRange) -> vk::SamplerYcbcrRange {
    match value {
        YcbcrRange::Full => vk::SamplerYcbcrRange::ITU_FULL,
        YcbcrRange::Narrow => vk::SamplerYcbcrRange::ITU_NARROW,
    }
}

pub fn chroma_location(value: ChromaLocation) -> vk::ChromaLocation {
    match value {
        ChromaLocation::CositedEven => vk::ChromaLocation::COSITED_EVEN,
        ChromaLocation::Midpoint => vk::ChromaLocation::MIDPOINT,
    }
}

pub fn image_usage(value: TextureUsageFlags, has_depth: bool) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::empty();
    if value.contains(TextureUsageFlags::SAMPLE) {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if value.contains(TextureUsageFlags::COLOR_ATTACHMENT) && !has_depth {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if value.contains(TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT) || has_depth {
        usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if value.contains(TextureUsageFlags::TRANSFER_SRC) {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if value.contains(TextureUsageFlags::TRANSFER_DST) {
        usage |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    usage
}

pub fn buffer_usage(value: BufferUsageFlags) -> vk::BufferUsageFlags {
    let mut usage = vk::BufferUsageFlags::empty();
    if value.contains(BufferUsageFlags::TRANSFER_SRC) {
        usage |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if value.contains(BufferUsageFlags::TRANSFER_DST) {
        usage |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if value.contains(BufferUsageFlags::UNIFORM_BUFFER) {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if value.contains(BufferUsageFlags::STORAGE_BUFFER) {
        usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if value.contains(BufferUsageFlags::INDEX_BUFFER) {
        usage |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if value.contains(BufferUsageFlags::VERTEX_BUFFER) {
        usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if value.contains(BufferUsageFlags::INDIRECT_BUFFER) {
        usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    usage
}

pub fn format_features(
    usage: TextureUsageFlags,
    has_depth: bool,
) -> vk::FormatFeatureFlags {
    let mut features = vk::FormatFeatureFlags::empty();
    if usage.contains(TextureUsageFlags::SAMPLE) {
        features |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
    }
    if usage.contains(TextureUsageFlags::COLOR_ATTACHMENT) && !has_depth {
        features |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsageFlags::DEPTH_STENCIL_ATTACHMENT) || has_depth {
        features |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsageFlags::TRANSFER_SRC) {
        features |= vk::FormatFeatureFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsageFlags::TRANSFER_DST) {
        features |= vk::FormatFeatureFlags::TRANSFER_DST;
    }
    features
}

pub fn color_components(value: ColorComponentFlags) -> vk::ColorComponentFlags {
    let mut flags = vk::ColorComponentFlags::empty();
    if value.contains(ColorComponentFlags::R) {
        flags |= vk::ColorComponentFlags::R;
    }
    if value.contains(ColorComponentFlags::G) {
        flags |= vk::ColorComponentFlags::G;
    }
    if value.contains(ColorComponentFlags::B) {
        flags |= vk::ColorComponentFlags::B;
    }
    if value.contains(ColorComponentFlags::A) {
        flags |= vk::ColorComponentFlags::A;
    }
    flags
}

pub fn extent(value: Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: value.width,
        height: value.height,
    }
}

pub fn offset(value: Offset2D) -> vk::Offset2D {
    vk::Offset2D {
        x: value.x,
        y: value.y,
    }
}

pub fn rect(value: Rect2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: offset(value.offset),
        extent: extent(value.extent),
    }
}

pub fn viewport(value: Viewport) -> vk::Viewport {
    vk::Viewport {
        x: value.x,
        y: value.y,
        width: value.width,
        height: value.height,
        min_depth: value.min_depth,
        max_depth: value.max_depth,
    }
}

pub fn clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(rgba) => vk::ClearValue {
            color: vk::ClearColorValue { float32: rgba },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_formats_carry_depth_aspect() {
        assert_eq!(aspect(Format::D32Sfloat), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect(Format::R8G8B8A8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_advanced_blend_ops_map_to_extension_values() {
        assert_eq!(blend_op(BlendOp::Add), vk::BlendOp::ADD);
        assert_eq!(blend_op(BlendOp::Screen), vk::BlendOp::SCREEN_EXT);
    }

    #[test]
    fn test_undefined_layout_has_no_access() {
        let (access, stage) = layout_access(TextureLayout::Undefined);
        assert_eq!(access, vk::AccessFlags::empty());
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }
}
