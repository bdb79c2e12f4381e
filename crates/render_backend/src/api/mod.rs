//! Public data model: handles, enums, pipeline sub-states and create-infos.

pub mod handles;
pub mod info;
pub mod state;
pub mod types;

pub use handles::{
    BufferHandle, CommandBufferHandle, FramebufferHandle, PipelineHandle, ProgramHandle,
    RenderPassHandle, RenderTargetHandle, SamplerHandle, ShaderHandle, SyncObjectHandle,
    TextureHandle,
};
pub use info::{
    AttachmentBinding, AttachmentDescription, BufferCreateInfo, CommandBufferCreateInfo,
    CommandBufferLevel, FramebufferCreateInfo, MemoryRequirements, PipelineCreateInfo, PipelineStage,
    PixelData, ProgramCreateInfo, RenderPassCreateInfo, RenderTargetCreateInfo,
    SamplerBindingInfo, SamplerCreateInfo, ShaderCreateInfo, SubmitInfo, SyncObjectCreateInfo,
    TextureCreateInfo, TextureProperties, TextureUpdateInfo, UniformBlockInfo, UniformMemberInfo,
    UpdateSource,
};
pub use state::{
    hash_combine, ColorBlendState, ColorComponentFlags, DepthStencilState, InputAssemblyState,
    MultisampleState, RasterizationState, StencilOpState, VertexInputAttribute,
    VertexInputBinding, VertexInputState, ViewportState,
};
pub use types::{
    AttachmentLoadOp, AttachmentStoreOp, BlendEquation, BlendFactor, BlendOp, BufferUsageFlags, ChromaLocation,
    ClearValue, CommandBufferUsageFlags, CompareOp, CullMode, Extent2D, Format, FrontFace,
    IndexFormat, LogicOp, MemoryUsageFlags, Offset2D, PolygonMode, PrimitiveTopology, Rect2D,
    SamplerAddressMode, SamplerFilter, SamplerMipmapMode, StencilOp, SubmitFlags, TextureLayout,
    TextureTiling, TextureType, TextureUsageFlags, VertexInputFormat, VertexInputRate, Viewport,
    YcbcrModel, YcbcrRange,
};
