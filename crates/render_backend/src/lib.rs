//! # Render Backend
//!
//! A retained-mode graphics backend: scene threads record API-agnostic
//! command buffers and hand them to a [`GraphicsController`], which owns
//! every GPU resource and replays submissions against a [`driver::GpuDriver`]
//! implementation.
//!
//! ## Features
//!
//! - **Recorded command buffers**: commands are queued CPU-side and replayed
//!   in submission order at flush, so recording never touches the driver
//! - **Resource recycling**: create calls accept a predecessor handle and
//!   reuse its driver objects when the descriptions are compatible
//! - **Deferred creation**: textures, buffers and framebuffers allocate in a
//!   per-frame queue drain, not at the create call
//! - **Threaded transfers**: texture uploads are encoded by a worker pool
//!   into staging memory and copied in batched GPU submissions
//! - **Native image import**: externally-allocated buffers (windows,
//!   pixmaps) bind as sampled textures via fd import
//! - **Pipeline caching**: compiled pipeline variants are shared and
//!   persisted to disk across runs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use render_backend::api::info::SubmitInfo;
//! use render_backend::api::types::SubmitFlags;
//! use render_backend::driver::GpuDriver;
//! use render_backend::{BackendResult, BackendSettings, GraphicsController};
//!
//! fn render_one_frame(driver: Arc<dyn GpuDriver>) -> BackendResult<()> {
//!     let settings = BackendSettings::default().apply_env_overrides();
//!     let mut controller = GraphicsController::new(driver, settings);
//!     controller.initialize();
//!
//!     controller.frame_start();
//!     // ... create resources, record command buffers ...
//!     controller.submit_command_buffers(SubmitInfo {
//!         command_buffers: Vec::new(),
//!         flags: SubmitFlags::FLUSH,
//!     })?;
//!
//!     controller.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::too_many_arguments)]

pub mod api;
pub mod command;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod native_image;
pub mod pipeline;
pub mod resources;
pub mod transfer;

pub use config::{BackendSettings, Config, ConfigError};
pub use controller::{FrameStats, GraphicsController, MappedMemory};
pub use error::{BackendError, BackendResult};

/// Common imports for backend users.
pub mod prelude {
    pub use crate::api::handles::{
        BufferHandle, CommandBufferHandle, FramebufferHandle, PipelineHandle, ProgramHandle,
        RenderPassHandle, RenderTargetHandle, SamplerHandle, ShaderHandle, SyncObjectHandle,
        TextureHandle,
    };
    pub use crate::api::info::{
        BufferCreateInfo, CommandBufferCreateInfo, FramebufferCreateInfo, PipelineCreateInfo,
        ProgramCreateInfo, RenderPassCreateInfo, RenderTargetCreateInfo, SamplerCreateInfo,
        ShaderCreateInfo, SubmitInfo, SyncObjectCreateInfo, TextureCreateInfo, TextureUpdateInfo,
        UpdateSource,
    };
    pub use crate::api::types::{
        BufferUsageFlags, ClearValue, Extent2D, Format, Rect2D, SubmitFlags, TextureUsageFlags,
        Viewport,
    };
    pub use crate::command::CommandBuffer;
    pub use crate::driver::GpuDriver;
    pub use crate::{
        BackendError, BackendResult, BackendSettings, FrameStats, GraphicsController,
    };
}
