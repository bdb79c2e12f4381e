//! Texture resource wrapper.

use crate::api::info::{TextureCreateInfo, TextureProperties};
use crate::api::types::{Format, TextureLayout, TextureTiling, TextureUsageFlags};
use crate::driver::{GpuDriver, ImageDesc, ImageId, ImageViewDesc, ImageViewId};
use crate::error::BackendResult;
use crate::native_image::NativeImportState;
use crate::resources::{full_mip_chain, LifecycleState};

/// A texture owned by the controller.
///
/// Regular textures allocate lazily: the driver image is created on the
/// first create-queue drain or when a transfer needs the backing to exist.
/// Native textures are populated by the import path instead and never
/// allocate through [`TextureResource::ensure_initialized`].
#[derive(Debug)]
pub struct TextureResource {
    info: TextureCreateInfo,
    storage_format: Format,
    mip_levels: u32,
    image: Option<ImageId>,
    view: Option<ImageViewId>,
    current_layout: TextureLayout,
    state: LifecycleState,
    native: Option<NativeImportState>,
}

impl TextureResource {
    /// Wraps a create-info with its emulation decision already made.
    pub fn new(info: TextureCreateInfo, storage_format: Format) -> Self {
        let mip_levels = if info.mip_levels == 0 {
            full_mip_chain(info.size.width, info.size.height)
        } else {
            info.mip_levels
        };
        TextureResource {
            storage_format,
            mip_levels,
            image: None,
            view: None,
            current_layout: TextureLayout::Undefined,
            state: LifecycleState::PendingCreate,
            native: None,
            info,
        }
    }

    /// The creation descriptor.
    pub fn info(&self) -> &TextureCreateInfo {
        &self.info
    }

    /// The format actually stored on the device.
    pub fn storage_format(&self) -> Format {
        self.storage_format
    }

    /// Whether uploads convert in software before reaching the device.
    pub fn is_emulated(&self) -> bool {
        self.storage_format != self.info.format
    }

    /// Allocated mip level count.
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Whether this texture wraps an externally owned buffer.
    pub fn is_native(&self) -> bool {
        self.info.native_image.is_some()
    }

    /// Whether CPU writes may go straight into the backing memory.
    pub fn is_direct_writable(&self) -> bool {
        self.info.tiling == TextureTiling::Linear && !self.is_native()
    }

    /// The driver image, once instantiated.
    pub fn image(&self) -> Option<ImageId> {
        self.image
    }

    /// The default view, once instantiated.
    pub fn view(&self) -> Option<ImageViewId> {
        self.view
    }

    /// Current image layout.
    pub fn current_layout(&self) -> TextureLayout {
        self.current_layout
    }

    /// Records a layout transition performed by replay or transfer code.
    pub fn set_current_layout(&mut self, layout: TextureLayout) {
        self.current_layout = layout;
    }

    /// Lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// GPU-side layout facts exposed to the rendering core.
    pub fn properties(&self) -> TextureProperties {
        TextureProperties {
            format: self.info.format,
            emulated: self.is_emulated(),
            storage_format: self.storage_format,
            extent: self.info.size,
            packed: self.info.tiling != TextureTiling::Linear,
        }
    }

    /// Marks the resource queued for destruction.
    pub fn mark_discarded(&mut self) {
        self.state = LifecycleState::PendingDiscard;
    }

    /// Import bundle of a native texture.
    pub fn native_state(&self) -> Option<&NativeImportState> {
        self.native.as_ref()
    }

    /// Mutable import bundle of a native texture.
    pub fn native_state_mut(&mut self) -> Option<&mut NativeImportState> {
        self.native.as_mut()
    }

    /// Installs the driver objects produced by a native image import.
    pub fn adopt_imported(
        &mut self,
        image: ImageId,
        view: ImageViewId,
        native: NativeImportState,
    ) {
        self.image = Some(image);
        self.view = Some(view);
        self.native = Some(native);
        self.current_layout = TextureLayout::Undefined;
        self.state = LifecycleState::Live;
    }

    /// Whether a new create-info may take over this texture's native
    /// objects. Native textures never recycle; their driver objects are
    /// bound to one specific external buffer.
    pub fn is_compatible_with(&self, info: &TextureCreateInfo) -> bool {
        !self.is_native()
            && info.native_image.is_none()
            && self.info.texture_type == info.texture_type
            && self.info.size == info.size
            && self.info.format == info.format
            && self.info.usage == info.usage
            && self.info.tiling == info.tiling
            && self.info.mip_levels == info.mip_levels
    }

    /// Takes the driver objects out of this wrapper for reuse elsewhere.
    /// The wrapper is left empty and must not be initialized again.
    pub fn take_driver_objects(&mut self) -> (Option<ImageId>, Option<ImageViewId>) {
        (self.image.take(), self.view.take())
    }

    /// Installs driver objects taken from a recycled predecessor.
    pub fn adopt_driver_objects(
        &mut self,
        image: Option<ImageId>,
        view: Option<ImageViewId>,
        layout: TextureLayout,
    ) {
        self.image = image;
        self.view = view;
        self.current_layout = layout;
        if self.image.is_some() {
            self.state = LifecycleState::Live;
        }
    }

    /// Creates the driver image and default view if not yet present.
    pub fn ensure_initialized(&mut self, driver: &dyn GpuDriver) -> BackendResult<()> {
        if self.image.is_some() || self.is_native() {
            return Ok(());
        }

        // Uploads always need a transfer destination; mip generation blits
        // from lower levels.
        let mut usage = self.info.usage | TextureUsageFlags::TRANSFER_DST;
        if self.mip_levels > 1 {
            usage |= TextureUsageFlags::TRANSFER_SRC;
        }

        let image = driver.create_image(&ImageDesc {
            image_type: self.info.texture_type,
            extent: self.info.size,
            format: self.storage_format,
            mip_levels: self.mip_levels,
            array_layers: 1,
            tiling: self.info.tiling,
            usage,
            cpu_accessible: self.info.tiling == TextureTiling::Linear,
        })?;

        let view = match driver.create_image_view(&ImageViewDesc {
            image,
            format: self.storage_format,
            base_mip: 0,
            mip_count: self.mip_levels,
            base_layer: 0,
            layer_count: 1,
            conversion: None,
        }) {
            Ok(view) => view,
            Err(e) => {
                driver.destroy_image(image);
                return Err(e);
            }
        };

        self.image = Some(image);
        self.view = Some(view);
        self.current_layout = TextureLayout::Undefined;
        self.state = LifecycleState::Live;
        log::trace!(
            "texture initialized: {}x{} {:?} ({} mips)",
            self.info.size.width,
            self.info.size.height,
            self.storage_format,
            self.mip_levels
        );
        Ok(())
    }

    /// Destroys all driver objects this wrapper still owns.
    pub fn destroy(&mut self, driver: &dyn GpuDriver) {
        if let Some(native) = self.native.take() {
            native.destroy(driver);
        }
        if let Some(view) = self.view.take() {
            driver.destroy_image_view(view);
        }
        if let Some(image) = self.image.take() {
            driver.destroy_image(image);
        }
    }
}

/// Decides the stored format for a requested format, falling back to the
/// widened software-converted layout when the device lacks support.
pub fn resolve_storage_format(
    driver: &dyn GpuDriver,
    format: Format,
    tiling: TextureTiling,
    usage: TextureUsageFlags,
) -> Format {
    if driver.is_format_supported(format, tiling, usage | TextureUsageFlags::TRANSFER_DST) {
        format
    } else {
        format.storage_format()
    }
}
