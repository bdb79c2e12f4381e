//! Import of externally owned images into driver textures.
//!
//! A producer (video decoder, camera, compositor client) owns the OS buffer
//! and exports one dma-buf descriptor per memory plane. This module wraps
//! the buffer in driver objects it owns outright, while the buffer itself is
//! only reference-counted through [`SurfaceReferenceManager`] and never
//! destroyed here. A failed import unwinds exactly the acquisitions it made.

pub mod surface;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::api::info::SamplerCreateInfo;
use crate::api::types::{
    ChromaLocation, CompareOp, Extent2D, Format, SamplerAddressMode, SamplerFilter,
    SamplerMipmapMode, TextureUsageFlags, YcbcrModel, YcbcrRange,
};
use crate::driver::{
    ConversionId, ExternalImageDesc, GpuDriver, ImageId, ImageViewDesc, ImageViewId, MemoryId,
    SamplerId, YcbcrConversionDesc,
};
use crate::error::{BackendError, BackendResult};

pub use surface::{NativeBufferId, SurfaceReferenceGuard, SurfaceReferenceManager};

/// Memory layout of one plane of a native buffer.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    /// Descriptor backing the plane, still owned by the producer. Importers
    /// duplicate it, so the producer stays free to close its copy.
    pub fd: RawFd,
    /// Allocation size in bytes.
    pub size: u64,
    /// Byte offset of the plane within the allocation.
    pub offset: u64,
}

/// The producer side of an externally owned image.
///
/// Implementations wrap a platform buffer and remain authoritative for its
/// lifetime; the import path pins the buffer through the reference manager
/// while GPU objects point into it.
pub trait NativeImageSource: SurfaceReferenceManager {
    /// Whether the underlying buffer is currently usable.
    fn is_valid(&self) -> bool;

    /// Pixel format of the buffer, `Format::Undefined` when it has no GPU
    /// mapping.
    fn format(&self) -> Format;

    /// Buffer extent.
    fn extent(&self) -> Extent2D;

    /// DRM format modifier describing the buffer's memory layout.
    fn modifier(&self) -> u64;

    /// Number of distinct allocations backing the buffer. One for
    /// single-plane and non-disjoint layouts.
    fn plane_count(&self) -> u32;

    /// Asks the owner to materialize the buffer. Returns whether a current
    /// buffer exists afterwards.
    fn create_resource(&self) -> bool;

    /// Token naming the buffer backing the current frame.
    fn current_buffer(&self) -> Option<NativeBufferId>;

    /// Layout of one plane's allocation.
    fn plane(&self, index: u32) -> BackendResult<PlaneLayout>;

    /// Pins plane `index`'s allocation so the owner cannot recycle it while
    /// imported memory points into it.
    fn ref_plane_allocation(&self, index: u32);

    /// Releases a pin taken by [`ref_plane_allocation`].
    fn unref_plane_allocation(&self, index: u32);
}

/// Resolves the GPU format and usage for a native source.
///
/// Luma/chroma content is sampled and copied in both directions; RGB
/// content is only sampled and written to.
pub fn format_and_usage(
    source: &dyn NativeImageSource,
) -> BackendResult<(Format, TextureUsageFlags)> {
    if !source.is_valid() {
        return Err(import_failed(
            "validate_source",
            "source reports an invalid buffer",
        ));
    }
    let format = source.format();
    if format == Format::Undefined {
        return Err(import_failed(
            "validate_source",
            "buffer format has no GPU mapping",
        ));
    }
    let usage = if format.is_ycbcr() {
        TextureUsageFlags::SAMPLE | TextureUsageFlags::TRANSFER_SRC | TextureUsageFlags::TRANSFER_DST
    } else {
        TextureUsageFlags::SAMPLE | TextureUsageFlags::TRANSFER_DST
    };
    Ok((format, usage))
}

fn import_failed(step: &'static str, reason: impl Into<String>) -> BackendError {
    BackendError::NativeImageImport {
        step,
        reason: reason.into(),
    }
}

/// Samplers over external content clamp to edge and always use normalized
/// coordinates.
fn native_sampler_desc() -> SamplerCreateInfo {
    SamplerCreateInfo {
        min_filter: SamplerFilter::Linear,
        mag_filter: SamplerFilter::Linear,
        mipmap_mode: SamplerMipmapMode::Linear,
        address_mode_u: SamplerAddressMode::ClampToEdge,
        address_mode_v: SamplerAddressMode::ClampToEdge,
        address_mode_w: SamplerAddressMode::ClampToEdge,
        anisotropy_enable: false,
        max_anisotropy: 1.0,
        compare_enable: false,
        compare_op: CompareOp::Always,
        unnormalized_coordinates: false,
    }
}

/// Everything acquired by one import call, tracked so a failure partway
/// through can be undone without touching earlier imports' objects.
#[derive(Default)]
struct PartialImport {
    reference_taken: bool,
    referenced_planes: u32,
    plane_fds: Vec<RawFd>,
    /// Prefix of `plane_fds` whose ownership passed to the driver.
    consumed_fds: usize,
    memories: Vec<MemoryId>,
    image: Option<ImageId>,
    conversion: Option<ConversionId>,
    view: Option<ImageViewId>,
    sampler: Option<SamplerId>,
}

/// Import bundle of one native texture.
///
/// Owns the imported memory plus the sampler and conversion derived from
/// the buffer's format. The memory is released on every buffer swap via
/// [`NativeImportState::reset`]; the sampler and conversion survive swaps
/// because they depend only on the format, and fall with
/// [`NativeImportState::destroy`].
pub struct NativeImportState {
    source: Arc<dyn NativeImageSource>,
    reference: SurfaceReferenceGuard,
    referenced_planes: u32,
    memories: Vec<MemoryId>,
    conversion: Option<ConversionId>,
    sampler: Option<SamplerId>,
}

impl std::fmt::Debug for NativeImportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeImportState")
            .field("source", &"<dyn NativeImageSource>")
            .field("reference", &self.reference)
            .field("referenced_planes", &self.referenced_planes)
            .field("memories", &self.memories)
            .field("conversion", &self.conversion)
            .field("sampler", &self.sampler)
            .finish()
    }
}

impl NativeImportState {
    /// An empty container bound to `source`.
    pub fn new(source: Arc<dyn NativeImageSource>) -> Self {
        NativeImportState {
            source,
            reference: SurfaceReferenceGuard::new(),
            referenced_planes: 0,
            memories: Vec::new(),
            conversion: None,
            sampler: None,
        }
    }

    /// The producer this texture wraps.
    pub fn source(&self) -> &Arc<dyn NativeImageSource> {
        &self.source
    }

    /// Sampler to bind when drawing this texture, once imported.
    pub fn sampler(&self) -> Option<SamplerId> {
        self.sampler
    }

    /// The luma/chroma conversion, for formats that need one.
    pub fn conversion(&self) -> Option<ConversionId> {
        self.conversion
    }

    /// Pins the producer's current buffer. Returns false when a reference
    /// is already held.
    pub fn acquire_current_reference(&mut self) -> bool {
        let Some(buffer) = self.source.current_buffer() else {
            return false;
        };
        self.reference.acquire(&*self.source, buffer)
    }

    /// Unpins the buffer pinned by [`acquire_current_reference`] or by an
    /// import. Returns false when nothing is held.
    ///
    /// [`acquire_current_reference`]: NativeImportState::acquire_current_reference
    pub fn release_current_reference(&mut self) -> bool {
        self.reference.release(&*self.source)
    }

    /// Runs the import state machine against the producer's current buffer.
    ///
    /// On success the returned image and view belong to the caller; memory,
    /// conversion and sampler stay in this container, and the buffer
    /// reference remains held until [`NativeImportState::reset`]. On failure
    /// every acquisition made by this call has been undone.
    pub fn import(&mut self, driver: &dyn GpuDriver) -> BackendResult<(ImageId, ImageViewId)> {
        // Stale objects from a previous buffer must not outlive it.
        self.release_imported_memory(driver);

        let mut partial = PartialImport::default();
        match self.run_import(driver, &mut partial) {
            Ok((image, view)) => {
                self.commit(partial);
                Ok((image, view))
            }
            Err(err) => {
                self.rollback(driver, partial);
                Err(err)
            }
        }
    }

    fn run_import(
        &mut self,
        driver: &dyn GpuDriver,
        partial: &mut PartialImport,
    ) -> BackendResult<(ImageId, ImageViewId)> {
        let (format, usage) = format_and_usage(&*self.source)?;
        let is_yuv = format.is_ycbcr();

        if !self.source.create_resource() {
            return Err(import_failed(
                "create_resource",
                "owner failed to materialize the buffer",
            ));
        }

        // The buffer must be pinned before any descriptor leaves the owner.
        let Some(buffer) = self.source.current_buffer() else {
            return Err(import_failed(
                "acquire_surface_reference",
                "owner reports no current buffer",
            ));
        };
        if !self.reference.acquire(&*self.source, buffer) {
            return Err(import_failed(
                "acquire_surface_reference",
                "a surface reference is already held",
            ));
        }
        partial.reference_taken = true;

        let plane_count = self.source.plane_count();
        if plane_count == 0 {
            return Err(import_failed("export_plane_fds", "source reports zero planes"));
        }
        let mut layouts = Vec::with_capacity(plane_count as usize);
        for index in 0..plane_count {
            let layout = self
                .source
                .plane(index)
                .map_err(|err| import_failed("export_plane_fds", err.to_string()))?;
            let fd = unsafe { libc::dup(layout.fd) };
            if fd < 0 {
                return Err(import_failed(
                    "export_plane_fds",
                    format!("dup failed for plane {index}"),
                ));
            }
            partial.plane_fds.push(fd);
            self.source.ref_plane_allocation(index);
            partial.referenced_planes += 1;
            layouts.push(layout);
        }

        let mut chroma_support = None;
        if is_yuv {
            let support = driver
                .ycbcr_support(format)
                .map_err(|err| import_failed("query_ycbcr_support", err.to_string()))?;
            if !support.cosited_chroma && !support.midpoint_chroma {
                return Err(import_failed(
                    "query_ycbcr_support",
                    "device cannot site chroma samples for this format",
                ));
            }
            chroma_support = Some(support);
        }

        let extent = self.source.extent();
        let image = driver
            .create_external_image(&ExternalImageDesc {
                extent,
                format,
                usage,
                modifier: self.source.modifier(),
                plane_count,
                disjoint: plane_count > 1,
            })
            .map_err(|err| import_failed("create_external_image", err.to_string()))?;
        partial.image = Some(image);

        for (index, layout) in layouts.iter().enumerate() {
            let fd = partial.plane_fds[index];
            let memory = driver
                .import_memory_fd(fd, layout.size, image)
                .map_err(|err| import_failed("import_memory_fd", err.to_string()))?;
            partial.consumed_fds = index + 1;
            partial.memories.push(memory);
        }
        let bindings: Vec<(MemoryId, u64)> = partial
            .memories
            .iter()
            .zip(&layouts)
            .map(|(&memory, layout)| (memory, layout.offset))
            .collect();
        driver
            .bind_image_planes(image, &bindings)
            .map_err(|err| import_failed("bind_image_planes", err.to_string()))?;

        let conversion = match (chroma_support, self.conversion) {
            (None, _) => None,
            (Some(_), Some(existing)) => Some(existing),
            (Some(support), None) => {
                let chroma = if support.cosited_chroma {
                    ChromaLocation::CositedEven
                } else {
                    ChromaLocation::Midpoint
                };
                let desc = YcbcrConversionDesc {
                    format,
                    model: YcbcrModel::Bt709,
                    range: YcbcrRange::Full,
                    x_chroma_offset: chroma,
                    y_chroma_offset: chroma,
                    chroma_filter: if support.linear_filter {
                        SamplerFilter::Linear
                    } else {
                        SamplerFilter::Nearest
                    },
                };
                let conversion = driver
                    .create_ycbcr_conversion(&desc)
                    .map_err(|err| import_failed("create_ycbcr_conversion", err.to_string()))?;
                partial.conversion = Some(conversion);
                Some(conversion)
            }
        };

        let view = driver
            .create_image_view(&ImageViewDesc {
                image,
                format,
                base_mip: 0,
                mip_count: 1,
                base_layer: 0,
                layer_count: 1,
                conversion,
            })
            .map_err(|err| import_failed("create_image_view", err.to_string()))?;
        partial.view = Some(view);

        if self.sampler.is_none() {
            let desc = native_sampler_desc();
            let sampler = match conversion {
                Some(conversion) => driver.create_sampler_with_conversion(&desc, conversion),
                None => driver.create_sampler(&desc),
            }
            .map_err(|err| import_failed("create_sampler", err.to_string()))?;
            partial.sampler = Some(sampler);
        }

        log::debug!(
            "imported native image {}x{} {:?}, {} plane(s)",
            extent.width,
            extent.height,
            format,
            plane_count
        );
        Ok((image, view))
    }

    fn commit(&mut self, partial: PartialImport) {
        self.memories = partial.memories;
        self.referenced_planes = partial.referenced_planes;
        if partial.conversion.is_some() {
            self.conversion = partial.conversion;
        }
        if partial.sampler.is_some() {
            self.sampler = partial.sampler;
        }
    }

    /// Unwinds one failed import, in reverse acquisition order.
    fn rollback(&mut self, driver: &dyn GpuDriver, partial: PartialImport) {
        if let Some(sampler) = partial.sampler {
            driver.destroy_sampler(sampler);
        }
        if let Some(view) = partial.view {
            driver.destroy_image_view(view);
        }
        if let Some(conversion) = partial.conversion {
            driver.destroy_ycbcr_conversion(conversion);
        }
        for memory in partial.memories {
            driver.free_memory(memory);
        }
        if let Some(image) = partial.image {
            driver.destroy_image(image);
        }
        for &fd in &partial.plane_fds[partial.consumed_fds..] {
            unsafe {
                libc::close(fd);
            }
        }
        for index in 0..partial.referenced_planes {
            self.source.unref_plane_allocation(index);
        }
        if partial.reference_taken {
            self.reference.release(&*self.source);
        }
    }

    fn release_imported_memory(&mut self, driver: &dyn GpuDriver) {
        for memory in self.memories.drain(..) {
            driver.free_memory(memory);
        }
        for index in 0..self.referenced_planes {
            self.source.unref_plane_allocation(index);
        }
        self.referenced_planes = 0;
    }

    /// Releases everything tied to the current buffer: imported memory,
    /// plane pins and the surface reference. The caller destroys the image
    /// and view it adopted. Sampler and conversion stay for the next
    /// import. Called on every buffer swap.
    pub fn reset(&mut self, driver: &dyn GpuDriver) {
        self.release_imported_memory(driver);
        self.reference.release(&*self.source);
    }

    /// Reset plus teardown of the format-bound objects. Called once, on
    /// texture destruction.
    pub fn destroy(mut self, driver: &dyn GpuDriver) {
        self.reset(driver);
        if let Some(sampler) = self.sampler.take() {
            driver.destroy_sampler(sampler);
        }
        if let Some(conversion) = self.conversion.take() {
            driver.destroy_ycbcr_conversion(conversion);
        }
        self.reference.assert_balanced();
    }
}

/// Product of a successful native texture initialization.
#[derive(Debug)]
pub struct ImportedNative {
    /// The imported image, for the texture wrapper to adopt.
    pub image: ImageId,
    /// Default view over the image.
    pub view: ImageViewId,
    /// Container tracking the import for later resets and teardown.
    pub state: NativeImportState,
}

/// Builds a texture's driver objects around an externally owned buffer.
pub fn initialize_native_texture(
    driver: &dyn GpuDriver,
    source: Arc<dyn NativeImageSource>,
) -> BackendResult<ImportedNative> {
    let mut state = NativeImportState::new(source);
    let (image, view) = state.import(driver)?;
    Ok(ImportedNative { image, view, state })
}
