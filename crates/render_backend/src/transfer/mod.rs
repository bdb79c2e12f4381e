//! CPU-to-GPU resource transfer engine.
//!
//! Texture uploads run in two halves. The CPU half fans per-texture encode
//! tasks out over a fixed worker pool: each task copies (and converts,
//! for emulated formats) source bytes either into the shared staging
//! buffer or straight into mapped linear image memory. The GPU half turns
//! every staged region into a buffer-to-image copy request; requests are
//! drained in overlap-partitioned batches with a fence between batches so
//! copies to the same destination region never reorder.

pub mod convert;
pub mod pool;
pub mod request;
pub mod staging;

pub use pool::WorkerPool;
pub use request::TransferRequest;
pub use staging::StagingBuffer;

use std::sync::{Arc, Mutex, PoisonError};

use slotmap::SlotMap;

use crate::api::handles::{BufferHandle, TextureHandle};
use crate::api::info::{PixelData, TextureUpdateInfo, UpdateSource};
use crate::api::types::{Extent2D, Rect2D, SamplerFilter, TextureLayout};
use crate::config::BackendSettings;
use crate::driver::{BufferId, BufferImageCopy, GpuDriver, ImageBlit, ImageId};
use crate::error::{BackendError, BackendResult};
use crate::resources::{BufferResource, TextureResource};
use crate::transfer::convert::{packed_byte_size, RegionLayout};
use crate::transfer::request::partition_into_batches;
use crate::transfer::staging::{SendPtr, SendSlice};

/// One queued mipmap-generation pass.
#[derive(Debug, Clone, Copy)]
pub struct MipmapRequest {
    /// Image whose chain is generated.
    pub image: ImageId,
    /// Base level extent.
    pub extent: Extent2D,
    /// Total mip levels, including the base.
    pub mip_levels: u32,
    /// Layout of every level before the pass.
    pub base_layout: TextureLayout,
}

/// Where one encode task writes.
enum TaskDestination {
    /// Range of the shared staging buffer.
    Staging { offset: u64, len: usize },
    /// Range of a mapped linear image.
    Image { base: SendPtr, offset: u64, len: usize },
}

/// Where one encode task reads.
enum TaskSource {
    Borrowed(SendSlice),
    Shared(Arc<PixelData>),
}

struct TaskStep {
    destination: TaskDestination,
    source: TaskSource,
    src_offset: usize,
    region: RegionLayout,
}

/// How one update reaches the GPU.
enum UploadKind {
    Staged {
        staging_offset: u64,
        byte_size: usize,
        region: RegionLayout,
    },
    Direct {
        region: RegionLayout,
        row_pitch: u64,
    },
    FromBuffer {
        src: BufferHandle,
    },
}

struct UploadPlan {
    index: usize,
    kind: UploadKind,
}

/// The transfer engine: worker pool, staging storage, pending GPU copies.
pub struct TransferEngine {
    pool: WorkerPool,
    staging: StagingBuffer,
    pending: Mutex<Vec<TransferRequest>>,
    retired_staging: Vec<BufferId>,
    mipmaps: Vec<MipmapRequest>,
}

impl TransferEngine {
    /// Builds the engine from settings.
    pub fn new(settings: &BackendSettings) -> Self {
        TransferEngine {
            pool: WorkerPool::new(settings.transfer_workers),
            staging: StagingBuffer::new(settings.staging_block_size as u64),
            pending: Mutex::new(Vec::new()),
            retired_staging: Vec::new(),
            mipmaps: Vec::new(),
        }
    }

    /// Pending GPU-side requests not yet drained.
    pub fn pending_request_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<TransferRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a transfer request. Non-deferred requests drain the whole
    /// queue synchronously before returning.
    pub fn schedule_resource_transfer(
        &mut self,
        driver: &dyn GpuDriver,
        request: TransferRequest,
        deferred: bool,
    ) -> BackendResult<()> {
        self.lock_pending().push(request);
        if deferred {
            Ok(())
        } else {
            self.process_resource_transfer_requests(driver)
        }
    }

    /// Queues a mipmap-generation pass, run after other texture work.
    pub fn schedule_texture_mipmaps(&mut self, request: MipmapRequest) {
        if request.mip_levels > 1 {
            self.mipmaps.push(request);
        }
    }

    /// Encodes and schedules a batch of texture updates.
    ///
    /// Blocks on the worker pool until every CPU-side copy has run, then
    /// queues deferred buffer-to-image requests for the staged regions.
    /// Caller-owned source memory is consumed here; shared pixel storage
    /// flagged for release is released exactly once, after the wait.
    pub fn process_texture_updates(
        &mut self,
        driver: &dyn GpuDriver,
        textures: &mut SlotMap<TextureHandle, TextureResource>,
        buffers: &mut SlotMap<BufferHandle, BufferResource>,
        updates: &[TextureUpdateInfo],
        sources: Vec<UpdateSource>,
    ) -> BackendResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.staging.begin_frame();

        // Group updates by destination, preserving first-appearance order;
        // order within a group is request order.
        let mut groups: Vec<(TextureHandle, Vec<UploadPlan>)> = Vec::new();
        for (index, update) in updates.iter().enumerate() {
            let Some(texture) = textures.get(update.destination) else {
                log::error!("texture update {index} targets a destroyed texture");
                continue;
            };
            if update.src_reference >= sources.len() {
                log::error!("texture update {index} references a missing source");
                continue;
            }

            let kind = match &sources[update.src_reference] {
                UpdateSource::Buffer(src) => UploadKind::FromBuffer { src: *src },
                UpdateSource::Memory(_) | UpdateSource::PixelData { .. } => {
                    let dst_format = texture.storage_format();
                    let region = RegionLayout {
                        width: update.src_extent.width,
                        height: update.src_extent.height,
                        src_format: update.src_format,
                        dst_format,
                        src_stride: update.src_stride,
                        dst_pitch: 0,
                    };
                    if texture.is_direct_writable() && update.level == 0 {
                        UploadKind::Direct {
                            region,
                            row_pitch: 0,
                        }
                    } else {
                        let byte_size = packed_byte_size(
                            update.src_extent.width,
                            update.src_extent.height,
                            dst_format,
                        ) as usize;
                        UploadKind::Staged {
                            staging_offset: self.staging.claim(byte_size as u64),
                            byte_size,
                            region,
                        }
                    }
                }
            };

            let plan = UploadPlan { index, kind };
            match groups.iter_mut().find(|(h, _)| *h == update.destination) {
                Some((_, plans)) => plans.push(plan),
                None => groups.push((update.destination, vec![plan])),
            }
        }

        // GPU backing must exist before staging is mapped or requests built.
        for (handle, plans) in &mut groups {
            let Some(texture) = textures.get_mut(*handle) else {
                continue;
            };
            texture.ensure_initialized(driver)?;
            let image = texture
                .image()
                .ok_or_else(|| BackendError::invalid("initialized texture lost its image"))?;
            for plan in plans.iter_mut() {
                if let UploadKind::Direct { row_pitch, .. } = &mut plan.kind {
                    *row_pitch = driver.image_row_pitch(image, 0)?;
                }
            }
        }

        if let Some(retired) = self.staging.ensure_capacity(driver)? {
            self.retired_staging.push(retired);
        }

        let staging_ptr = if self.staging.used() > 0 {
            Some(self.staging.map(driver)?)
        } else {
            None
        };
        let mut mapped_images: Vec<(ImageId, SendPtr)> = Vec::new();
        let map_result = self.run_encode_tasks(
            driver,
            textures,
            updates,
            &sources,
            &groups,
            staging_ptr,
            &mut mapped_images,
        );
        if staging_ptr.is_some() {
            self.staging.unmap(driver)?;
        }
        for (image, _) in mapped_images {
            driver.unmap_image(image);
        }
        map_result?;

        self.queue_upload_requests(driver, textures, buffers, updates, &groups)?;

        for source in &sources {
            if let UpdateSource::PixelData {
                data,
                release_after_upload: true,
            } = source
            {
                data.release_storage();
            }
        }
        log::debug!(
            "processed {} texture updates across {} textures ({} staged bytes)",
            updates.len(),
            groups.len(),
            self.staging.used()
        );
        Ok(())
    }

    /// Builds one worker task per destination texture and blocks until all
    /// of them have encoded their updates.
    #[allow(clippy::too_many_arguments)]
    fn run_encode_tasks(
        &self,
        driver: &dyn GpuDriver,
        textures: &SlotMap<TextureHandle, TextureResource>,
        updates: &[TextureUpdateInfo],
        sources: &[UpdateSource],
        groups: &[(TextureHandle, Vec<UploadPlan>)],
        staging_ptr: Option<SendPtr>,
        mapped_images: &mut Vec<(ImageId, SendPtr)>,
    ) -> BackendResult<()> {
        let mut tasks: Vec<Box<dyn FnOnce() + Send>> = Vec::with_capacity(groups.len());

        for (handle, plans) in groups {
            let mut steps = Vec::new();
            for plan in plans {
                let update = &updates[plan.index];
                let (destination, region) = match &plan.kind {
                    UploadKind::Staged {
                        staging_offset,
                        byte_size,
                        region,
                    } => {
                        if staging_ptr.is_none() {
                            continue;
                        }
                        (
                            TaskDestination::Staging {
                                offset: *staging_offset,
                                len: *byte_size,
                            },
                            *region,
                        )
                    }
                    UploadKind::Direct { region, row_pitch } => {
                        let Some(texture) = textures.get(*handle) else {
                            continue;
                        };
                        let Some(image) = texture.image() else {
                            continue;
                        };
                        let base = match mapped_images.iter().find(|(id, _)| *id == image) {
                            Some((_, ptr)) => *ptr,
                            None => {
                                let ptr = SendPtr::new(driver.map_image(image)?);
                                mapped_images.push((image, ptr));
                                ptr
                            }
                        };
                        let bpp = u64::from(region.dst_format.bytes_per_pixel());
                        let offset = u64::from(update.dst_offset.y.max(0) as u32) * row_pitch
                            + u64::from(update.dst_offset.x.max(0) as u32) * bpp;
                        let len = (region.height as u64).saturating_sub(1) as usize
                            * *row_pitch as usize
                            + region.width as usize * bpp as usize;
                        let mut region = *region;
                        region.dst_pitch = *row_pitch as u32;
                        (TaskDestination::Image { base, offset, len }, region)
                    }
                    UploadKind::FromBuffer { .. } => continue,
                };

                let source = match &sources[update.src_reference] {
                    UpdateSource::Memory(bytes) => TaskSource::Borrowed(SendSlice::new(bytes)),
                    UpdateSource::PixelData { data, .. } => TaskSource::Shared(Arc::clone(data)),
                    UpdateSource::Buffer(_) => continue,
                };
                steps.push(TaskStep {
                    destination,
                    source,
                    src_offset: update.src_offset as usize,
                    region,
                });
            }

            if steps.is_empty() {
                continue;
            }
            let staging_base = staging_ptr;
            tasks.push(Box::new(move || {
                for step in steps {
                    run_task_step(step, staging_base);
                }
            }));
        }

        self.pool.submit(tasks).wait();
        Ok(())
    }

    /// Queues the GPU-side copies for every staged or buffer-sourced update
    /// and records the resulting texture layouts.
    fn queue_upload_requests(
        &mut self,
        driver: &dyn GpuDriver,
        textures: &mut SlotMap<TextureHandle, TextureResource>,
        buffers: &mut SlotMap<BufferHandle, BufferResource>,
        updates: &[TextureUpdateInfo],
        groups: &[(TextureHandle, Vec<UploadPlan>)],
    ) -> BackendResult<()> {
        let staging_id = self.staging.id();
        let mut queued = self.lock_pending();

        for (handle, plans) in groups {
            let Some(texture) = textures.get(*handle) else {
                continue;
            };
            let Some(image) = texture.image() else {
                continue;
            };
            let dst_layout = texture.current_layout();

            for plan in plans {
                let update = &updates[plan.index];
                match &plan.kind {
                    UploadKind::Staged { staging_offset, .. } => {
                        let src = staging_id.ok_or_else(|| {
                            BackendError::invalid("staged update without a staging buffer")
                        })?;
                        queued.push(TransferRequest::CopyBufferToImage {
                            src,
                            dst: image,
                            dst_layout,
                            copy: BufferImageCopy {
                                buffer_offset: *staging_offset,
                                buffer_row_length: 0,
                                image_offset: update.dst_offset,
                                image_extent: update.src_extent,
                                mip_level: update.level,
                                base_layer: update.layer,
                                layer_count: 1,
                            },
                        });
                    }
                    UploadKind::FromBuffer { src } => {
                        let Some(buffer) = buffers.get_mut(*src) else {
                            log::error!("texture update sources a destroyed buffer");
                            continue;
                        };
                        buffer.ensure_initialized(driver)?;
                        let Some(src_id) = buffer.buffer() else {
                            continue;
                        };
                        let bpp = texture.storage_format().bytes_per_pixel();
                        let row_length = if update.src_stride == 0 || bpp == 0 {
                            0
                        } else {
                            update.src_stride / bpp
                        };
                        queued.push(TransferRequest::CopyBufferToImage {
                            src: src_id,
                            dst: image,
                            dst_layout,
                            copy: BufferImageCopy {
                                buffer_offset: u64::from(update.src_offset),
                                buffer_row_length: row_length,
                                image_offset: update.dst_offset,
                                image_extent: update.src_extent,
                                mip_level: update.level,
                                base_layer: update.layer,
                                layer_count: 1,
                            },
                        });
                    }
                    UploadKind::Direct { .. } => {
                        if dst_layout != TextureLayout::ShaderReadOnly {
                            queued.push(TransferRequest::PrepareImage {
                                image,
                                old_layout: dst_layout,
                            });
                        }
                    }
                }
            }
        }
        drop(queued);

        for (handle, _) in groups {
            if let Some(texture) = textures.get_mut(*handle) {
                texture.set_current_layout(TextureLayout::ShaderReadOnly);
            }
        }
        Ok(())
    }

    /// Drains every pending request in overlap-partitioned batches.
    ///
    /// Batch N+1 is only submitted after batch N's fence signals, so two
    /// copies into overlapping regions of one image can never reorder.
    /// Layout preparation happens once before the first batch; the final
    /// transition to shader-readable happens once after the last.
    pub fn process_resource_transfer_requests(
        &mut self,
        driver: &dyn GpuDriver,
    ) -> BackendResult<()> {
        let pending = std::mem::take(&mut *self.lock_pending());
        if pending.is_empty() {
            self.destroy_retired_staging(driver);
            return Ok(());
        }

        let batches = partition_into_batches(&pending);

        // First-occurrence layout wins: later requests to the same image
        // observe it already transitioned.
        let mut copy_destinations: Vec<(ImageId, TextureLayout)> = Vec::new();
        let mut prepare_only: Vec<(ImageId, TextureLayout)> = Vec::new();
        for request in &pending {
            if request.destination_region().is_some() {
                if let Some((image, layout)) = request.prepared_image() {
                    if !copy_destinations.iter().any(|(id, _)| *id == image) {
                        copy_destinations.push((image, layout));
                    }
                }
            }
        }
        for request in &pending {
            if let TransferRequest::PrepareImage { image, old_layout } = request {
                let already_copied = copy_destinations.iter().any(|(id, _)| id == image);
                let already_prepared = prepare_only.iter().any(|(id, _)| id == image);
                if !already_copied && !already_prepared {
                    prepare_only.push((*image, *old_layout));
                }
            }
        }

        log::trace!(
            "draining {} transfer requests in {} batches",
            pending.len(),
            batches.len()
        );
        let fence = driver.create_fence(false)?;
        let drain_result = (|| -> BackendResult<()> {
            for (batch_index, batch) in batches.iter().enumerate() {
                let mut encoder = driver.create_encoder()?;
                encoder.begin()?;

                if batch_index == 0 {
                    for (image, old_layout) in &copy_destinations {
                        encoder.transition_image(
                            *image,
                            *old_layout,
                            TextureLayout::TransferDst,
                            0,
                            u32::MAX,
                            0,
                            u32::MAX,
                        )?;
                    }
                    for (image, old_layout) in &prepare_only {
                        encoder.transition_image(
                            *image,
                            *old_layout,
                            TextureLayout::ShaderReadOnly,
                            0,
                            u32::MAX,
                            0,
                            u32::MAX,
                        )?;
                    }
                }

                for &index in batch {
                    match &pending[index] {
                        TransferRequest::CopyBufferToImage { src, dst, copy, .. } => {
                            encoder.copy_buffer_to_image(
                                *src,
                                *dst,
                                TextureLayout::TransferDst,
                                std::slice::from_ref(copy),
                            )?;
                        }
                        TransferRequest::CopyBufferToBuffer { src, dst, copy } => {
                            encoder.copy_buffer_to_buffer(
                                *src,
                                *dst,
                                std::slice::from_ref(copy),
                            )?;
                        }
                        TransferRequest::CopyImageToImage { src, dst, blit, .. } => {
                            encoder.blit_image(
                                *src,
                                *dst,
                                std::slice::from_ref(blit),
                                SamplerFilter::Nearest,
                            )?;
                        }
                        TransferRequest::PrepareImage { .. } => {}
                    }
                }

                if batch_index == batches.len() - 1 {
                    for (image, _) in &copy_destinations {
                        encoder.transition_image(
                            *image,
                            TextureLayout::TransferDst,
                            TextureLayout::ShaderReadOnly,
                            0,
                            u32::MAX,
                            0,
                            u32::MAX,
                        )?;
                    }
                }

                let encoded = encoder.finish()?;
                driver.submit(vec![encoded], Some(fence))?;
                driver.wait_for_fence(fence, u64::MAX)?;
                driver.reset_fence(fence)?;
            }
            Ok(())
        })();
        driver.destroy_fence(fence);
        drain_result?;

        self.destroy_retired_staging(driver);
        Ok(())
    }

    /// Runs the queued mipmap passes. Each level is blitted from the one
    /// above it, transitioning written levels to transfer-source as the
    /// chain walks down, and the whole image to shader-readable at the end.
    pub fn process_mipmap_requests(&mut self, driver: &dyn GpuDriver) -> BackendResult<()> {
        if self.mipmaps.is_empty() {
            return Ok(());
        }
        let requests = std::mem::take(&mut self.mipmaps);
        let fence = driver.create_fence(false)?;
        let result = (|| -> BackendResult<()> {
            for request in &requests {
                let mut encoder = driver.create_encoder()?;
                encoder.begin()?;
                encoder.transition_image(
                    request.image,
                    request.base_layout,
                    TextureLayout::TransferSrc,
                    0,
                    1,
                    0,
                    u32::MAX,
                )?;
                encoder.transition_image(
                    request.image,
                    request.base_layout,
                    TextureLayout::TransferDst,
                    1,
                    u32::MAX,
                    0,
                    u32::MAX,
                )?;

                for level in 1..request.mip_levels {
                    let src = mip_extent(request.extent, level - 1);
                    let dst = mip_extent(request.extent, level);
                    encoder.blit_image(
                        request.image,
                        request.image,
                        &[ImageBlit {
                            src_region: Rect2D {
                                offset: Default::default(),
                                extent: src,
                            },
                            src_mip: level - 1,
                            dst_region: Rect2D {
                                offset: Default::default(),
                                extent: dst,
                            },
                            dst_mip: level,
                            layer: 0,
                        }],
                        SamplerFilter::Linear,
                    )?;
                    encoder.transition_image(
                        request.image,
                        TextureLayout::TransferDst,
                        TextureLayout::TransferSrc,
                        level,
                        1,
                        0,
                        u32::MAX,
                    )?;
                }

                encoder.transition_image(
                    request.image,
                    TextureLayout::TransferSrc,
                    TextureLayout::ShaderReadOnly,
                    0,
                    u32::MAX,
                    0,
                    u32::MAX,
                )?;
                let encoded = encoder.finish()?;
                driver.submit(vec![encoded], Some(fence))?;
                driver.wait_for_fence(fence, u64::MAX)?;
                driver.reset_fence(fence)?;
            }
            Ok(())
        })();
        driver.destroy_fence(fence);
        result
    }

    fn destroy_retired_staging(&mut self, driver: &dyn GpuDriver) {
        for buffer in self.retired_staging.drain(..) {
            driver.destroy_buffer(buffer);
        }
    }

    /// Drains outstanding work and releases the staging allocation.
    pub fn shutdown(&mut self, driver: &dyn GpuDriver) -> BackendResult<()> {
        self.process_resource_transfer_requests(driver)?;
        self.process_mipmap_requests(driver)?;
        self.staging.destroy(driver);
        Ok(())
    }
}

/// Extent of `level`, halving per level with a floor of one texel.
pub fn mip_extent(base: Extent2D, level: u32) -> Extent2D {
    Extent2D {
        width: (base.width >> level).max(1),
        height: (base.height >> level).max(1),
    }
}

fn run_task_step(step: TaskStep, staging_base: Option<SendPtr>) {
    let dst = match step.destination {
        TaskDestination::Staging { offset, len } => match staging_base {
            // Range disjointness across steps makes this exclusive.
            Some(base) => unsafe { base.slice_at(offset, len) },
            None => return,
        },
        TaskDestination::Image { base, offset, len } => unsafe { base.slice_at(offset, len) },
    };

    let result = match &step.source {
        TaskSource::Borrowed(slice) => {
            // Caller keeps the source alive until the pool wait returns.
            let bytes = unsafe { slice.as_slice() };
            encode_from(bytes, step.src_offset, dst, &step.region)
        }
        TaskSource::Shared(data) => data
            .with_bytes(|bytes| encode_from(bytes, step.src_offset, dst, &step.region))
            .unwrap_or_else(|| {
                Err(BackendError::invalid(
                    "pixel data storage released before upload",
                ))
            }),
    };
    if let Err(err) = result {
        log::error!("texture upload encode failed: {err}");
    }
}

fn encode_from(
    bytes: &[u8],
    src_offset: usize,
    dst: &mut [u8],
    region: &RegionLayout,
) -> BackendResult<()> {
    let src = bytes
        .get(src_offset..)
        .ok_or_else(|| BackendError::invalid("source offset beyond payload"))?;
    convert::encode_region(src, dst, region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::info::TextureCreateInfo;
    use crate::api::types::{Format, Offset2D, TextureTiling, TextureType, TextureUsageFlags};
    use crate::driver::recording::{RecordedOp, RecordingDriver, TimelineEvent};
    use crate::resources::TextureResource;

    fn engine() -> TransferEngine {
        TransferEngine::new(&BackendSettings::default())
    }

    fn texture_map(
        format: Format,
        width: u32,
        height: u32,
        tiling: TextureTiling,
    ) -> (SlotMap<TextureHandle, TextureResource>, TextureHandle) {
        let info = TextureCreateInfo {
            texture_type: TextureType::Texture2D,
            size: Extent2D { width, height },
            format,
            usage: TextureUsageFlags::SAMPLE,
            tiling,
            mip_levels: 1,
            native_image: None,
        };
        let storage = format.storage_format();
        let mut map: SlotMap<TextureHandle, TextureResource> = SlotMap::with_key();
        let handle = map.insert(TextureResource::new(info, storage));
        (map, handle)
    }

    fn full_update(destination: TextureHandle, width: u32, height: u32, format: Format) -> TextureUpdateInfo {
        TextureUpdateInfo {
            destination,
            dst_offset: Offset2D::default(),
            src_reference: 0,
            src_offset: 0,
            src_extent: Extent2D { width, height },
            src_format: format,
            src_stride: 0,
            layer: 0,
            level: 0,
        }
    }

    fn submissions(driver: &RecordingDriver) -> Vec<(Vec<RecordedOp>, bool)> {
        driver
            .timeline()
            .into_iter()
            .filter_map(|event| match event {
                TimelineEvent::Submission { ops, fence } => Some((ops, fence)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_staged_upload_converts_into_staging() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8Unorm, 2, 1, TextureTiling::Optimal);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        let updates = [full_update(handle, 2, 1, Format::R8G8B8Unorm)];
        let sources = vec![UpdateSource::Memory(vec![1, 2, 3, 4, 5, 6])];
        engine
            .process_texture_updates(&driver, &mut textures, &mut buffers, &updates, sources)
            .unwrap();

        assert_eq!(engine.pending_request_count(), 1);
        let staging = engine.staging.id().unwrap();
        let bytes = driver.buffer_bytes(staging).unwrap();
        assert_eq!(&bytes[..8], &[1, 2, 3, 0xff, 4, 5, 6, 0xff]);
    }

    #[test]
    fn test_drained_upload_lands_in_image_memory() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8A8Unorm, 2, 2, TextureTiling::Optimal);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        let updates = [full_update(handle, 2, 2, Format::R8G8B8A8Unorm)];
        let payload: Vec<u8> = (0u8..16).collect();
        let sources = vec![UpdateSource::Memory(payload.clone())];
        engine
            .process_texture_updates(&driver, &mut textures, &mut buffers, &updates, sources)
            .unwrap();
        engine.process_resource_transfer_requests(&driver).unwrap();

        let image = textures[handle].image().unwrap();
        assert_eq!(driver.image_bytes(image).unwrap(), payload);
        assert_eq!(engine.pending_request_count(), 0);
    }

    #[test]
    fn test_overlapping_updates_apply_in_request_order() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8A8Unorm, 4, 4, TextureTiling::Optimal);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        // Three full-texture writes with distinct fill bytes; last wins.
        let updates = [
            TextureUpdateInfo { src_reference: 0, ..full_update(handle, 4, 4, Format::R8G8B8A8Unorm) },
            TextureUpdateInfo { src_reference: 1, ..full_update(handle, 4, 4, Format::R8G8B8A8Unorm) },
            TextureUpdateInfo { src_reference: 2, ..full_update(handle, 4, 4, Format::R8G8B8A8Unorm) },
        ];
        let sources = vec![
            UpdateSource::Memory(vec![0x11; 64]),
            UpdateSource::Memory(vec![0x22; 64]),
            UpdateSource::Memory(vec![0x33; 64]),
        ];
        engine
            .process_texture_updates(&driver, &mut textures, &mut buffers, &updates, sources)
            .unwrap();
        engine.process_resource_transfer_requests(&driver).unwrap();

        let image = textures[handle].image().unwrap();
        assert_eq!(driver.image_bytes(image).unwrap(), vec![0x33; 64]);
    }

    #[test]
    fn test_overlapping_requests_are_fenced_between_submissions() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8A8Unorm, 4, 4, TextureTiling::Optimal);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        let updates = [
            TextureUpdateInfo { src_reference: 0, ..full_update(handle, 4, 4, Format::R8G8B8A8Unorm) },
            TextureUpdateInfo { src_reference: 1, ..full_update(handle, 4, 4, Format::R8G8B8A8Unorm) },
        ];
        let sources = vec![
            UpdateSource::Memory(vec![0xaa; 64]),
            UpdateSource::Memory(vec![0xbb; 64]),
        ];
        engine
            .process_texture_updates(&driver, &mut textures, &mut buffers, &updates, sources)
            .unwrap();
        engine.process_resource_transfer_requests(&driver).unwrap();

        let submitted = submissions(&driver);
        assert_eq!(submitted.len(), 2, "overlapping copies need two batches");
        assert!(submitted.iter().all(|(_, fence)| *fence));

        // A fence wait separates the two submissions.
        let timeline = driver.timeline();
        let first_submit = timeline
            .iter()
            .position(|e| matches!(e, TimelineEvent::Submission { .. }))
            .unwrap();
        let second_submit = timeline
            .iter()
            .skip(first_submit + 1)
            .position(|e| matches!(e, TimelineEvent::Submission { .. }))
            .unwrap()
            + first_submit
            + 1;
        assert!(timeline[first_submit..second_submit]
            .iter()
            .any(|e| matches!(e, TimelineEvent::FenceWait)));
    }

    #[test]
    fn test_disjoint_updates_share_one_submission() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8A8Unorm, 4, 4, TextureTiling::Optimal);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        let mut left = full_update(handle, 2, 4, Format::R8G8B8A8Unorm);
        left.src_reference = 0;
        let mut right = full_update(handle, 2, 4, Format::R8G8B8A8Unorm);
        right.src_reference = 1;
        right.dst_offset = Offset2D { x: 2, y: 0 };

        let sources = vec![
            UpdateSource::Memory(vec![0xaa; 32]),
            UpdateSource::Memory(vec![0xbb; 32]),
        ];
        engine
            .process_texture_updates(&driver, &mut textures, &mut buffers, &[left, right], sources)
            .unwrap();
        engine.process_resource_transfer_requests(&driver).unwrap();
        assert_eq!(submissions(&driver).len(), 1);
    }

    #[test]
    fn test_pixel_data_released_exactly_once_after_upload() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8A8Unorm, 2, 2, TextureTiling::Optimal);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        let released = PixelData::new(vec![7u8; 16], 2, 2, Format::R8G8B8A8Unorm, 0);
        let retained = PixelData::new(vec![9u8; 16], 2, 2, Format::R8G8B8A8Unorm, 0);
        let mut first = full_update(handle, 2, 2, Format::R8G8B8A8Unorm);
        first.src_reference = 0;
        let mut second = full_update(handle, 2, 2, Format::R8G8B8A8Unorm);
        second.src_reference = 1;

        engine
            .process_texture_updates(
                &driver,
                &mut textures,
                &mut buffers,
                &[first, second],
                vec![
                    UpdateSource::PixelData {
                        data: Arc::clone(&released),
                        release_after_upload: true,
                    },
                    UpdateSource::PixelData {
                        data: Arc::clone(&retained),
                        release_after_upload: false,
                    },
                ],
            )
            .unwrap();

        assert!(released.is_released());
        assert!(!retained.is_released());
        // A second release attempt reports it had nothing left to do.
        assert!(!released.release_storage());
    }

    #[test]
    fn test_direct_write_bypasses_staging_and_requests() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let (mut textures, handle) = texture_map(Format::R8G8B8A8Unorm, 2, 2, TextureTiling::Linear);
        let mut buffers: SlotMap<BufferHandle, BufferResource> = SlotMap::with_key();

        let payload: Vec<u8> = (100u8..116).collect();
        engine
            .process_texture_updates(
                &driver,
                &mut textures,
                &mut buffers,
                &[full_update(handle, 2, 2, Format::R8G8B8A8Unorm)],
                vec![UpdateSource::Memory(payload.clone())],
            )
            .unwrap();

        let image = textures[handle].image().unwrap();
        assert_eq!(driver.image_bytes(image).unwrap(), payload);
        assert!(engine.staging.id().is_none(), "direct writes never stage");
        // The only pending request prepares the image layout.
        assert_eq!(engine.pending_request_count(), 1);
        engine.process_resource_transfer_requests(&driver).unwrap();
        let submitted = submissions(&driver);
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].0.iter().all(|op| !matches!(
            op,
            RecordedOp::CopyBufferToImage { .. }
        )));
    }

    #[test]
    fn test_mipmap_pass_blits_down_the_chain() {
        let driver = RecordingDriver::new();
        let mut engine = engine();
        let image = driver.make_image(Extent2D { width: 8, height: 8 }, Format::R8G8B8A8Unorm);

        engine.schedule_texture_mipmaps(MipmapRequest {
            image,
            extent: Extent2D { width: 8, height: 8 },
            mip_levels: 4,
            base_layout: TextureLayout::ShaderReadOnly,
        });
        engine.process_mipmap_requests(&driver).unwrap();

        let submitted = submissions(&driver);
        assert_eq!(submitted.len(), 1);
        let blits: Vec<_> = submitted[0]
            .0
            .iter()
            .filter_map(|op| match op {
                RecordedOp::Blit { src_mip, dst_mip, dst_extent, .. } => {
                    Some((*src_mip, *dst_mip, *dst_extent))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            blits,
            vec![
                (0, 1, Extent2D { width: 4, height: 4 }),
                (1, 2, Extent2D { width: 2, height: 2 }),
                (2, 3, Extent2D { width: 1, height: 1 }),
            ]
        );
    }

    #[test]
    fn test_mip_extent_floors_at_one() {
        let base = Extent2D { width: 8, height: 2 };
        assert_eq!(mip_extent(base, 0), base);
        assert_eq!(mip_extent(base, 2), Extent2D { width: 2, height: 1 });
        assert_eq!(mip_extent(base, 3), Extent2D { width: 1, height: 1 });
    }
}
