//! Shared pipeline cache bookkeeping and on-disk persistence.
//!
//! Every pipeline compile and release in the backend routes through the
//! [`PipelineCacheManager`] so its counters stay authoritative. The device
//! cache blob is persisted between runs with a small header binding it to
//! the device that produced it; a blob from another device, driver version
//! or a corrupted file is a clean miss, never an error.

use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::driver::{DeviceIdentity, GpuDriver, PipelineDesc, PipelineId};
use crate::error::BackendResult;

const BLOB_MAGIC: u32 = 0x7063_6163; // "pcac"

/// Header preceding the serialized device cache on disk.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct BlobHeader {
    magic: u32,
    data_size: u32,
    vendor_id: u32,
    device_id: u32,
    driver_version: u32,
    driver_abi: u32,
    uuid: [u8; 16],
    checksum: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<BlobHeader>();

/// Bitwise CRC-32 (IEEE 802.3 polynomial, reflected).
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &byte in bytes {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

/// Central bookkeeping for compiled pipeline objects.
#[derive(Debug, Default)]
pub struct PipelineCacheManager {
    compiled: u64,
    released: u64,
    hits: u64,
}

impl PipelineCacheManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        PipelineCacheManager::default()
    }

    /// Compiles a pipeline object through the driver.
    pub fn compile(
        &mut self,
        driver: &dyn GpuDriver,
        desc: &PipelineDesc,
    ) -> BackendResult<PipelineId> {
        let pipeline = driver.create_pipeline(desc)?;
        self.compiled += 1;
        Ok(pipeline)
    }

    /// Releases a compiled pipeline object.
    pub fn release(&mut self, driver: &dyn GpuDriver, pipeline: PipelineId) {
        driver.destroy_pipeline(pipeline);
        self.released += 1;
    }

    /// Records a variant-cache hit.
    pub fn note_hit(&mut self) {
        self.hits += 1;
    }

    /// Pipelines compiled so far.
    pub fn compiled_count(&self) -> u64 {
        self.compiled
    }

    /// Pipelines released so far.
    pub fn released_count(&self) -> u64 {
        self.released
    }

    /// Variant-cache hits so far.
    pub fn hit_count(&self) -> u64 {
        self.hits
    }

    /// Compiled pipelines not yet released.
    pub fn live_count(&self) -> u64 {
        self.compiled - self.released
    }

    /// Seeds the device cache from a previously saved blob. Returns whether
    /// the blob was accepted; a missing file, foreign device or corrupt
    /// payload all miss cleanly.
    pub fn load_blob(&self, path: &Path, driver: &dyn GpuDriver) -> BackendResult<bool> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        if bytes.len() < HEADER_SIZE {
            log::debug!("pipeline cache blob truncated, starting fresh");
            return Ok(false);
        }
        let header: BlobHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        let payload = &bytes[HEADER_SIZE..];

        let identity = driver.device_identity();
        let matches = header.magic == BLOB_MAGIC
            && header.data_size as usize == payload.len()
            && header.vendor_id == identity.vendor_id
            && header.device_id == identity.device_id
            && header.driver_version == identity.driver_version
            && header.driver_abi == std::mem::size_of::<usize>() as u32
            && header.uuid == identity.uuid
            && header.checksum == crc32(payload);
        if !matches {
            log::debug!("pipeline cache blob does not match this device, starting fresh");
            return Ok(false);
        }

        driver.seed_pipeline_cache(payload)?;
        log::info!("pipeline cache seeded with {} bytes", payload.len());
        Ok(true)
    }

    /// Serializes the device cache to disk.
    pub fn save_blob(&self, path: &Path, driver: &dyn GpuDriver) -> BackendResult<()> {
        let payload = driver.pipeline_cache_data()?;
        let identity: DeviceIdentity = driver.device_identity();
        let header = BlobHeader {
            magic: BLOB_MAGIC,
            data_size: payload.len() as u32,
            vendor_id: identity.vendor_id,
            device_id: identity.device_id,
            driver_version: identity.driver_version,
            driver_abi: std::mem::size_of::<usize>() as u32,
            uuid: identity.uuid,
            checksum: crc32(&payload),
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(&payload);
        std::fs::write(path, bytes)?;
        log::info!("pipeline cache saved: {} bytes", payload.len());
        Ok(())
    }
}
