//! Software pixel conversion for emulated formats.
//!
//! Uploads whose source format differs from the destination's stored
//! format pass through here on the worker threads, row by row, honoring
//! source stride and destination row pitch.

use std::sync::Arc;

use crate::api::info::PixelData;
use crate::api::types::Format;
use crate::error::{BackendError, BackendResult};

/// Row geometry of one conversion-or-copy region.
#[derive(Debug, Clone, Copy)]
pub struct RegionLayout {
    /// Region width in pixels.
    pub width: u32,
    /// Region height in pixels.
    pub height: u32,
    /// Format of the source bytes.
    pub src_format: Format,
    /// Format written to the destination.
    pub dst_format: Format,
    /// Source row stride in bytes; 0 means tightly packed.
    pub src_stride: u32,
    /// Destination row pitch in bytes; 0 means tightly packed.
    pub dst_pitch: u32,
}

impl RegionLayout {
    fn src_row_bytes(&self) -> usize {
        self.width as usize * self.src_format.bytes_per_pixel() as usize
    }

    fn dst_row_bytes(&self) -> usize {
        self.width as usize * self.dst_format.bytes_per_pixel() as usize
    }

    fn src_pitch_bytes(&self) -> usize {
        if self.src_stride == 0 {
            self.src_row_bytes()
        } else {
            self.src_stride as usize
        }
    }

    fn dst_pitch_bytes(&self) -> usize {
        if self.dst_pitch == 0 {
            self.dst_row_bytes()
        } else {
            self.dst_pitch as usize
        }
    }
}

/// Packed byte size of a region once stored as `format`.
pub fn packed_byte_size(width: u32, height: u32, format: Format) -> u64 {
    u64::from(width) * u64::from(height) * u64::from(format.bytes_per_pixel())
}

/// Copies or converts a region row by row.
pub fn encode_region(src: &[u8], dst: &mut [u8], layout: &RegionLayout) -> BackendResult<()> {
    let src_pitch = layout.src_pitch_bytes();
    let dst_pitch = layout.dst_pitch_bytes();
    let src_row = layout.src_row_bytes();
    let dst_row = layout.dst_row_bytes();
    let height = layout.height as usize;

    let src_needed = src_pitch
        .checked_mul(height.saturating_sub(1))
        .and_then(|v| v.checked_add(src_row));
    match src_needed {
        Some(needed) if needed <= src.len() => {}
        _ => {
            return Err(BackendError::invalid(format!(
                "upload source too small: need rows of {src_row} bytes, have {} bytes total",
                src.len()
            )))
        }
    }
    let dst_needed = dst_pitch * height.saturating_sub(1) + dst_row;
    if dst_needed > dst.len() {
        return Err(BackendError::invalid(
            "upload destination range smaller than the encoded region",
        ));
    }

    for y in 0..height {
        let src_line = &src[y * src_pitch..y * src_pitch + src_row];
        let dst_line = &mut dst[y * dst_pitch..y * dst_pitch + dst_row];
        if layout.src_format == layout.dst_format {
            dst_line.copy_from_slice(src_line);
        } else {
            convert_row(src_line, dst_line, layout.src_format, layout.dst_format)?;
        }
    }
    Ok(())
}

/// Converts one packed row of pixels between formats.
pub fn convert_row(src: &[u8], dst: &mut [u8], from: Format, to: Format) -> BackendResult<()> {
    match (from, to) {
        (Format::R8G8B8Unorm, Format::R8G8B8A8Unorm) => {
            for (rgb, rgba) in src.chunks_exact(3).zip(dst.chunks_exact_mut(4)) {
                rgba[..3].copy_from_slice(rgb);
                rgba[3] = 0xff;
            }
            Ok(())
        }
        (Format::R8G8B8A8Unorm, Format::R8G8B8Unorm) => {
            for (rgba, rgb) in src.chunks_exact(4).zip(dst.chunks_exact_mut(3)) {
                rgb.copy_from_slice(&rgba[..3]);
            }
            Ok(())
        }
        (Format::R5G6B5UnormPack16, Format::R8G8B8A8Unorm) => {
            for (packed, rgba) in src.chunks_exact(2).zip(dst.chunks_exact_mut(4)) {
                let value: u16 = bytemuck::pod_read_unaligned(packed);
                let r = ((value >> 11) & 0x1f) as u8;
                let g = ((value >> 5) & 0x3f) as u8;
                let b = (value & 0x1f) as u8;
                rgba[0] = (r << 3) | (r >> 2);
                rgba[1] = (g << 2) | (g >> 4);
                rgba[2] = (b << 3) | (b >> 2);
                rgba[3] = 0xff;
            }
            Ok(())
        }
        (from, to) => Err(BackendError::Unsupported(format!(
            "no software conversion from {from:?} to {to:?}"
        ))),
    }
}

/// Converts shared pixel storage to `target`, returning new storage.
///
/// `None` when the storage was already released or the format pair has no
/// conversion.
pub fn try_convert_pixel_data(data: &PixelData, target: Format) -> Option<Arc<PixelData>> {
    if data.format == target {
        return None;
    }
    let layout = RegionLayout {
        width: data.width,
        height: data.height,
        src_format: data.format,
        dst_format: target,
        src_stride: data.stride,
        dst_pitch: 0,
    };
    let converted = data.with_bytes(|bytes| {
        let mut out = vec![0u8; packed_byte_size(data.width, data.height, target) as usize];
        encode_region(bytes, &mut out, &layout).ok().map(|_| out)
    })??;
    Some(PixelData::new(
        converted,
        data.width,
        data.height,
        target,
        0,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_widens_with_opaque_alpha() {
        let src = [10u8, 20, 30, 40, 50, 60];
        let mut dst = [0u8; 8];
        convert_row(&src, &mut dst, Format::R8G8B8Unorm, Format::R8G8B8A8Unorm).unwrap();
        assert_eq!(dst, [10, 20, 30, 0xff, 40, 50, 60, 0xff]);
    }

    #[test]
    fn test_rgba_narrows_dropping_alpha() {
        let src = [10u8, 20, 30, 200, 40, 50, 60, 100];
        let mut dst = [0u8; 6];
        convert_row(&src, &mut dst, Format::R8G8B8A8Unorm, Format::R8G8B8Unorm).unwrap();
        assert_eq!(dst, [10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn test_rgb565_expands_full_range() {
        let white = 0xffffu16.to_le_bytes();
        let mut dst = [0u8; 4];
        convert_row(&white, &mut dst, Format::R5G6B5UnormPack16, Format::R8G8B8A8Unorm).unwrap();
        assert_eq!(dst, [0xff, 0xff, 0xff, 0xff]);

        let black = 0u16.to_le_bytes();
        convert_row(&black, &mut dst, Format::R5G6B5UnormPack16, Format::R8G8B8A8Unorm).unwrap();
        assert_eq!(dst, [0, 0, 0, 0xff]);
    }

    #[test]
    fn test_encode_region_honors_source_stride() {
        // Two rows of 2 RGBA pixels with 4 bytes of row padding.
        let mut src = Vec::new();
        src.extend_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2]);
        src.extend_from_slice(&[0xaa; 4]);
        src.extend_from_slice(&[3, 3, 3, 3, 4, 4, 4, 4]);

        let layout = RegionLayout {
            width: 2,
            height: 2,
            src_format: Format::R8G8B8A8Unorm,
            dst_format: Format::R8G8B8A8Unorm,
            src_stride: 12,
            dst_pitch: 0,
        };
        let mut dst = [0u8; 16];
        encode_region(&src, &mut dst, &layout).unwrap();
        assert_eq!(
            dst,
            [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]
        );
    }

    #[test]
    fn test_encode_region_rejects_short_source() {
        let src = [0u8; 7];
        let mut dst = [0u8; 16];
        let layout = RegionLayout {
            width: 2,
            height: 2,
            src_format: Format::R8G8B8A8Unorm,
            dst_format: Format::R8G8B8A8Unorm,
            src_stride: 0,
            dst_pitch: 0,
        };
        assert!(encode_region(&src, &mut dst, &layout).is_err());
    }

    #[test]
    fn test_pixel_data_conversion_allocates_new_storage() {
        let data = PixelData::new(vec![5, 6, 7, 8, 9, 10], 2, 1, Format::R8G8B8Unorm, 0);
        let converted = try_convert_pixel_data(&data, Format::R8G8B8A8Unorm).unwrap();
        assert_eq!(converted.format, Format::R8G8B8A8Unorm);
        converted
            .with_bytes(|bytes| assert_eq!(bytes, [5, 6, 7, 0xff, 8, 9, 10, 0xff]))
            .unwrap();
        assert!(!data.is_released(), "conversion must not consume the source");
    }

    #[test]
    fn test_unknown_pair_is_rejected() {
        let mut dst = [0u8; 4];
        assert!(convert_row(&[0; 2], &mut dst, Format::R8Unorm, Format::D16Unorm).is_err());
    }
}
