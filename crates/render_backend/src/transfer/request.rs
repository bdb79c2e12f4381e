//! Transfer request kinds and overlap-based batch partitioning.
//!
//! Copy commands inside one submission carry no ordering guarantee against
//! each other, so two copies touching the same destination region must be
//! separated by a fence. The partitioner assigns each request the smallest
//! batch index that keeps every batch free of intra-image destination
//! overlap while never reordering overlapping requests.

use crate::api::types::{Rect2D, TextureLayout};
use crate::driver::{BufferCopy, BufferId, BufferImageCopy, ImageBlit, ImageId};

/// One pending GPU-side transfer.
#[derive(Debug, Clone)]
pub enum TransferRequest {
    /// Copy a buffer region into an image subresource.
    CopyBufferToImage {
        /// Source buffer.
        src: BufferId,
        /// Destination image.
        dst: ImageId,
        /// Layout of `dst` before the transfer drain.
        dst_layout: TextureLayout,
        /// Copy geometry.
        copy: BufferImageCopy,
    },
    /// Copy between buffer regions.
    CopyBufferToBuffer {
        /// Source buffer.
        src: BufferId,
        /// Destination buffer.
        dst: BufferId,
        /// Copy geometry.
        copy: BufferCopy,
    },
    /// Blit between images (used by readbacks and level copies).
    CopyImageToImage {
        /// Source image.
        src: ImageId,
        /// Destination image.
        dst: ImageId,
        /// Layout of `dst` before the transfer drain.
        dst_layout: TextureLayout,
        /// Blit geometry.
        blit: ImageBlit,
    },
    /// Layout preparation with no copy, used when an externally-written
    /// image only needs to become shader-readable.
    PrepareImage {
        /// The image to transition.
        image: ImageId,
        /// Layout before the drain.
        old_layout: TextureLayout,
    },
}

impl TransferRequest {
    /// Destination image and region, for overlap partitioning. Requests
    /// without an image destination always share batch zero.
    pub fn destination_region(&self) -> Option<(ImageId, u32, u32, Rect2D)> {
        match self {
            TransferRequest::CopyBufferToImage { dst, copy, .. } => Some((
                *dst,
                copy.mip_level,
                copy.base_layer,
                Rect2D {
                    offset: copy.image_offset,
                    extent: copy.image_extent,
                },
            )),
            TransferRequest::CopyImageToImage { dst, blit, .. } => {
                Some((*dst, blit.dst_mip, blit.layer, blit.dst_region))
            }
            TransferRequest::CopyBufferToBuffer { .. } | TransferRequest::PrepareImage { .. } => {
                None
            }
        }
    }

    /// The image needing layout preparation before the first batch, with
    /// its pre-drain layout.
    pub fn prepared_image(&self) -> Option<(ImageId, TextureLayout)> {
        match self {
            TransferRequest::CopyBufferToImage {
                dst, dst_layout, ..
            }
            | TransferRequest::CopyImageToImage {
                dst, dst_layout, ..
            } => Some((*dst, *dst_layout)),
            TransferRequest::PrepareImage { image, old_layout } => Some((*image, *old_layout)),
            TransferRequest::CopyBufferToBuffer { .. } => None,
        }
    }
}

/// Assigns every request a batch index.
///
/// A request lands one batch after the latest earlier request whose
/// destination region intersects its own on the same image subresource;
/// all other requests keep the lowest index available. Returned batches
/// preserve request order internally.
pub fn partition_into_batches(requests: &[TransferRequest]) -> Vec<Vec<usize>> {
    let mut batch_of = vec![0usize; requests.len()];
    let mut batch_count = 0usize;

    for (index, request) in requests.iter().enumerate() {
        let mut batch = 0usize;
        if let Some((image, mip, layer, region)) = request.destination_region() {
            for earlier in 0..index {
                if let Some((other_image, other_mip, other_layer, other_region)) =
                    requests[earlier].destination_region()
                {
                    if image == other_image
                        && mip == other_mip
                        && layer == other_layer
                        && region.intersects(&other_region)
                    {
                        batch = batch.max(batch_of[earlier] + 1);
                    }
                }
            }
        }
        batch_of[index] = batch;
        batch_count = batch_count.max(batch + 1);
    }

    let mut batches = vec![Vec::new(); batch_count];
    for (index, batch) in batch_of.iter().enumerate() {
        batches[*batch].push(index);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{Extent2D, Offset2D};
    use slotmap::KeyData;

    fn image(raw: u64) -> ImageId {
        ImageId::from(KeyData::from_ffi(raw))
    }

    fn copy_to(dst: ImageId, x: i32, y: i32, w: u32, h: u32) -> TransferRequest {
        TransferRequest::CopyBufferToImage {
            src: BufferId::default(),
            dst,
            dst_layout: TextureLayout::Undefined,
            copy: BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                image_offset: Offset2D { x, y },
                image_extent: Extent2D {
                    width: w,
                    height: h,
                },
                mip_level: 0,
                base_layer: 0,
                layer_count: 1,
            },
        }
    }

    fn assert_no_intra_batch_overlap(requests: &[TransferRequest], batches: &[Vec<usize>]) {
        for batch in batches {
            for (i, &a) in batch.iter().enumerate() {
                for &b in &batch[i + 1..] {
                    let ra = requests[a].destination_region();
                    let rb = requests[b].destination_region();
                    if let (Some((ia, ma, la, rect_a)), Some((ib, mb, lb, rect_b))) = (ra, rb) {
                        assert!(
                            ia != ib || ma != mb || la != lb || !rect_a.intersects(&rect_b),
                            "requests {a} and {b} overlap within one batch"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_disjoint_regions_share_one_batch() {
        let img = image(1);
        let requests = vec![
            copy_to(img, 0, 0, 16, 16),
            copy_to(img, 16, 0, 16, 16),
            copy_to(img, 0, 16, 16, 16),
        ];
        let batches = partition_into_batches(&requests);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![0, 1, 2]);
    }

    #[test]
    fn test_overlapping_regions_split_in_request_order() {
        let img = image(1);
        let requests = vec![
            copy_to(img, 0, 0, 16, 16),
            copy_to(img, 8, 8, 16, 16),
            copy_to(img, 12, 12, 16, 16),
        ];
        let batches = partition_into_batches(&requests);
        assert_eq!(batches.len(), 3, "each overlaps its predecessor");
        assert_eq!(batches[0], vec![0]);
        assert_eq!(batches[1], vec![1]);
        assert_eq!(batches[2], vec![2]);
        assert_no_intra_batch_overlap(&requests, &batches);
    }

    #[test]
    fn test_overlap_ordering_survives_interleaved_images() {
        let a = image(1);
        let b = image(2);
        let requests = vec![
            copy_to(a, 0, 0, 32, 32),
            copy_to(b, 0, 0, 8, 8),
            copy_to(a, 4, 4, 8, 8),
            copy_to(b, 100, 100, 8, 8),
        ];
        let batches = partition_into_batches(&requests);
        assert_eq!(batches.len(), 2);
        // Image b never overlaps itself, so both its copies stay in batch 0.
        assert_eq!(batches[0], vec![0, 1, 3]);
        assert_eq!(batches[1], vec![2]);
        assert_no_intra_batch_overlap(&requests, &batches);
    }

    #[test]
    fn test_distinct_mip_levels_never_conflict() {
        let img = image(1);
        let mut level_one = copy_to(img, 0, 0, 16, 16);
        if let TransferRequest::CopyBufferToImage { copy, .. } = &mut level_one {
            copy.mip_level = 1;
        }
        let requests = vec![copy_to(img, 0, 0, 16, 16), level_one];
        let batches = partition_into_batches(&requests);
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn test_identical_regions_chain_batches() {
        let img = image(1);
        let requests: Vec<_> = (0..4).map(|_| copy_to(img, 0, 0, 64, 64)).collect();
        let batches = partition_into_batches(&requests);
        assert_eq!(batches.len(), 4);
        for (index, batch) in batches.iter().enumerate() {
            assert_eq!(batch, &vec![index]);
        }
    }

    #[test]
    fn test_touching_edges_do_not_overlap() {
        let img = image(1);
        let requests = vec![copy_to(img, 0, 0, 16, 16), copy_to(img, 16, 0, 16, 16)];
        let batches = partition_into_batches(&requests);
        assert_eq!(batches.len(), 1);
    }
}
