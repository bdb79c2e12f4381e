//! Contracts between the backend and the owners of window and native
//! surfaces.

use crate::api::types::{Extent2D, Format};

/// Opaque token naming one buffer owned by a native image producer.
///
/// The producer mints these; the backend never interprets them beyond
/// handing them back on release.
pub type NativeBufferId = u64;

/// Reference counting over externally owned buffers.
///
/// Implemented by native image producers. A held reference delays buffer
/// recycling until the consumer is done reading; it never transfers
/// ownership.
pub trait SurfaceReferenceManager: Send + Sync {
    /// A consumer started reading `buffer`.
    fn acquire_surface_reference(&self, buffer: NativeBufferId);

    /// A consumer finished reading `buffer`.
    fn release_surface_reference(&self, buffer: NativeBufferId);
}

/// A window surface the backend presents into.
///
/// Implemented by the windowing integration. The backend resolves
/// framebuffers against the surface and drives the swap at present time;
/// it never sees windowing specifics beyond this trait.
pub trait RenderSurface: Send + Sync {
    /// Current drawable extent.
    fn extent(&self) -> Extent2D;

    /// Pixel format of the surface's color buffers.
    fn color_format(&self) -> Format;

    /// Makes the surface's graphics context current on the calling thread.
    fn make_context_current(&self);

    /// Finishes the frame and swaps the presented buffer.
    fn post_render(&self);

    /// Frames since the buffer about to be drawn was last presented. Zero
    /// means its contents are undefined and must be fully repainted.
    fn buffer_age(&self) -> u32;
}

/// Idempotence guard around a producer's acquire/release pair.
///
/// At most one reference is held at a time; a second acquire or a release
/// without a matching acquire never reaches the producer. The buffer token
/// is captured at acquire time so the release always names the buffer that
/// was pinned, even after the producer advances to a newer one.
#[derive(Debug, Default)]
pub struct SurfaceReferenceGuard {
    held: Option<NativeBufferId>,
    #[cfg(debug_assertions)]
    acquires: u64,
    #[cfg(debug_assertions)]
    releases: u64,
}

impl SurfaceReferenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reference is currently held.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Takes a reference on `buffer` unless one is already held. Returns
    /// whether a reference was newly acquired.
    pub fn acquire<M>(&mut self, manager: &M, buffer: NativeBufferId) -> bool
    where
        M: SurfaceReferenceManager + ?Sized,
    {
        if self.held.is_some() {
            return false;
        }
        manager.acquire_surface_reference(buffer);
        self.held = Some(buffer);
        #[cfg(debug_assertions)]
        {
            self.acquires += 1;
        }
        true
    }

    /// Drops the held reference. Returns false when none is held.
    pub fn release<M>(&mut self, manager: &M) -> bool
    where
        M: SurfaceReferenceManager + ?Sized,
    {
        let Some(buffer) = self.held.take() else {
            return false;
        };
        manager.release_surface_reference(buffer);
        #[cfg(debug_assertions)]
        {
            self.releases += 1;
        }
        true
    }

    /// Debug check that every acquire was matched by a release.
    pub fn assert_balanced(&self) {
        debug_assert!(
            !self.is_held(),
            "surface reference still held at teardown"
        );
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.acquires, self.releases,
            "surface reference balance did not converge to zero"
        );
    }
}
