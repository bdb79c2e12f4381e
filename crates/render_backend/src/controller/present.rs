//! Pooling for presentation command buffers.

use slotmap::SlotMap;

use crate::api::handles::CommandBufferHandle;
use crate::api::info::CommandBufferLevel;
use crate::command::CommandBuffer;

/// Pool of single-command presentation buffers.
///
/// Presenting records the same one-command buffer shape every frame, so
/// the pool hands back a previously used buffer instead of growing the
/// slotmap. Pooled buffers live until the controller shuts down.
#[derive(Debug, Default)]
pub(super) struct PresentBufferPool {
    free: Vec<CommandBufferHandle>,
    total: usize,
}

impl PresentBufferPool {
    pub(super) fn new() -> Self {
        PresentBufferPool::default()
    }

    /// Takes a presentation buffer, creating one only when none is free.
    pub(super) fn acquire(
        &mut self,
        command_buffers: &mut SlotMap<CommandBufferHandle, CommandBuffer>,
    ) -> CommandBufferHandle {
        while let Some(handle) = self.free.pop() {
            if command_buffers.contains_key(handle) {
                return handle;
            }
            // A pooled handle only goes stale when the whole map was torn
            // down underneath the pool; drop the orphan and keep looking.
            self.total -= 1;
        }
        let handle =
            command_buffers.insert(CommandBuffer::new(CommandBufferLevel::Primary, Some(1)));
        self.total += 1;
        log::trace!("presentation buffer pool grew to {}", self.total);
        handle
    }

    /// Returns a buffer to the pool for the next present.
    pub(super) fn release(&mut self, handle: CommandBufferHandle) {
        self.free.push(handle);
    }

    /// Buffers created over the pool's lifetime.
    pub(super) fn total(&self) -> usize {
        self.total
    }

    /// Buffers currently idle in the pool.
    #[cfg(test)]
    pub(super) fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_makes_the_same_buffer_reusable() {
        let mut pool = PresentBufferPool::new();
        let mut buffers = SlotMap::with_key();

        let first = pool.acquire(&mut buffers);
        pool.release(first);
        let second = pool.acquire(&mut buffers);

        assert_eq!(first, second);
        assert_eq!(pool.total(), 1);
        assert_eq!(buffers.len(), 1);
    }

    #[test]
    fn test_outstanding_buffers_force_growth() {
        let mut pool = PresentBufferPool::new();
        let mut buffers = SlotMap::with_key();

        let first = pool.acquire(&mut buffers);
        let second = pool.acquire(&mut buffers);

        assert_ne!(first, second);
        assert_eq!(pool.total(), 2);
        assert_eq!(pool.idle(), 0);
        assert!(buffers[first].is_presentation_buffer());
        assert!(buffers[second].is_presentation_buffer());
    }
}
