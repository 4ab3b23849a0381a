use std::sync::{Arc, Mutex, PoisonError};

/// Size of one copy slab. Matches the transfer granularity of the splice
/// loops; large enough to keep syscall counts low for bulk frames.
pub(crate) const SLAB_SIZE: usize = 32 * 1024;

/// Free-list of fixed-size copy buffers, recycled across requests so the
/// splice loops do not allocate per transfer.
#[derive(Clone, Default)]
pub(crate) struct BufferPool {
    slabs: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self) -> Vec<u8> {
        let slab = self
            .slabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        slab.unwrap_or_else(|| vec![0; SLAB_SIZE])
    }

    pub(crate) fn release(&self, slab: Vec<u8>) {
        debug_assert_eq!(slab.len(), SLAB_SIZE);
        self.slabs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slab);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_hands_out_full_slabs() {
        let pool = BufferPool::new();
        let slab = pool.acquire();
        assert_eq!(slab.len(), SLAB_SIZE);
    }

    #[test]
    fn released_slabs_are_recycled() {
        let pool = BufferPool::new();
        let mut slab = pool.acquire();
        slab[0] = 42;
        pool.release(slab);

        let reused = pool.acquire();
        assert_eq!(reused[0], 42);
        assert!(pool.slabs.lock().unwrap().is_empty());
    }
}
