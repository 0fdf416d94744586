//! Free-list pool for short-lived device buffers.
//!
//! Every pipeline launch needs transient allocations: the params uniform,
//! filter masks, scan arrays, reduction partials, and readback staging.
//! Allocating them through the driver per launch dominates small-input
//! latency, so they are recycled here instead.
//!
//! Buffers are bucketed by rounded size (next power of two, 4 KiB floor)
//! and usage flags. `acquire` pops a recycled buffer or allocates a fresh
//! one; `release` returns it. Contents are not cleared on release; callers
//! that need zeroed memory must write it. Element arrays owned by
//! [`crate::ArrayHandle`] never pass through the pool, since their
//! lifetime is the handle's, not a launch's.

use std::collections::HashMap;
use std::sync::Mutex;

const MIN_SIZE_CLASS: u64 = 4096;

/// Idle buffers kept per (size class, usage) bucket; excess is dropped and
/// the device memory freed.
const MAX_PER_BUCKET: usize = 8;

#[derive(Hash, PartialEq, Eq, Clone)]
struct BucketKey {
    size_class: u64,
    usage: wgpu::BufferUsages,
}

pub(crate) struct BufferPool {
    free_lists: Mutex<HashMap<BucketKey, Vec<wgpu::Buffer>>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.free_lists.lock().expect("pool lock poisoned");
        let total: usize = lists.values().map(|v| v.len()).sum();
        write!(f, "BufferPool {{ idle_buffers: {total} }}")
    }
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self {
            free_lists: Mutex::new(HashMap::new()),
        }
    }

    fn size_class(needed: u64) -> u64 {
        needed.next_power_of_two().max(MIN_SIZE_CLASS)
    }

    /// Acquire a buffer of at least `needed` bytes with the given usage.
    /// The returned buffer may be larger than requested.
    pub(crate) fn acquire(
        &self,
        device: &wgpu::Device,
        needed: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        let size_class = Self::size_class(needed);
        let key = BucketKey { size_class, usage };
        if let Some(buf) = self
            .free_lists
            .lock()
            .expect("pool lock poisoned")
            .get_mut(&key)
            .and_then(|v| v.pop())
        {
            return buf;
        }

        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpq_pooled"),
            size: size_class,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Return a buffer for reuse. Must not be mapped. Full buckets drop the
    /// buffer instead, freeing the device memory.
    pub(crate) fn release(&self, buf: wgpu::Buffer) {
        let key = BucketKey {
            size_class: Self::size_class(buf.size()),
            usage: buf.usage(),
        };
        let mut lists = self.free_lists.lock().expect("pool lock poisoned");
        let bucket = lists.entry(key).or_default();
        if bucket.len() < MAX_PER_BUCKET {
            bucket.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
