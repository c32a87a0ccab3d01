//! Chunk pool for DMA-safe transfer buffers.
//!
//! Transfer buffers are small and allocated constantly; mapping one page per
//! request would dominate the cost of an URB. The pool maps page-size buffers
//! through a [`DmaMapper`] and serves variable-size chunks out of them at a
//! 32-byte granularity, first-fit, coalescing free neighbors on release.
//! Requests too large for a single buffer bypass the pool and get a dedicated
//! mapping that is unmapped on release.

use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};

use crate::dma::{DmaError, DmaMapper, DmaRegion, MemoryType, PAGE_SIZE};

/// Minimum chunk size; every request is rounded up to a multiple of this.
pub const CHUNK_GRANULARITY: usize = 32;

/// Leading granule of every buffer, reserved for the buffer header. No chunk
/// is ever handed out at offset 0, so a chunk address masked down to its page
/// base always identifies the owning buffer.
const BUFFER_HEADER: usize = CHUNK_GRANULARITY;

/// Largest request the pool serves from a shared buffer. Anything bigger is
/// given its own mapping.
pub const MAX_POOL_ALLOC: usize = PAGE_SIZE - BUFFER_HEADER;

#[derive(Clone, Copy, Debug)]
struct FreeChunk {
    offset: usize,
    size: usize,
}

struct PoolBuffer {
    region: DmaRegion,
    /// Free chunks, sorted by offset. Adjacent entries are never contiguous;
    /// release() merges them eagerly.
    free: Vec<FreeChunk>,
    free_bytes: usize,
}

impl PoolBuffer {
    fn new(region: DmaRegion) -> Self {
        Self {
            region,
            free: vec![FreeChunk {
                offset: BUFFER_HEADER,
                size: PAGE_SIZE - BUFFER_HEADER,
            }],
            free_bytes: PAGE_SIZE - BUFFER_HEADER,
        }
    }

    /// First-fit search. Returns the offset of the carved chunk.
    fn take(&mut self, size: usize) -> Option<usize> {
        let idx = self.free.iter().position(|chunk| chunk.size >= size)?;
        let chunk = &mut self.free[idx];
        let offset = chunk.offset;
        if chunk.size > size {
            chunk.offset += size;
            chunk.size -= size;
        } else {
            self.free.remove(idx);
        }
        self.free_bytes -= size;
        Some(offset)
    }

    fn put(&mut self, offset: usize, size: usize) {
        let idx = self
            .free
            .iter()
            .position(|chunk| chunk.offset > offset)
            .unwrap_or(self.free.len());

        // Merge with the right neighbor first so the left merge sees the
        // final extent.
        let mut size = size;
        if idx < self.free.len() && offset + size == self.free[idx].offset {
            size += self.free[idx].size;
            self.free.remove(idx);
        }
        if idx > 0 && self.free[idx - 1].offset + self.free[idx - 1].size == offset {
            self.free[idx - 1].size += size;
        } else {
            self.free.insert(idx, FreeChunk { offset, size });
        }
        self.free_bytes += size;
    }
}

struct PoolInner {
    buffers: Vec<PoolBuffer>,
    /// Oversized allocations, each a dedicated mapping.
    direct: Vec<DmaRegion>,
}

struct PoolShared {
    mapper: Arc<dyn DmaMapper>,
    inner: Mutex<PoolInner>,
}

/// The shared chunk pool. Cheap to clone; all clones serve the same backing
/// buffers. One lock serializes the bookkeeping; it is never held across a
/// hardware wait, and is deliberately separate from the lock guarding the
/// stack's structural state.
#[derive(Clone)]
pub struct DmaPool {
    shared: Arc<PoolShared>,
}

impl DmaPool {
    pub fn new(mapper: Arc<dyn DmaMapper>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                mapper,
                inner: Mutex::new(PoolInner {
                    buffers: Vec::new(),
                    direct: Vec::new(),
                }),
            }),
        }
    }

    fn round(size: usize) -> usize {
        size.max(1).div_ceil(CHUNK_GRANULARITY) * CHUNK_GRANULARITY
    }

    /// Allocate a zero-filled chunk of at least `size` bytes.
    ///
    /// Exhaustion of the underlying mapper is a hard failure the caller must
    /// unwind from; nothing is retried here.
    pub fn alloc(&self, size: usize) -> Result<DmaChunk, DmaError> {
        let rounded = Self::round(size);
        let shared = &self.shared;

        if rounded > MAX_POOL_ALLOC {
            let mapped = rounded.div_ceil(PAGE_SIZE) * PAGE_SIZE;
            let region = shared.mapper.map(mapped, MemoryType::Uncacheable)?;
            let (virt, phys) = (region.virt(), region.physical());
            shared.inner.lock().unwrap().direct.push(region);
            unsafe { ptr::write_bytes(virt.as_ptr(), 0, rounded) };
            return Ok(DmaChunk {
                ptr: virt,
                phys,
                len: size,
                pool: Arc::clone(shared),
            });
        }

        let mut inner = shared.inner.lock().unwrap();
        let (region_virt, region_phys, offset) = loop {
            if let Some(found) = inner.buffers.iter_mut().find_map(|buffer| {
                let offset = buffer.take(rounded)?;
                Some((buffer.region.virt(), buffer.region.physical(), offset))
            }) {
                break found;
            }
            // No buffer can hold the request; chain a fresh one and retry.
            let region = shared.mapper.map(PAGE_SIZE, MemoryType::Uncacheable)?;
            inner.buffers.push(PoolBuffer::new(region));
        };
        drop(inner);

        let ptr = unsafe { NonNull::new_unchecked(region_virt.as_ptr().add(offset)) };
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, rounded) };
        Ok(DmaChunk {
            ptr,
            phys: region_phys + offset,
            len: size,
            pool: Arc::clone(shared),
        })
    }

    /// Number of backing buffers currently mapped.
    pub fn buffer_count(&self) -> usize {
        self.shared.inner.lock().unwrap().buffers.len()
    }

    /// Total free bytes across all pooled buffers.
    pub fn free_bytes(&self) -> usize {
        self.shared
            .inner
            .lock()
            .unwrap()
            .buffers
            .iter()
            .map(|buffer| buffer.free_bytes)
            .sum()
    }
}

impl PoolShared {
    fn release(&self, ptr: NonNull<u8>, len: usize) {
        let rounded = DmaPool::round(len);
        let mut inner = self.inner.lock().unwrap();

        if rounded > MAX_POOL_ALLOC {
            let idx = inner
                .direct
                .iter()
                .position(|region| region.virt() == ptr)
                .expect("freeing an unknown oversized DMA chunk");
            let region = inner.direct.swap_remove(idx);
            drop(inner);
            unsafe { self.mapper.unmap(region) };
            return;
        }

        let buffer = inner
            .buffers
            .iter_mut()
            .find(|buffer| buffer.region.contains(ptr))
            .expect("freeing a DMA chunk into a pool that does not own it");
        let offset = ptr.as_ptr() as usize - buffer.region.virt().as_ptr() as usize;
        buffer.put(offset, rounded);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for buffer in inner.buffers.drain(..) {
            unsafe { self.mapper.unmap(buffer.region) };
        }
        for region in inner.direct.drain(..) {
            unsafe { self.mapper.unmap(region) };
        }
    }
}

/// One allocation out of a [`DmaPool`]. Dropping it returns the bytes to the
/// pool (or unmaps them, for oversized chunks).
pub struct DmaChunk {
    ptr: NonNull<u8>,
    phys: usize,
    len: usize,
    pool: Arc<PoolShared>,
}

impl DmaChunk {
    /// Address the device uses to reach this chunk.
    pub fn physical(&self) -> usize {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl std::ops::Deref for DmaChunk {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for DmaChunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

unsafe impl Send for DmaChunk {}
unsafe impl Sync for DmaChunk {}

impl Drop for DmaChunk {
    fn drop(&mut self) {
        self.pool.release(self.ptr, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HeapMapper;

    fn pool() -> DmaPool {
        DmaPool::new(Arc::new(HeapMapper))
    }

    #[test]
    fn first_alloc_creates_one_buffer() {
        let pool = pool();
        assert_eq!(pool.buffer_count(), 0);

        let chunk = pool.alloc(40).unwrap();
        assert_eq!(chunk.len(), 40);
        assert_eq!(pool.buffer_count(), 1);
        // 40 rounds up to 64; the leading granule is the header.
        assert_eq!(pool.free_bytes(), PAGE_SIZE - BUFFER_HEADER - 64);

        drop(chunk);
        assert_eq!(pool.free_bytes(), PAGE_SIZE - BUFFER_HEADER);
    }

    #[test]
    fn round_trip_reuses_coalesced_space() {
        let pool = pool();
        let first = pool.alloc(100).unwrap();
        let addr = first.as_ptr() as usize;
        drop(first);

        let second = pool.alloc(100).unwrap();
        assert_eq!(second.as_ptr() as usize, addr);
        assert_eq!(pool.buffer_count(), 1);
    }

    #[test]
    fn freeing_out_of_order_coalesces_fully() {
        let pool = pool();
        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(64).unwrap();
        let c = pool.alloc(64).unwrap();

        drop(a);
        drop(c);
        drop(b);
        assert_eq!(pool.free_bytes(), PAGE_SIZE - BUFFER_HEADER);

        // Whole usable span must be one run again.
        let all = pool.alloc(MAX_POOL_ALLOC).unwrap();
        assert_eq!(pool.buffer_count(), 1);
        assert_eq!(pool.free_bytes(), 0);
        drop(all);
    }

    #[test]
    fn chunks_are_zero_filled_on_reuse() {
        let pool = pool();
        let mut chunk = pool.alloc(64).unwrap();
        chunk.iter_mut().for_each(|b| *b = 0xA5);
        drop(chunk);

        let chunk = pool.alloc(64).unwrap();
        assert!(chunk.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhausted_buffer_chains_a_second_one() {
        let pool = pool();
        let _all = pool.alloc(MAX_POOL_ALLOC).unwrap();
        assert_eq!(pool.buffer_count(), 1);

        let _more = pool.alloc(64).unwrap();
        assert_eq!(pool.buffer_count(), 2);
    }

    #[test]
    fn oversized_requests_bypass_the_pool() {
        let pool = pool();
        let big = pool.alloc(2 * PAGE_SIZE).unwrap();
        assert_eq!(big.len(), 2 * PAGE_SIZE);
        assert_eq!(pool.buffer_count(), 0);
        drop(big);
        assert_eq!(pool.buffer_count(), 0);
    }

    #[test]
    fn mapper_failure_is_reported() {
        struct FailingMapper;
        impl DmaMapper for FailingMapper {
            fn map(&self, _size: usize, _ty: MemoryType) -> Result<DmaRegion, DmaError> {
                Err(DmaError)
            }
            unsafe fn unmap(&self, _region: DmaRegion) {
                unreachable!()
            }
        }

        let pool = DmaPool::new(Arc::new(FailingMapper));
        assert_eq!(pool.alloc(64).unwrap_err(), DmaError);
    }
}
