use std::alloc::{self, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use super::{Allocator, align_up};

/// One fixed block size serviced by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    pub block_size: usize,
    pub blocks_per_chunk: usize,
    pub alignment: usize,
}

/// Intrusive free-list link, stored inside the free block's own bytes so the
/// user pointer is the block pointer and keeps the class alignment.
struct FreeLink {
    next: *mut FreeLink,
}

/// A chunk of `blocks_per_chunk` equally sized blocks with a LIFO free list.
struct Chunk {
    memory: NonNull<u8>,
    layout: Layout,
    total_bytes: usize,
    free_list: *mut FreeLink,
}

impl Chunk {
    fn new(class: &SizeClass) -> Self {
        let stride = align_up(
            class.block_size.max(mem::size_of::<FreeLink>()),
            class.alignment,
        );
        let total_bytes = stride * class.blocks_per_chunk;
        let layout = Layout::from_size_align(total_bytes, class.alignment)
            .expect("size class overflows a Layout");
        let memory = unsafe { alloc::alloc(layout) };
        let memory = NonNull::new(memory).unwrap_or_else(|| alloc::handle_alloc_error(layout));

        let mut chunk = Self {
            memory,
            layout,
            total_bytes,
            free_list: ptr::null_mut(),
        };
        // Thread the free list through the blocks, first block on top.
        unsafe {
            for i in (0..class.blocks_per_chunk).rev() {
                let block = chunk.memory.as_ptr().add(i * stride) as *mut FreeLink;
                (*block).next = chunk.free_list;
                chunk.free_list = block;
            }
        }
        chunk
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let begin = self.memory.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= begin && addr < begin + self.total_bytes
    }

    fn take(&mut self) -> Option<NonNull<u8>> {
        if self.free_list.is_null() {
            return None;
        }
        unsafe {
            let block = self.free_list;
            self.free_list = (*block).next;
            Some(NonNull::new_unchecked(block as *mut u8))
        }
    }

    fn put(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let block = ptr.as_ptr() as *mut FreeLink;
            (*block).next = self.free_list;
            self.free_list = block;
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}

// SAFETY: the raw links only ever point into the chunk's own allocation.
unsafe impl Send for Chunk {}

struct ChunkList {
    chunks: Vec<Chunk>,
    /// Index of the chunk that served the most recent allocate/deallocate.
    active: usize,
}

struct ThreadPool {
    generation: usize,
    chunks_by_class: Vec<ChunkList>,
}

impl ThreadPool {
    fn new(num_classes: usize, generation: usize) -> Self {
        Self {
            generation,
            chunks_by_class: (0..num_classes)
                .map(|_| ChunkList {
                    chunks: Vec::new(),
                    active: 0,
                })
                .collect(),
        }
    }
}

/// Pool allocator with per-thread chunk lists, one per size class.
///
/// Each thread services its allocations from chunks only it touches; the
/// shared registry is consulted once per call to find the calling thread's
/// pool. Cross-thread deallocation is not supported — a pointer owned by
/// another thread's pool (or another allocator entirely) is silently
/// ignored.
pub struct PoolAllocator {
    size_classes: Vec<SizeClass>,
    pools: Mutex<Vec<(ThreadId, Arc<Mutex<ThreadPool>>)>>,
    allocation_count: AtomicUsize,
    total_bytes: AtomicUsize,
    used_bytes: AtomicUsize,
    generation: AtomicUsize,
}

impl PoolAllocator {
    /// `size_classes` must be non-empty and sorted by ascending block size;
    /// the smallest fitting class wins on allocation.
    pub fn new(size_classes: Vec<SizeClass>) -> Self {
        assert!(!size_classes.is_empty(), "at least one size class required");
        for class in &size_classes {
            assert!(class.block_size > 0, "block size must be non-zero");
            assert!(class.blocks_per_chunk > 0, "chunk must hold at least one block");
            assert!(
                class.alignment.is_power_of_two(),
                "class alignment must be a power of two"
            );
        }
        debug_assert!(
            size_classes.windows(2).all(|w| w[0].block_size <= w[1].block_size),
            "size classes must be ordered by block size"
        );
        Self {
            size_classes,
            pools: Mutex::new(Vec::new()),
            allocation_count: AtomicUsize::new(0),
            total_bytes: AtomicUsize::new(0),
            used_bytes: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    pub fn size_classes(&self) -> &[SizeClass] {
        &self.size_classes
    }

    /// Allocate `count` blocks of the same shape, amortizing the pool lookup
    /// and statistics updates. Stops early if a chunk cannot be grown.
    pub fn allocate_batch(&self, count: usize, size: usize, align: usize) -> Vec<NonNull<u8>> {
        assert!(size > 0, "cannot allocate zero bytes");
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let mut out = Vec::new();
        let Some(class_index) = self.find_size_class(size, align) else {
            return out;
        };
        if count == 0 {
            return out;
        }
        out.reserve(count);

        let pool = self.thread_pool();
        let mut pool = pool.lock();
        for _ in 0..count {
            match self.allocate_in(&mut pool, class_index) {
                Some(ptr) => out.push(ptr),
                None => break,
            }
        }

        if !out.is_empty() {
            let block_size = self.size_classes[class_index].block_size;
            self.allocation_count.fetch_add(out.len(), Ordering::Relaxed);
            self.used_bytes.fetch_add(out.len() * block_size, Ordering::Relaxed);
        }
        out
    }

    /// Batch counterpart of `deallocate`; foreign pointers are skipped.
    pub fn deallocate_batch(&self, ptrs: &[NonNull<u8>]) {
        if ptrs.is_empty() {
            return;
        }
        let pool = self.thread_pool();
        let mut pool = pool.lock();
        let mut released = 0;
        for &ptr in ptrs {
            if let Some(block_size) = Self::release(&self.size_classes, &mut pool, ptr) {
                released += block_size;
            }
        }
        if released > 0 {
            self.used_bytes.fetch_sub(released, Ordering::Relaxed);
        }
    }

    /// Smallest class that satisfies both the size and the alignment.
    fn find_size_class(&self, size: usize, align: usize) -> Option<usize> {
        self.size_classes
            .iter()
            .position(|class| class.block_size >= size && class.alignment >= align)
    }

    /// Find or create the calling thread's pool, refreshing it if the
    /// allocator generation moved since the pool was built.
    fn thread_pool(&self) -> Arc<Mutex<ThreadPool>> {
        let tid = thread::current().id();
        let generation = self.generation.load(Ordering::Acquire);

        let mut pools = self.pools.lock();
        if let Some((_, pool)) = pools.iter().find(|(id, _)| *id == tid) {
            let pool = Arc::clone(pool);
            drop(pools);
            let mut guard = pool.lock();
            if guard.generation != generation {
                *guard = ThreadPool::new(self.size_classes.len(), generation);
            }
            drop(guard);
            return pool;
        }

        let pool = Arc::new(Mutex::new(ThreadPool::new(
            self.size_classes.len(),
            generation,
        )));
        pools.push((tid, Arc::clone(&pool)));
        pool
    }

    fn allocate_in(&self, pool: &mut ThreadPool, class_index: usize) -> Option<NonNull<u8>> {
        let list = &mut pool.chunks_by_class[class_index];

        // Fast path: the chunk that served the last call.
        if !list.chunks.is_empty() {
            if list.active >= list.chunks.len() {
                list.active = 0;
            }
            if let Some(ptr) = list.chunks[list.active].take() {
                return Some(ptr);
            }
            // Slow path: any chunk with room.
            for i in 0..list.chunks.len() {
                if let Some(ptr) = list.chunks[i].take() {
                    list.active = i;
                    return Some(ptr);
                }
            }
        }

        // Grow with a fresh chunk.
        let chunk = Chunk::new(&self.size_classes[class_index]);
        self.total_bytes.fetch_add(chunk.total_bytes, Ordering::Relaxed);
        list.chunks.push(chunk);
        list.active = list.chunks.len() - 1;
        list.chunks[list.active].take()
    }

    /// Return the block to its owning chunk; `None` if no chunk in this
    /// thread's pool contains the pointer.
    fn release(
        size_classes: &[SizeClass],
        pool: &mut ThreadPool,
        ptr: NonNull<u8>,
    ) -> Option<usize> {
        for (class_index, list) in pool.chunks_by_class.iter_mut().enumerate() {
            for (i, chunk) in list.chunks.iter_mut().enumerate() {
                if chunk.contains(ptr) {
                    chunk.put(ptr);
                    // Prefer this chunk for the next allocation.
                    list.active = i;
                    return Some(size_classes[class_index].block_size);
                }
            }
        }
        None
    }
}

impl Allocator for PoolAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "cannot allocate zero bytes");
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let class_index = self.find_size_class(size, align)?;
        let pool = self.thread_pool();
        let mut pool = pool.lock();
        let ptr = self.allocate_in(&mut pool, class_index)?;

        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.used_bytes
            .fetch_add(self.size_classes[class_index].block_size, Ordering::Relaxed);
        Some(ptr)
    }

    fn deallocate(&self, ptr: NonNull<u8>) {
        let pool = self.thread_pool();
        let mut pool = pool.lock();
        match Self::release(&self.size_classes, &mut pool, ptr) {
            Some(block_size) => {
                self.used_bytes.fetch_sub(block_size, Ordering::Relaxed);
            }
            None => {
                // Not ours: may belong to another thread's pool or another
                // allocator. The contract is to ignore it.
                log::trace!("pool deallocate ignored foreign pointer {:p}", ptr);
            }
        }
    }

    fn reset(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.pools.get_mut().clear();
        *self.allocation_count.get_mut() = 0;
        *self.total_bytes.get_mut() = 0;
        *self.used_bytes.get_mut() = 0;
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::is_aligned;

    fn two_class_pool() -> PoolAllocator {
        PoolAllocator::new(vec![
            SizeClass { block_size: 16, blocks_per_chunk: 4, alignment: 16 },
            SizeClass { block_size: 64, blocks_per_chunk: 2, alignment: 16 },
        ])
    }

    #[test]
    fn test_size_class_selection() {
        let pool = two_class_pool();

        // Fits the 16-byte class and comes back 16-aligned.
        let small = pool.allocate(12, 8).expect("small class should fit");
        assert!(is_aligned(small.as_ptr() as usize, 16));

        // Too big for the small class, lands in the 64-byte class.
        pool.allocate(20, 8).expect("large class should fit");
        assert_eq!(pool.used_bytes(), 16 + 64);

        // No class fits.
        assert!(pool.allocate(200, 8).is_none());
        assert_eq!(pool.allocation_count(), 2);
    }

    #[test]
    fn test_alignment_unsupported_by_classes() {
        let pool = two_class_pool();
        assert!(pool.allocate(8, 64).is_none());
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = two_class_pool();
        let a = pool.allocate(16, 8).unwrap();
        let _b = pool.allocate(16, 8).unwrap();

        pool.deallocate(a);
        let c = pool.allocate(16, 8).unwrap();
        assert_eq!(a, c, "most recently freed block is handed out first");
    }

    #[test]
    fn test_chunk_growth_counts_total_bytes() {
        let pool = two_class_pool();
        pool.allocate(16, 8).unwrap();
        // One 4-block chunk of 16-byte blocks.
        assert_eq!(pool.total_bytes(), 4 * 16);

        // 4 blocks per chunk; the 5th forces a second chunk.
        for _ in 0..4 {
            pool.allocate(16, 8).unwrap();
        }
        assert_eq!(pool.total_bytes(), 2 * 4 * 16);
    }

    #[test]
    fn test_foreign_pointer_ignored() {
        let pool = two_class_pool();
        let mut outside = 0u64;
        let ptr = NonNull::new(&mut outside as *mut u64 as *mut u8).unwrap();
        pool.deallocate(ptr);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn test_cross_thread_isolation() {
        let pool = two_class_pool();
        let main_ptr = pool.allocate(16, 8).unwrap();
        pool.deallocate(main_ptr);

        // A fresh thread draws from its own chunks; it can never be handed
        // the block the main thread just freed.
        let main_addr = main_ptr.as_ptr() as usize;
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let other = pool.allocate(16, 8).unwrap();
                    assert_ne!(other.as_ptr() as usize, main_addr);
                })
                .join()
                .unwrap();
        });
    }

    #[test]
    fn test_batch_roundtrip() {
        let pool = two_class_pool();
        let ptrs = pool.allocate_batch(6, 16, 8);
        assert_eq!(ptrs.len(), 6);
        assert_eq!(pool.allocation_count(), 6);
        assert_eq!(pool.used_bytes(), 6 * 16);

        pool.deallocate_batch(&ptrs);
        assert_eq!(pool.used_bytes(), 0);

        // Batch with no fitting class yields nothing.
        assert!(pool.allocate_batch(3, 500, 8).is_empty());
    }

    #[test]
    fn test_reset_invalidates_pools() {
        let mut pool = two_class_pool();
        pool.allocate(16, 8).unwrap();
        pool.allocate(20, 8).unwrap();
        assert!(pool.total_bytes() > 0);

        pool.reset();
        assert_eq!(pool.used_bytes(), 0);
        assert_eq!(pool.total_bytes(), 0);
        assert_eq!(pool.allocation_count(), 0);

        // The refreshed pool serves allocations from new chunks.
        pool.allocate(16, 8).unwrap();
        assert_eq!(pool.allocation_count(), 1);
    }
}
