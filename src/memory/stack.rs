use std::alloc::{self, Layout};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{AllocError, AllocationHeader, Allocator, DEFAULT_ALIGNMENT, align_up};

/// Opaque snapshot of a [`StackArena`] cursor.
///
/// Captures the statistics alongside the position so an unwind restores the
/// arena to exactly the observed state.
#[derive(Debug, Clone, Copy)]
pub struct Marker {
    position: usize,
    used: usize,
    allocations: usize,
}

/// Stack arena with lock-free allocation and marker-based scopes.
///
/// Multiple threads may `allocate` concurrently: the cursor is reserved with
/// a compare-and-swap and only ever moves forward between unwinds, so there
/// is no ABA window. `unwind` and `reset` take `&mut self` — callers must
/// prove all allocations past the marker are dead before rolling back.
pub struct StackArena {
    memory: NonNull<u8>,
    capacity: usize,
    base_align: usize,
    top: AtomicUsize,
    used: AtomicUsize,
    allocations: AtomicUsize,
}

impl StackArena {
    pub fn new(capacity: usize) -> Self {
        Self::with_alignment(capacity, DEFAULT_ALIGNMENT)
    }

    pub fn with_alignment(capacity: usize, base_align: usize) -> Self {
        assert!(capacity > 0, "arena capacity must be non-zero");
        assert!(base_align.is_power_of_two(), "alignment must be a power of two");
        let capacity = align_up(capacity, base_align);
        let layout = Layout::from_size_align(capacity, base_align)
            .expect("arena capacity overflows a Layout");
        let memory = unsafe { alloc::alloc(layout) };
        let memory = NonNull::new(memory).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self {
            memory,
            capacity,
            base_align,
            top: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Snapshot the current cursor for a later [`unwind`](Self::unwind).
    pub fn marker(&self) -> Marker {
        Marker {
            position: self.top.load(Ordering::Acquire),
            used: self.used.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }

    /// Roll the cursor back to `marker`, releasing everything allocated
    /// after it.
    ///
    /// Fails with [`AllocError::StaleMarker`] if the marker is ahead of the
    /// cursor (it was taken from a later state, or the arena was reset in
    /// between).
    pub fn unwind(&mut self, marker: Marker) -> Result<(), AllocError> {
        let top = self.top.get_mut();
        if marker.position > *top {
            return Err(AllocError::StaleMarker);
        }
        *top = marker.position;
        *self.used.get_mut() = marker.used;
        *self.allocations.get_mut() = marker.allocations;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read back the header written in front of an allocation produced by
    /// this arena.
    ///
    /// # Safety
    /// `ptr` must be a pointer returned by [`Allocator::allocate`] on this
    /// arena, still inside the live region below the cursor.
    pub unsafe fn header_of(&self, ptr: NonNull<u8>) -> AllocationHeader {
        let header = ptr.as_ptr() as usize - mem::size_of::<AllocationHeader>();
        unsafe { (header as *const AllocationHeader).read_unaligned() }
    }
}

impl Allocator for StackArena {
    fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "cannot allocate zero bytes");
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let header_size = mem::size_of::<AllocationHeader>();
        let base = self.memory.as_ptr() as usize;

        loop {
            let current = self.top.load(Ordering::Acquire);
            // Reserve room for the header, then pad the user pointer up to
            // the requested alignment of its absolute address.
            let user = align_up(base.checked_add(current)?.checked_add(header_size)?, align) - base;
            let new_top = user.checked_add(size)?;
            if new_top > self.capacity {
                return None;
            }

            if self
                .top
                .compare_exchange_weak(current, new_top, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The range [current, new_top) now belongs to this thread.
                unsafe {
                    let header = self.memory.as_ptr().add(user - header_size);
                    (header as *mut AllocationHeader)
                        .write_unaligned(AllocationHeader { size, align });
                    self.used.fetch_add(size, Ordering::Relaxed);
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                    return Some(NonNull::new_unchecked(self.memory.as_ptr().add(user)));
                }
            }
            // Lost the race; retry with the new cursor.
        }
    }

    fn deallocate(&self, _ptr: NonNull<u8>) {
        // Individual frees are not supported; use unwind() or reset().
    }

    fn reset(&mut self) {
        *self.top.get_mut() = 0;
        *self.used.get_mut() = 0;
        *self.allocations.get_mut() = 0;
    }

    fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn total_bytes(&self) -> usize {
        self.capacity
    }

    fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl Drop for StackArena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, self.base_align)
            .expect("layout was validated at construction");
        unsafe { alloc::dealloc(self.memory.as_ptr(), layout) };
    }
}

// SAFETY: the backing block is owned by the arena, reservation goes through
// the atomic cursor, and rollback requires &mut self.
unsafe impl Send for StackArena {}
unsafe impl Sync for StackArena {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::is_aligned;
    use std::collections::HashSet;

    #[test]
    fn test_alignment_law() {
        let arena = StackArena::new(64 * 1024);
        for align in [1usize, 4, 8, 16, 32, 128] {
            for size in [1usize, 7, 24, 100] {
                let ptr = arena.allocate(size, align).expect("arena should not exhaust");
                assert!(is_aligned(ptr.as_ptr() as usize, align));
            }
        }
    }

    #[test]
    fn test_header_precedes_allocation() {
        let arena = StackArena::new(1024);
        let ptr = arena.allocate(48, 32).unwrap();
        let header = unsafe { arena.header_of(ptr) };
        assert_eq!(header.size, 48);
        assert_eq!(header.align, 32);
    }

    #[test]
    fn test_unwind_restores_exact_state() {
        let mut arena = StackArena::new(4096);
        arena.allocate(100, 8).unwrap();

        let marker = arena.marker();
        let used = arena.used_bytes();
        let count = arena.allocation_count();

        arena.allocate(200, 16).unwrap();
        arena.allocate(300, 32).unwrap();
        arena.unwind(marker).unwrap();

        assert_eq!(arena.used_bytes(), used);
        assert_eq!(arena.allocation_count(), count);
        // Unwinding to the same marker again is a no-op.
        arena.unwind(marker).unwrap();
        assert_eq!(arena.used_bytes(), used);
    }

    #[test]
    fn test_stack_scope_scenario() {
        let mut arena = StackArena::new(1024);
        arena.allocate(64, 8).unwrap();

        let marker = arena.marker();
        arena.allocate(100, 8).unwrap();
        arena.allocate(200, 8).unwrap();
        arena.unwind(marker).unwrap();
        assert_eq!(arena.used_bytes(), 64);

        // The next allocation lands exactly where the first post-marker one
        // did.
        let replay = arena.allocate(32, 8).unwrap();
        arena.unwind(marker).unwrap();
        let again = arena.allocate(32, 8).unwrap();
        assert_eq!(replay, again);
    }

    #[test]
    fn test_stale_marker_rejected() {
        let mut arena = StackArena::new(1024);
        arena.allocate(64, 8).unwrap();
        let marker = arena.marker();
        arena.reset();
        assert_eq!(arena.unwind(marker), Err(AllocError::StaleMarker));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let arena = StackArena::new(256);
        assert!(arena.allocate(512, 8).is_none());
        assert_eq!(arena.allocation_count(), 0);
    }

    #[test]
    fn test_concurrent_allocate_disjoint_ranges() {
        let arena = StackArena::new(1 << 20);
        let per_thread = 64;

        let mut all = HashSet::new();
        std::thread::scope(|scope| {
            let mut joins = Vec::new();
            for _ in 0..4 {
                joins.push(scope.spawn(|| {
                    let mut local = Vec::new();
                    for _ in 0..per_thread {
                        let ptr = arena.allocate(64, 16).expect("arena should not exhaust");
                        assert!(is_aligned(ptr.as_ptr() as usize, 16));
                        local.push(ptr.as_ptr() as usize);
                    }
                    local
                }));
            }
            for join in joins {
                for addr in join.join().unwrap() {
                    assert!(all.insert(addr), "two threads received the same block");
                }
            }
        });

        assert_eq!(arena.allocation_count(), 4 * per_thread);
        assert_eq!(arena.used_bytes(), 4 * per_thread * 64);
    }
}
