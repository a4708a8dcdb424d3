//! Kernel heap allocator
//!
//! First-fit allocator over a single contiguous region. Every allocation is
//! preceded by a block header carrying a magic word, so `free` can validate
//! pointers and detect double frees. Adjacent free blocks are merged on
//! `free`, never during `alloc`.
//!
//! The same structure backs the `#[global_allocator]`, so `alloc::vec` and
//! friends draw from this heap.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;

/// Heap size: 32 MiB
pub const HEAP_SIZE: usize = 32 * 1024 * 1024;

const HEAP_MAGIC: u32 = 0xDEAD_BEEF;

/// A split only happens when the tail can hold a header plus this much
const MIN_SPLIT_PAYLOAD: usize = 16;

#[repr(C)]
struct BlockHeader {
    magic: u32,
    used: u8,
    size: usize,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// The free-list heap. All methods assume the caller holds the lock.
pub struct Heap {
    first: *mut BlockHeader,
    total_size: usize,
    used_size: usize,
}

// Raw pointers into a region only the lock holder touches
unsafe impl Send for Heap {}

impl Heap {
    pub const fn empty() -> Self {
        Self {
            first: ptr::null_mut(),
            total_size: 0,
            used_size: 0,
        }
    }

    /// Take ownership of `[start, start + size)` as one big free block.
    ///
    /// # Safety
    /// The region must be unused, writable and at least 8-byte aligned.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        let first = start as *mut BlockHeader;
        (*first).magic = HEAP_MAGIC;
        (*first).size = size - HEADER_SIZE;
        (*first).used = 0;
        (*first).next = ptr::null_mut();
        (*first).prev = ptr::null_mut();

        self.first = first;
        self.total_size = size;
        self.used_size = 0;
    }

    pub fn is_initialized(&self) -> bool {
        !self.first.is_null()
    }

    /// First free block with `size >= wanted`
    fn find_free_block(&self, wanted: usize) -> *mut BlockHeader {
        let mut current = self.first;
        while !current.is_null() {
            unsafe {
                if (*current).used == 0 && (*current).size >= wanted {
                    return current;
                }
                current = (*current).next;
            }
        }
        ptr::null_mut()
    }

    /// Carve `size` bytes off the front of `block`, leaving the tail free
    unsafe fn split_block(&mut self, block: *mut BlockHeader, size: usize) {
        if (*block).size < size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
            return;
        }

        let tail = (block as *mut u8).add(HEADER_SIZE + size) as *mut BlockHeader;
        (*tail).magic = HEAP_MAGIC;
        (*tail).size = (*block).size - size - HEADER_SIZE;
        (*tail).used = 0;
        (*tail).next = (*block).next;
        (*tail).prev = block;

        if !(*block).next.is_null() {
            (*(*block).next).prev = tail;
        }
        (*block).next = tail;
        (*block).size = size;
    }

    /// Merge `block` with whichever neighbors are free
    unsafe fn merge_blocks(&mut self, block: *mut BlockHeader) {
        let next = (*block).next;
        if !next.is_null() && (*next).used == 0 {
            (*block).size += HEADER_SIZE + (*next).size;
            (*block).next = (*next).next;
            if !(*next).next.is_null() {
                (*(*next).next).prev = block;
            }
        }

        let prev = (*block).prev;
        if !prev.is_null() && (*prev).used == 0 {
            (*prev).size += HEADER_SIZE + (*block).size;
            (*prev).next = (*block).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = prev;
            }
        }
    }

    /// First-fit allocation. Returns null when no block fits.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.first.is_null() {
            return ptr::null_mut();
        }

        // Round up to 8 bytes
        let size = (size + 7) & !7;

        let block = self.find_free_block(size);
        if block.is_null() {
            crate::log_error!("heap: out of memory (requested {} bytes)", size);
            return ptr::null_mut();
        }

        unsafe {
            self.split_block(block, size);
            (*block).used = 1;
            self.used_size += HEADER_SIZE + (*block).size;
            (block as *mut u8).add(HEADER_SIZE)
        }
    }

    /// Allocate zeroed memory for `count * size` bytes
    pub fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let p = self.alloc(total);
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, total) };
        }
        p
    }

    /// Release a pointer previously returned by `alloc`.
    ///
    /// Refuses (with a logged error) pointers whose header magic does not
    /// check out, and double frees.
    pub fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }

        let block = unsafe { p.sub(HEADER_SIZE) } as *mut BlockHeader;
        unsafe {
            if (*block).magic != HEAP_MAGIC {
                crate::log_error!("heap: free of invalid pointer {:p}", p);
                return;
            }
            if (*block).used == 0 {
                crate::log_error!("heap: double free of {:p}", p);
                return;
            }

            (*block).used = 0;
            self.used_size -= HEADER_SIZE + (*block).size;
            self.merge_blocks(block);
        }
    }

    /// Grow (or keep) an allocation. Returns null on failure, leaving the
    /// old allocation intact.
    pub fn realloc(&mut self, p: *mut u8, size: usize) -> *mut u8 {
        if p.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.free(p);
            return ptr::null_mut();
        }

        let block = unsafe { p.sub(HEADER_SIZE) } as *mut BlockHeader;
        unsafe {
            if (*block).magic != HEAP_MAGIC {
                return ptr::null_mut();
            }
            if (*block).size >= size {
                return p;
            }

            let new_p = self.alloc(size);
            if new_p.is_null() {
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(p, new_p, (*block).size.min(size));
            self.free(p);
            new_p
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total: self.total_size,
            used: self.used_size,
            free: self.total_size - self.used_size,
        }
    }

    /// Walk the chain and verify the free-list invariants: connected,
    /// address ordered, no two adjacent free blocks, magic intact.
    #[cfg(test)]
    fn check_invariants(&self) -> bool {
        let mut current = self.first;
        let mut prev_free = false;
        let mut prev_addr = 0usize;
        while !current.is_null() {
            unsafe {
                if (*current).magic != HEAP_MAGIC {
                    return false;
                }
                if (current as usize) <= prev_addr {
                    return false;
                }
                let free = (*current).used == 0;
                if free && prev_free {
                    return false;
                }
                prev_free = free;
                prev_addr = current as usize;
                current = (*current).next;
            }
        }
        true
    }
}

/// Heap usage snapshot
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

/// An aligned allocation for long-lived structures (page tables, DMA
/// rings). There is deliberately no way to free one: the address handed
/// out is an interior pointer that the block-header path cannot validate.
#[derive(Debug, Clone, Copy)]
pub struct AlignedAlloc {
    ptr: *mut u8,
}

unsafe impl Send for AlignedAlloc {}

impl AlignedAlloc {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }
}

/// Global kernel heap
static HEAP: Mutex<Heap> = Mutex::new(Heap::empty());

/// Hand the allocator its region. Called once during bring-up with the
/// 4 KiB-aligned address just above the kernel image.
pub fn init(start: usize, size: usize) {
    unsafe {
        HEAP.lock().init(start, size);
    }
    crate::log!("heap: {} KiB at {:#x}", size / 1024, start);
}

pub fn is_initialized() -> bool {
    HEAP.lock().is_initialized()
}

/// First-fit allocation from the global heap
pub fn alloc(size: usize) -> *mut u8 {
    HEAP.lock().alloc(size)
}

/// Zeroed allocation from the global heap
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    HEAP.lock().calloc(count, size)
}

/// Free a pointer from `alloc`/`calloc`/`realloc`
pub fn free(p: *mut u8) {
    HEAP.lock().free(p)
}

/// Reallocate from the global heap
pub fn realloc(p: *mut u8, size: usize) -> *mut u8 {
    HEAP.lock().realloc(p, size)
}

/// Aligned allocation. `align` must be a power of two. Over-allocates by
/// `align` and returns the first aligned address inside the block.
pub fn alloc_aligned(size: usize, align: usize) -> Option<AlignedAlloc> {
    if align == 0 || !align.is_power_of_two() {
        return None;
    }

    let raw = HEAP.lock().alloc(size + align);
    if raw.is_null() {
        return None;
    }

    let aligned = (raw as usize + align - 1) & !(align - 1);
    Some(AlignedAlloc {
        ptr: aligned as *mut u8,
    })
}

/// Global heap usage snapshot
pub fn stats() -> HeapStats {
    HEAP.lock().stats()
}

/// `GlobalAlloc` bridge so `alloc::*` containers draw from the kernel heap.
///
/// Alignments above 8 take a padded path that stashes the real block
/// pointer one word below the returned address, keeping `dealloc`
/// symmetric (unlike the public `alloc_aligned`, which is free-less by
/// design).
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = HEAP.lock();
        if layout.align() <= 8 {
            return heap.alloc(layout.size().max(1));
        }

        let raw = heap.alloc(layout.size() + layout.align() + 8);
        if raw.is_null() {
            return raw;
        }
        let aligned = (raw as usize + 8 + layout.align() - 1) & !(layout.align() - 1);
        ((aligned - 8) as *mut usize).write(raw as usize);
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        let mut heap = HEAP.lock();
        if layout.align() <= 8 {
            heap.free(p);
        } else {
            let raw = ((p as usize - 8) as *const usize).read() as *mut u8;
            heap.free(raw);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Backing arena for the global kernel heap in host-side tests, so
    //! code paths that call `alloc_aligned` (page tables, DMA rings)
    //! have something to draw from.

    use spin::Once;

    const ARENA_SIZE: usize = 8 * 1024 * 1024;

    #[repr(align(4096))]
    struct Arena([u8; ARENA_SIZE]);

    static mut ARENA: Arena = Arena([0; ARENA_SIZE]);
    static INIT: Once = Once::new();

    /// Point the global heap at a static arena, once per test process.
    pub fn init_test_heap() {
        INIT.call_once(|| unsafe {
            let start = core::ptr::addr_of_mut!(ARENA) as usize;
            super::HEAP.lock().init(start, ARENA_SIZE);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_REGION: usize = 256 * 1024;

    #[repr(align(4096))]
    struct Region([u8; TEST_REGION]);

    fn with_heap(f: impl FnOnce(&mut Heap)) {
        // Each test gets its own region so they cannot interfere
        let region = alloc::boxed::Box::leak(alloc::boxed::Box::new(Region([0; TEST_REGION])));
        let mut heap = Heap::empty();
        unsafe {
            heap.init(region as *mut Region as usize, TEST_REGION);
        }
        f(&mut heap);
    }

    #[test]
    fn alloc_rounds_to_eight_bytes() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            let a = heap.alloc(1);
            let b = heap.alloc(1);
            assert!(!a.is_null() && !b.is_null());
            // 1-byte request occupies an 8-byte payload plus the header
            assert_eq!(b as usize - a as usize, HEADER_SIZE + 8);
        });
    }

    #[test]
    fn free_merges_adjacent_blocks() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            let a = heap.alloc(64);
            let b = heap.alloc(64);
            let c = heap.alloc(64);
            assert!(!c.is_null());

            heap.free(a);
            heap.free(c);
            heap.free(b); // merges with both neighbors
            assert!(heap.check_invariants());

            // The whole region is one free block again
            assert_eq!(heap.stats().used, 0);
            let big = heap.alloc(TEST_REGION - 2 * HEADER_SIZE);
            assert!(!big.is_null());
        });
    }

    #[test]
    fn double_free_is_refused() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            let a = heap.alloc(32);
            heap.free(a);
            let used_after_first = heap.stats().used;
            heap.free(a); // must be a no-op
            assert_eq!(heap.stats().used, used_after_first);
            assert!(heap.check_invariants());
        });
    }

    #[test]
    fn invalid_pointer_is_refused() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            let a = heap.alloc(32);
            let used = heap.stats().used;
            // An interior pointer has no header magic in front of it
            heap.free(unsafe { a.add(8) });
            assert_eq!(heap.stats().used, used);
        });
    }

    #[test]
    fn aligned_alloc_is_aligned() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            for align in [16usize, 64, 4096] {
                let raw = heap.alloc(512 + align);
                assert!(!raw.is_null());
                let aligned = (raw as usize + align - 1) & !(align - 1);
                assert_eq!(aligned % align, 0);
            }
        });
    }

    #[test]
    fn realloc_preserves_contents() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            let p = heap.alloc(16);
            unsafe {
                for i in 0..16 {
                    p.add(i).write(i as u8);
                }
            }
            let q = heap.realloc(p, 256);
            assert!(!q.is_null());
            unsafe {
                for i in 0..16 {
                    assert_eq!(q.add(i).read(), i as u8);
                }
            }
        });
    }

    #[test]
    fn realloc_in_place_when_block_fits() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            let p = heap.alloc(128);
            let q = heap.realloc(p, 64);
            assert_eq!(p, q);
        });
    }

    #[test]
    fn churn_accounting_is_exact() {
        crate::memory::heap::test_support::init_test_heap();
        with_heap(|heap| {
            // alloc 100 x 128, free every other one, alloc 50 x 128:
            // usage must come back to exactly 100 live blocks.
            let mut ptrs = [core::ptr::null_mut(); 100];
            for p in ptrs.iter_mut() {
                *p = heap.alloc(128);
                assert!(!p.is_null());
            }
            for p in ptrs.iter().step_by(2) {
                heap.free(*p);
            }
            for _ in 0..50 {
                assert!(!heap.alloc(128).is_null());
            }
            assert_eq!(heap.stats().used, 100 * (HEADER_SIZE + 128));
            assert!(heap.check_invariants());
        });
    }
}
