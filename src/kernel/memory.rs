//! Heap Allocator
//!
//! First-fit free list allocator with block coalescing. A [`Heap`] manages an
//! arbitrary region handed to [`Heap::init`]; the kernel instance spans the
//! linker-provided `[__heap_start, __heap_end)` region and doubles as the
//! global allocator for `alloc` collections.

use crate::arch::SpinLock;

/// Magic value stamped into every block header
const BLOCK_MAGIC: u32 = 0xDEAD_BEEF;

/// Payload alignment. Headers are padded to a multiple of this so payloads
/// start aligned too.
const ALIGN_SIZE: usize = 16;

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Minimum useful block: header plus a 16-byte payload
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 16;

#[inline]
const fn align_up(x: usize) -> usize {
    (x + (ALIGN_SIZE - 1)) & !(ALIGN_SIZE - 1)
}

/// Block header - placed before each allocation.
///
/// `align(16)` pads the header to 32 bytes so the payload that follows it
/// keeps 16-byte alignment.
#[repr(C, align(16))]
struct BlockHeader {
    /// Total size including the header
    size: usize,
    /// Next block in memory order
    next: *mut BlockHeader,
    /// 1 = free, 0 = allocated
    is_free: u32,
    magic: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEAP
// ═══════════════════════════════════════════════════════════════════════════════

/// First-fit heap over a caller-provided region.
pub struct Heap {
    head: *mut BlockHeader,
    initialized: bool,
}

// SAFETY: the Heap owns its region exclusively; access is serialized by the
// SpinLock around the global instance.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Heap {
            head: core::ptr::null_mut(),
            initialized: false,
        }
    }

    /// Initialize with a single free block spanning the whole region.
    ///
    /// # Safety
    /// The region `[start, start + size)` must be valid, writable memory
    /// owned exclusively by this heap.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        if self.initialized {
            return;
        }

        let aligned_start = align_up(start);
        let mut heap_size = size - (aligned_start - start);
        heap_size &= !(ALIGN_SIZE - 1);

        let head = aligned_start as *mut BlockHeader;
        (*head).size = heap_size;
        (*head).next = core::ptr::null_mut();
        (*head).is_free = 1;
        (*head).magic = BLOCK_MAGIC;

        self.head = head;
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocate `size` bytes. Returns null when no block fits.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.initialized || size == 0 {
            return core::ptr::null_mut();
        }

        let mut total_size = align_up(HEADER_SIZE + size);
        if total_size < MIN_BLOCK_SIZE {
            total_size = MIN_BLOCK_SIZE;
        }

        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                if (*current).magic != BLOCK_MAGIC {
                    // Heap corruption - refuse to continue walking
                    return core::ptr::null_mut();
                }

                if (*current).is_free == 1 && (*current).size >= total_size {
                    // Split if the remainder is still a useful block
                    if (*current).size >= total_size + MIN_BLOCK_SIZE {
                        let new_block =
                            (current as usize + total_size) as *mut BlockHeader;
                        (*new_block).size = (*current).size - total_size;
                        (*new_block).next = (*current).next;
                        (*new_block).is_free = 1;
                        (*new_block).magic = BLOCK_MAGIC;

                        (*current).size = total_size;
                        (*current).next = new_block;
                    }

                    (*current).is_free = 0;
                    return (current as usize + HEADER_SIZE) as *mut u8;
                }

                current = (*current).next;
            }
        }

        core::ptr::null_mut()
    }

    /// Free a previously allocated pointer. Null, bad magic and double frees
    /// are silent no-ops - never corrupt further.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() || !self.initialized {
            return;
        }

        let block = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;

        unsafe {
            if (*block).magic != BLOCK_MAGIC {
                return;
            }
            if (*block).is_free == 1 {
                return;
            }

            (*block).is_free = 1;

            // Coalesce with the successor if it is free
            let next = (*block).next;
            if !next.is_null() && (*next).is_free == 1 {
                (*block).size += (*next).size;
                (*block).next = (*next).next;
            }

            // Coalesce with the predecessor, found by walking from the head
            let mut current = self.head;
            while !current.is_null() && !(*current).next.is_null() {
                if (*current).is_free == 1 && (*current).next == block {
                    (*current).size += (*block).size;
                    (*current).next = (*block).next;
                    break;
                }
                current = (*current).next;
            }
        }
    }

    /// Allocate zeroed memory for `num` items of `size` bytes.
    pub fn calloc(&mut self, num: usize, size: usize) -> *mut u8 {
        let total = num.wrapping_mul(size);
        if num != 0 && total / num != size {
            return core::ptr::null_mut();
        }

        let ptr = self.alloc(total);
        if !ptr.is_null() {
            unsafe { core::ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Resize an allocation. Returns the same pointer when the current
    /// payload already suffices.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }

        let block = (ptr as usize - HEADER_SIZE) as *mut BlockHeader;
        unsafe {
            if (*block).magic != BLOCK_MAGIC {
                return core::ptr::null_mut();
            }

            let current_payload = (*block).size - HEADER_SIZE;
            if size <= current_payload {
                return ptr;
            }

            let new_ptr = self.alloc(size);
            if !new_ptr.is_null() {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, current_payload);
                self.free(ptr);
            }
            new_ptr
        }
    }

    /// Total free payload bytes
    pub fn free_bytes(&self) -> usize {
        self.sum_payloads(1)
    }

    /// Total allocated payload bytes
    pub fn used_bytes(&self) -> usize {
        self.sum_payloads(0)
    }

    fn sum_payloads(&self, want_free: u32) -> usize {
        let mut bytes = 0;
        let mut current = self.head;
        while !current.is_null() {
            unsafe {
                if (*current).is_free == want_free {
                    bytes += (*current).size - HEADER_SIZE;
                }
                current = (*current).next;
            }
        }
        bytes
    }

    /// Check the "no two adjacent free blocks" invariant and header magics.
    pub fn check(&self) -> bool {
        let mut current = self.head;
        unsafe {
            while !current.is_null() {
                if (*current).magic != BLOCK_MAGIC {
                    return false;
                }
                let next = (*current).next;
                if !next.is_null() && (*current).is_free == 1 && (*next).is_free == 1 {
                    return false;
                }
                current = next;
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// KERNEL HEAP INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

static KERNEL_HEAP: SpinLock<Heap> = SpinLock::new(Heap::new());

#[cfg(target_arch = "aarch64")]
extern "C" {
    static __heap_start: u8;
    static __heap_end: u8;
}

/// Initialize the kernel heap from the linker-provided region.
///
/// # Safety
/// Must be called once, before any allocation.
#[cfg(target_arch = "aarch64")]
pub unsafe fn init() {
    let start = &__heap_start as *const u8 as usize;
    let end = &__heap_end as *const u8 as usize;
    KERNEL_HEAP.lock().init(start, end - start);
}

pub fn alloc(size: usize) -> *mut u8 {
    KERNEL_HEAP.lock().alloc(size)
}

pub fn free(ptr: *mut u8) {
    KERNEL_HEAP.lock().free(ptr)
}

pub fn free_bytes() -> usize {
    KERNEL_HEAP.lock().free_bytes()
}

pub fn used_bytes() -> usize {
    KERNEL_HEAP.lock().used_bytes()
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBAL ALLOCATOR
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(all(target_arch = "aarch64", not(test)))]
struct KernelAllocator;

#[cfg(all(target_arch = "aarch64", not(test)))]
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ALIGN_SIZE {
            return core::ptr::null_mut();
        }
        KERNEL_HEAP.lock().alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        KERNEL_HEAP.lock().free(ptr)
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
#[global_allocator]
static GLOBAL: KernelAllocator = KernelAllocator;

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    #[repr(align(16))]
    struct Region([u8; 64 * 1024]);

    fn with_heap(f: impl FnOnce(&mut Heap)) {
        let mut region = Box::new(Region([0; 64 * 1024]));
        let mut heap = Heap::new();
        unsafe {
            heap.init(region.0.as_mut_ptr() as usize, region.0.len());
        }
        f(&mut heap);
    }

    #[test]
    fn test_basic_alloc_free() {
        with_heap(|heap| {
            let p = heap.alloc(100);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            unsafe { core::ptr::write_bytes(p, 0xAB, 100) };
            heap.free(p);
            assert!(heap.check());
        });
    }

    #[test]
    fn test_alloc_zero_returns_null() {
        with_heap(|heap| {
            assert!(heap.alloc(0).is_null());
        });
    }

    #[test]
    fn test_coalesce_allows_larger_realloc() {
        with_heap(|heap| {
            let p1 = heap.alloc(100);
            let p2 = heap.alloc(200);
            assert!(!p1.is_null() && !p2.is_null());
            heap.free(p1);
            heap.free(p2);
            // Freed neighbors must have merged into a block that can hold
            // more than either original allocation.
            let p3 = heap.alloc(290);
            assert!(!p3.is_null());
            assert!(heap.check());
        });
    }

    #[test]
    fn test_no_adjacent_free_blocks() {
        with_heap(|heap| {
            let mut ptrs = [core::ptr::null_mut(); 8];
            for (i, p) in ptrs.iter_mut().enumerate() {
                *p = heap.alloc(32 + i * 16);
            }
            // Free in a mixed order
            for &i in &[1usize, 3, 5, 7, 0, 2, 4, 6] {
                heap.free(ptrs[i]);
                assert!(heap.check());
            }
        });
    }

    #[test]
    fn test_magic_until_free() {
        with_heap(|heap| {
            let p = heap.alloc(64);
            let header = (p as usize - HEADER_SIZE) as *const BlockHeader;
            unsafe {
                assert_eq!((*header).magic, BLOCK_MAGIC);
                assert_eq!((*header).is_free, 0);
            }
            heap.free(p);
            unsafe { assert_eq!((*header).is_free, 1) };
        });
    }

    #[test]
    fn test_double_free_is_noop() {
        with_heap(|heap| {
            let p1 = heap.alloc(64);
            let free_before = heap.free_bytes();
            heap.free(p1);
            let free_after = heap.free_bytes();
            heap.free(p1); // double free
            assert_eq!(heap.free_bytes(), free_after);
            assert!(free_after > free_before);
            assert!(heap.check());
        });
    }

    #[test]
    fn test_corrupt_magic_free_is_noop() {
        with_heap(|heap| {
            let p = heap.alloc(64);
            let header = (p as usize - HEADER_SIZE) as *mut BlockHeader;
            unsafe { (*header).magic = 0x1234_5678 };
            let used = heap.used_bytes();
            heap.free(p);
            // Block was not released
            assert_eq!(heap.used_bytes(), used);
            unsafe { (*header).magic = BLOCK_MAGIC };
        });
    }

    #[test]
    fn test_calloc_zeroes_and_checks_overflow() {
        with_heap(|heap| {
            let p = heap.calloc(10, 10);
            assert!(!p.is_null());
            for i in 0..100 {
                assert_eq!(unsafe { *p.add(i) }, 0);
            }
            assert!(heap.calloc(usize::MAX, 2).is_null());
        });
    }

    #[test]
    fn test_realloc_shrink_keeps_pointer() {
        with_heap(|heap| {
            let p = heap.alloc(100);
            unsafe { *p = 0x42 };
            let q = heap.realloc(p, 50);
            assert_eq!(p, q);
        });
    }

    #[test]
    fn test_realloc_grow_copies() {
        with_heap(|heap| {
            let p = heap.alloc(16);
            unsafe {
                for i in 0..16 {
                    *p.add(i) = i as u8;
                }
            }
            let q = heap.realloc(p, 4096);
            assert!(!q.is_null());
            assert_ne!(p, q);
            for i in 0..16 {
                assert_eq!(unsafe { *q.add(i) }, i as u8);
            }
        });
    }

    #[test]
    fn test_stats_track_payloads() {
        with_heap(|heap| {
            let total = heap.free_bytes();
            let p = heap.alloc(100);
            assert!(heap.used_bytes() >= 100);
            assert!(heap.free_bytes() < total);
            heap.free(p);
            assert_eq!(heap.used_bytes(), 0);
            assert_eq!(heap.free_bytes(), total);
        });
    }

    #[test]
    fn test_oom_returns_null() {
        with_heap(|heap| {
            assert!(heap.alloc(1024 * 1024).is_null());
        });
    }
}
