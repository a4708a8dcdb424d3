//! Memory management
//!
//! The kernel heap (block-header free list) and the identity-paging
//! bring-up. The boot code publishes the total physical memory and the
//! bootloader's higher-half direct-map offset here; heap pointers live in
//! the direct map, so anything handed to hardware (page tables, DMA
//! rings) goes through `virt_to_phys` first.

pub mod heap;
pub mod paging;

use core::sync::atomic::{AtomicU64, Ordering};

/// Total physical memory in bytes, from the bootloader memory map
static TOTAL_PHYSICAL_MEMORY: AtomicU64 = AtomicU64::new(0);

/// Higher-half direct map offset (0 until boot publishes it, which also
/// makes the conversions identity in host-side tests)
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_total_physical_memory(bytes: u64) {
    TOTAL_PHYSICAL_MEMORY.store(bytes, Ordering::Relaxed);
}

pub fn total_physical_memory() -> u64 {
    TOTAL_PHYSICAL_MEMORY.load(Ordering::Relaxed)
}

pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Relaxed);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Physical address of a direct-map pointer
pub fn virt_to_phys(virt: u64) -> u64 {
    let offset = hhdm_offset();
    if virt >= offset {
        virt - offset
    } else {
        virt
    }
}

/// Direct-map pointer for a physical address
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + hhdm_offset()
}
