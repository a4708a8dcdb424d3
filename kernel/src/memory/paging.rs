//! Identity paging
//!
//! Builds a flat identity map out of 2 MiB huge pages: one PML4, enough
//! PDPTs and PDs to cover `max(total_physical_memory, 4 GiB)`, so both
//! RAM and the usual MMIO windows (PCI BARs, the NIC registers) are
//! reachable at their physical addresses. The bootloader's higher-half
//! mappings (kernel image, direct map, framebuffer) are carried over by
//! copying the upper half of the live PML4, then CR3 is switched exactly
//! once, before any driver touches device registers.

use crate::memory::{heap, phys_to_virt, virt_to_phys};

/// Page table entry flags
const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
/// 2 MiB leaf (valid in PD entries)
const PTE_HUGE: u64 = 1 << 7;

const GB: u64 = 1 << 30;
const MB: u64 = 1 << 20;
const PAGE_TABLE_SIZE: usize = 4096;
const ENTRIES_PER_TABLE: usize = 512;

/// Always map at least 4 GiB for MMIO/framebuffer
const MIN_MAPPED_BYTES: u64 = 4 * GB;

/// The identity map. Table pages live in aligned heap allocations that
/// are never freed (the MMU owns them for the kernel's lifetime).
pub struct IdentityMap {
    pml4: *mut u64,
    mapped_bytes: u64,
    table_count: u32,
}

unsafe impl Send for IdentityMap {}

impl IdentityMap {
    /// Allocate and populate the table hierarchy covering
    /// `max(total_memory, 4 GiB)`. Returns `None` if any table page
    /// cannot be allocated, which the caller must treat as fatal.
    pub fn build(total_memory: u64) -> Option<IdentityMap> {
        let map_size = total_memory.max(MIN_MAPPED_BYTES);

        // One PD covers 1 GiB (512 x 2 MiB); one PDPT covers 512 PDs
        let num_pds = ((map_size + GB - 1) / GB).max(1) as usize;
        let num_pdpts = (num_pds + ENTRIES_PER_TABLE - 1) / ENTRIES_PER_TABLE;

        let pml4 = alloc_table()?;
        let mut pdpts = [core::ptr::null_mut(); 4];
        if num_pdpts > pdpts.len() {
            // 4 PDPTs already cover 2 TiB of identity map
            return None;
        }

        for i in 0..num_pdpts {
            let pdpt = alloc_table()?;
            pdpts[i] = pdpt;
            unsafe {
                *pml4.add(i) = virt_to_phys(pdpt as u64) | PTE_PRESENT | PTE_WRITABLE;
            }
        }

        for i in 0..num_pds {
            let pd = alloc_table()?;
            for j in 0..ENTRIES_PER_TABLE {
                let phys = i as u64 * GB + j as u64 * (2 * MB);
                unsafe {
                    *pd.add(j) = phys | PTE_PRESENT | PTE_WRITABLE | PTE_HUGE;
                }
            }
            let pdpt = pdpts[i / ENTRIES_PER_TABLE];
            unsafe {
                *pdpt.add(i % ENTRIES_PER_TABLE) =
                    virt_to_phys(pd as u64) | PTE_PRESENT | PTE_WRITABLE;
            }
        }

        Some(IdentityMap {
            pml4,
            mapped_bytes: num_pds as u64 * GB,
            table_count: (1 + num_pdpts + num_pds) as u32,
        })
    }

    /// Copy the upper-half entries (kernel image, direct map) from the
    /// PML4 the bootloader left in CR3, so the switch does not pull the
    /// rug out from under the running code.
    ///
    /// # Safety
    /// Must run before `activate`, with the bootloader tables still live.
    pub unsafe fn inherit_higher_half(&mut self) {
        use x86_64::registers::control::Cr3;

        let (frame, _) = Cr3::read();
        let current = phys_to_virt(frame.start_address().as_u64()) as *const u64;
        for i in ENTRIES_PER_TABLE / 2..ENTRIES_PER_TABLE {
            let entry = *current.add(i);
            if entry & PTE_PRESENT != 0 {
                *self.pml4.add(i) = entry;
            }
        }
    }

    /// Physical address of the PML4 (what goes into CR3)
    pub fn pml4_phys(&self) -> u64 {
        virt_to_phys(self.pml4 as u64)
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes
    }

    pub fn table_count(&self) -> u32 {
        self.table_count
    }

    /// Walk PML4 -> PDPT -> PD for `addr`. Returns the physical base of
    /// the containing 2 MiB page if every level is present.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        let pml4_idx = ((addr >> 39) & 0x1FF) as usize;
        let pdpt_idx = ((addr >> 30) & 0x1FF) as usize;
        let pd_idx = ((addr >> 21) & 0x1FF) as usize;

        unsafe {
            let pml4e = *self.pml4.add(pml4_idx);
            if pml4e & PTE_PRESENT == 0 {
                return None;
            }
            let pdpt = phys_to_virt(pml4e & 0x000F_FFFF_FFFF_F000) as *const u64;
            let pdpte = *pdpt.add(pdpt_idx);
            if pdpte & PTE_PRESENT == 0 {
                return None;
            }
            let pd = phys_to_virt(pdpte & 0x000F_FFFF_FFFF_F000) as *const u64;
            let pde = *pd.add(pd_idx);
            if pde & PTE_PRESENT == 0 || pde & PTE_HUGE == 0 {
                return None;
            }
            Some(pde & 0x000F_FFFF_FFE0_0000)
        }
    }

    /// Load the PML4 into CR3.
    ///
    /// # Safety
    /// The map must cover every address the kernel is currently
    /// executing from and every device region in use.
    pub unsafe fn activate(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;

        let frame = PhysFrame::containing_address(PhysAddr::new(self.pml4_phys()));
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// One zeroed, page-aligned table page
fn alloc_table() -> Option<*mut u64> {
    let table = heap::alloc_aligned(PAGE_TABLE_SIZE, PAGE_TABLE_SIZE)?;
    let ptr = table.as_ptr() as *mut u64;
    unsafe {
        core::ptr::write_bytes(ptr, 0, ENTRIES_PER_TABLE);
    }
    Some(ptr)
}

/// Build the identity map for the detected memory size and switch to it.
/// Any allocation failure here is fatal.
pub fn init(total_memory: u64) -> IdentityMap {
    if total_memory == 0 {
        crate::log_warn!("paging: no memory map detected, assuming 4 GiB");
    }
    crate::log!("paging: {} MiB physical memory detected", total_memory / MB);

    let mut map = match IdentityMap::build(total_memory) {
        Some(m) => m,
        None => {
            crate::log_error!("paging: failed to allocate page tables");
            crate::halt_loop();
        }
    };

    crate::log!(
        "paging: identity mapped {} GiB with {} table pages",
        map.mapped_bytes() / GB,
        map.table_count()
    );

    unsafe {
        map.inherit_higher_half();
        map.activate();
    }
    crate::log!("paging: CR3 loaded");
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_at_least_four_gib() {
        crate::memory::heap::test_support::init_test_heap();
        // 128 MiB of RAM still maps the full 4 GiB floor
        let map = IdentityMap::build(128 * MB).unwrap();
        assert_eq!(map.mapped_bytes(), 4 * GB);
        // 1 PML4 + 1 PDPT + 4 PDs
        assert_eq!(map.table_count(), 6);
    }

    #[test]
    fn table_count_scales_with_memory() {
        crate::memory::heap::test_support::init_test_heap();
        let map = IdentityMap::build(6 * GB).unwrap();
        assert_eq!(map.mapped_bytes(), 6 * GB);
        assert_eq!(map.table_count(), 1 + 1 + 6);
    }

    #[test]
    fn every_address_walks_to_its_huge_page() {
        crate::memory::heap::test_support::init_test_heap();
        let map = IdentityMap::build(MIN_MAPPED_BYTES).unwrap();
        for addr in [
            0u64,
            0x1F_FFFF,
            0x20_0000,
            123 * MB + 4567,
            GB + 17,
            3 * GB + 2 * MB + 1,
            4 * GB - 1,
        ] {
            assert_eq!(map.translate(addr), Some(addr & !0x1F_FFFF));
        }
        // One past the end of the map is absent
        assert_eq!(map.translate(4 * GB), None);
    }
}
