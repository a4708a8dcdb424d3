//! Osmium kernel
//!
//! A small x86-64 kernel booted by Limine: interrupt dispatch, a
//! block-header heap, identity paging, ATA PIO storage with MBR
//! partitions, SimpleFS under a VFS, a windowed GUI and a polled TCP/IP
//! stack over an Intel e1000.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

mod drivers;
mod fs;
mod graphics;
mod gui;
mod interrupts;
mod keyboard;
mod logger;
mod memory;
mod mouse;
mod netstack;
mod pci;
mod serial;

use limine::request::{FramebufferRequest, HhdmRequest, MemoryMapRequest, RequestsEndMarker, RequestsStartMarker};
use limine::BaseRevision;

use alloc::boxed::Box;
use drivers::block::{AtaBlockDevice, PartitionBlockDevice};

// ============================================================================
// Limine protocol requests
// ============================================================================

#[used]
#[link_section = ".requests_start_marker"]
static _START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

/// Limine base revision, for protocol compatibility
#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// The linear framebuffer
#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Physical memory map
#[used]
#[link_section = ".requests"]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// Higher-half direct map offset
#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests_end_marker"]
static _END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

// ============================================================================
// Global allocator
// ============================================================================

// Host-side tests run under the system allocator; the kernel heap only
// serves the real boot path.
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: memory::heap::KernelAllocator = memory::heap::KernelAllocator;

/// Park the CPU forever
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Locate a usable region for the heap and report the top of physical
/// memory. Returns (heap_phys_base, total_physical_memory).
fn parse_memory_map() -> (u64, u64) {
    let mut heap_base = 0u64;
    let mut total_memory = 0u64;

    if let Some(response) = MEMORY_MAP_REQUEST.get_response() {
        for entry in response.entries() {
            if entry.entry_type == limine::memory_map::EntryType::USABLE {
                total_memory = total_memory.max(entry.base + entry.length);
                // First usable region above 1 MiB that fits the heap
                if heap_base == 0
                    && entry.base >= 0x10_0000
                    && entry.length >= memory::heap::HEAP_SIZE as u64
                {
                    heap_base = entry.base;
                }
            }
        }
    }

    (heap_base, total_memory)
}

/// Mount the root filesystem: the first detected partition, formatted
/// fresh when it carries no SimpleFS yet.
fn mount_root() {
    let Some(part) = drivers::partition::at(0) else {
        crate::log_warn!("fs: no partitions, running without a root filesystem");
        return;
    };

    let device = PartitionBlockDevice::new(AtaBlockDevice::new(part.drive), &part);
    let total_blocks = device.num_sectors();

    match fs::simplefs::SimpleFs::mount(Box::new(device)) {
        Ok(root) => {
            fs::vfs::set_root(Box::new(root));
            crate::log!("fs: root mounted from drive {} partition {}", part.drive, part.partition_index);
        }
        Err(fs::FsError::InvalidMagic) => {
            crate::log!("fs: no filesystem on root partition, formatting");
            let mut device = PartitionBlockDevice::new(AtaBlockDevice::new(part.drive), &part);
            if fs::simplefs::format(&mut device, total_blocks, 300).is_ok() {
                if let Err(e) = fs::simplefs::init(Box::new(device)) {
                    crate::log_error!("fs: mount after format failed: {:?}", e);
                }
            }
        }
        Err(e) => crate::log_error!("fs: root mount failed: {:?}", e),
    }
}

/// Kernel entry point, called by Limine with interrupts disabled
#[cfg_attr(not(test), no_mangle)]
pub extern "C" fn kmain() -> ! {
    serial::init();
    serial_println!("Osmium kernel starting");

    if !BASE_REVISION.is_supported() {
        serial_println!("unsupported Limine revision");
        halt_loop();
    }

    if let Some(response) = HHDM_REQUEST.get_response() {
        memory::set_hhdm_offset(response.offset());
    }

    // Stage 1: interrupt fabric (all lines masked until drivers claim them)
    interrupts::init();

    // Stage 2: heap
    let (heap_base, total_memory) = parse_memory_map();
    if heap_base == 0 {
        crate::log_error!("boot: no usable region large enough for the heap");
        halt_loop();
    }
    memory::set_total_physical_memory(total_memory);
    memory::heap::init(
        memory::phys_to_virt(heap_base) as usize,
        memory::heap::HEAP_SIZE,
    );

    // Stage 3: identity paging
    let _identity_map = memory::paging::init(total_memory);

    // Adopt the framebuffer early so later stages can draw
    if let Some(response) = FRAMEBUFFER_REQUEST.get_response() {
        if let Some(fb) = response.framebuffers().next() {
            graphics::framebuffer::init(
                fb.addr() as *mut u32,
                fb.width() as u32,
                fb.height() as u32,
                fb.pitch() as u32,
                fb.bpp(),
            );
        }
    }

    // Stage 4: PCI enumeration
    pci::init();

    // Stage 5-7: storage
    drivers::ata::init();
    drivers::partition::init();
    // Stage 8: root filesystem
    mount_root();

    // Stage 9: input + GUI
    keyboard::init();
    mouse::init();
    graphics::cursor::init();
    gui::window::init();

    // Stage 10: NIC + network stack
    if drivers::e1000::init() {
        netstack::init();
    }

    interrupts::enable();
    crate::log!("boot: bring-up complete");

    // The cooperative main loop: drain the NIC, apply mouse movement,
    // consume keys, composite.
    loop {
        netstack::poll();
        mouse::poll();
        // No shell yet: decoded keys are dropped on the floor
        while keyboard::read_char().is_some() {}
        gui::window::render();
        core::hint::spin_loop();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::log_error!("KERNEL PANIC: {}", info);
    halt_loop();
}
