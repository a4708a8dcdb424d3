//! Interrupt handling subsystem
//!
//! Owns the IDT, the 8259 remap and the per-line IRQ dispatch table.
//! Exceptions land on named handlers; every hardware vector is populated
//! before the table is loaded, so a spurious line can never hit a missing
//! gate.

mod handlers;
pub mod pic;

pub use handlers::register_irq_handler;

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;

lazy_static! {
    /// Interrupt Descriptor Table. Every vector is populated: named CPU
    /// exception handlers, the 16 PIC-range IRQ stubs at 0x20..0x2F, and a
    /// default stub everywhere else.
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(handlers::divide_error_handler);
        idt.breakpoint.set_handler_fn(handlers::breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(handlers::invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(handlers::general_protection_fault_handler);
        idt.page_fault.set_handler_fn(handlers::page_fault_handler);
        idt.double_fault.set_handler_fn(handlers::double_fault_handler);

        // PIC range: IRQ 0-7 on the master, 8-15 on the follower
        idt[(pic::PIC1_OFFSET + 0) as usize].set_handler_fn(handlers::irq0_handler);
        idt[(pic::PIC1_OFFSET + 1) as usize].set_handler_fn(handlers::irq1_handler);
        idt[(pic::PIC1_OFFSET + 2) as usize].set_handler_fn(handlers::irq2_handler);
        idt[(pic::PIC1_OFFSET + 3) as usize].set_handler_fn(handlers::irq3_handler);
        idt[(pic::PIC1_OFFSET + 4) as usize].set_handler_fn(handlers::irq4_handler);
        idt[(pic::PIC1_OFFSET + 5) as usize].set_handler_fn(handlers::irq5_handler);
        idt[(pic::PIC1_OFFSET + 6) as usize].set_handler_fn(handlers::irq6_handler);
        idt[(pic::PIC1_OFFSET + 7) as usize].set_handler_fn(handlers::irq7_handler);
        idt[(pic::PIC2_OFFSET + 0) as usize].set_handler_fn(handlers::irq8_handler);
        idt[(pic::PIC2_OFFSET + 1) as usize].set_handler_fn(handlers::irq9_handler);
        idt[(pic::PIC2_OFFSET + 2) as usize].set_handler_fn(handlers::irq10_handler);
        idt[(pic::PIC2_OFFSET + 3) as usize].set_handler_fn(handlers::irq11_handler);
        idt[(pic::PIC2_OFFSET + 4) as usize].set_handler_fn(handlers::irq12_handler);
        idt[(pic::PIC2_OFFSET + 5) as usize].set_handler_fn(handlers::irq13_handler);
        idt[(pic::PIC2_OFFSET + 6) as usize].set_handler_fn(handlers::irq14_handler);
        idt[(pic::PIC2_OFFSET + 7) as usize].set_handler_fn(handlers::irq15_handler);

        // Everything else gets a present default stub
        for vector in 0x30..=0xFF_usize {
            idt[vector].set_handler_fn(handlers::default_handler);
        }

        idt
    };
}

/// Load the IDT, remap the PICs to 0x20/0x28 and mask every line. Drivers
/// unmask their own lines as they come up. Interrupts stay disabled until
/// `enable()` is called at the end of bring-up.
pub fn init() {
    IDT.load();

    unsafe {
        let mut pics = pic::PICS.lock();
        pics.remap(pic::PIC1_OFFSET, pic::PIC2_OFFSET);
        pics.mask_all();
    }

    crate::log!("interrupts: IDT loaded, PIC remapped to {:#x}/{:#x}",
        pic::PIC1_OFFSET, pic::PIC2_OFFSET);
}

/// Unmask an IRQ line on the PICs
pub fn unmask_irq(irq: u8) {
    unsafe {
        pic::PICS.lock().unmask(irq);
    }
}

/// Set the CPU interrupt flag
pub fn enable() {
    x86_64::instructions::interrupts::enable();
}

/// Clear the CPU interrupt flag
pub fn disable() {
    x86_64::instructions::interrupts::disable();
}

/// Run a closure with interrupts disabled
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}
