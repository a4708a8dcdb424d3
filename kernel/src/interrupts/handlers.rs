//! Exception and IRQ handlers
//!
//! CPU exceptions log the fault and halt (there is no unwind path in ring
//! 0). Hardware IRQs run through a per-line dispatch table so drivers can
//! claim a line at runtime; every PIC-range vector ends with the proper
//! EOI sequence whether or not a handler is registered.

use core::sync::atomic::{AtomicUsize, Ordering};
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

use super::pic::PICS;

/// Per-IRQ-line handlers, installed by drivers. Stored as fn-pointer words
/// so installing a handler while interrupts are enabled is a single atomic
/// store (no tearing).
static IRQ_HANDLERS: [AtomicUsize; 16] = [const { AtomicUsize::new(0) }; 16];

/// Claim an IRQ line. The handler runs in interrupt context and must not
/// allocate.
pub fn register_irq_handler(irq: u8, handler: fn()) {
    IRQ_HANDLERS[irq as usize].store(handler as usize, Ordering::Release);
}

fn dispatch_irq(irq: u8) {
    let raw = IRQ_HANDLERS[irq as usize].load(Ordering::Acquire);
    if raw != 0 {
        let handler: fn() = unsafe { core::mem::transmute(raw) };
        handler();
    }

    unsafe {
        PICS.lock().notify_end_of_interrupt(irq);
    }
}

macro_rules! irq_handler {
    ($name:ident, $irq:expr) => {
        pub extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch_irq($irq);
        }
    };
}

irq_handler!(irq0_handler, 0);
irq_handler!(irq1_handler, 1);
irq_handler!(irq2_handler, 2);
irq_handler!(irq3_handler, 3);
irq_handler!(irq4_handler, 4);
irq_handler!(irq5_handler, 5);
irq_handler!(irq6_handler, 6);
irq_handler!(irq7_handler, 7);
irq_handler!(irq8_handler, 8);
irq_handler!(irq9_handler, 9);
irq_handler!(irq10_handler, 10);
irq_handler!(irq11_handler, 11);
irq_handler!(irq12_handler, 12);
irq_handler!(irq13_handler, 13);
irq_handler!(irq14_handler, 14);
irq_handler!(irq15_handler, 15);

/// Default stub for vectors outside the exception and PIC ranges
pub extern "x86-interrupt" fn default_handler(_frame: InterruptStackFrame) {}

// ---------------------------------------------------------------------------
// CPU exceptions
// ---------------------------------------------------------------------------

pub extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    crate::log_error!("EXCEPTION: divide error\n{:#?}", frame);
    crate::halt_loop();
}

pub extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    crate::log_warn!("EXCEPTION: breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

pub extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    crate::log_error!("EXCEPTION: invalid opcode\n{:#?}", frame);
    crate::halt_loop();
}

pub extern "x86-interrupt" fn general_protection_fault_handler(
    frame: InterruptStackFrame,
    error_code: u64,
) {
    crate::log_error!(
        "EXCEPTION: general protection fault (error {:#x})\n{:#?}",
        error_code,
        frame
    );
    crate::halt_loop();
}

pub extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    crate::log_error!(
        "EXCEPTION: page fault at {:?} ({:?})\n{:#?}",
        Cr2::read(),
        error_code,
        frame
    );
    crate::halt_loop();
}

pub extern "x86-interrupt" fn double_fault_handler(
    frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    crate::log_error!("EXCEPTION: double fault\n{:#?}", frame);
    crate::halt_loop();
}
