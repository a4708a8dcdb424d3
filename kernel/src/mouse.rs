//! PS/2 mouse
//!
//! The IRQ 12 handler assembles the three-byte PS/2 packets into pending
//! deltas held in atomics; the main loop's `poll()` turns those into
//! cursor movement and window-manager events. Nothing in the IRQ path
//! locks or allocates.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use x86_64::instructions::port::Port;

const PS2_DATA: u16 = 0x60;
const PS2_STATUS: u16 = 0x64;
const PS2_COMMAND: u16 = 0x64;

pub const MOUSE_IRQ: u8 = 12;

// Packet assembly state, IRQ-side only
static PACKET_INDEX: AtomicU8 = AtomicU8::new(0);
static PACKET_BYTE0: AtomicU8 = AtomicU8::new(0);
static PACKET_BYTE1: AtomicU8 = AtomicU8::new(0);

// Pending state, consumed by poll()
static PENDING_DX: AtomicI32 = AtomicI32::new(0);
static PENDING_DY: AtomicI32 = AtomicI32::new(0);
static BUTTONS: AtomicU8 = AtomicU8::new(0);
static MOVED: AtomicBool = AtomicBool::new(false);

// Cursor position, owned by the main thread
static MOUSE_X: AtomicI32 = AtomicI32::new(0);
static MOUSE_Y: AtomicI32 = AtomicI32::new(0);

fn wait_write() {
    let mut status = Port::<u8>::new(PS2_STATUS);
    for _ in 0..100_000 {
        if unsafe { status.read() } & 0x02 == 0 {
            return;
        }
        core::hint::spin_loop();
    }
}

fn wait_read() {
    let mut status = Port::<u8>::new(PS2_STATUS);
    for _ in 0..100_000 {
        if unsafe { status.read() } & 0x01 != 0 {
            return;
        }
        core::hint::spin_loop();
    }
}

/// Send a byte to the mouse (via the 0xD4 controller prefix) and eat the
/// ACK
fn mouse_write(data: u8) {
    unsafe {
        wait_write();
        Port::<u8>::new(PS2_COMMAND).write(0xD4);
        wait_write();
        Port::<u8>::new(PS2_DATA).write(data);
        wait_read();
        let _ = Port::<u8>::new(PS2_DATA).read();
    }
}

/// IRQ 12: collect one packet byte; on the third, fold the packet into
/// the pending deltas
fn mouse_irq() {
    let byte = unsafe { Port::<u8>::new(PS2_DATA).read() };

    match PACKET_INDEX.load(Ordering::Relaxed) {
        0 => {
            // Bit 3 is always set in the first packet byte; anything else
            // means we are out of sync
            if byte & 0x08 == 0 {
                return;
            }
            PACKET_BYTE0.store(byte, Ordering::Relaxed);
            PACKET_INDEX.store(1, Ordering::Relaxed);
        }
        1 => {
            PACKET_BYTE1.store(byte, Ordering::Relaxed);
            PACKET_INDEX.store(2, Ordering::Relaxed);
        }
        _ => {
            PACKET_INDEX.store(0, Ordering::Relaxed);
            let b0 = PACKET_BYTE0.load(Ordering::Relaxed);
            let b1 = PACKET_BYTE1.load(Ordering::Relaxed);
            let b2 = byte;

            let mut dx = b1 as i32;
            let mut dy = b2 as i32;
            if b0 & 0x10 != 0 {
                dx -= 256;
            }
            if b0 & 0x20 != 0 {
                dy -= 256;
            }

            PENDING_DX.fetch_add(dx, Ordering::Relaxed);
            // PS/2 y grows upward, the screen grows downward
            PENDING_DY.fetch_add(-dy, Ordering::Relaxed);
            BUTTONS.store(b0 & 0x07, Ordering::Relaxed);
            MOVED.store(true, Ordering::Release);
        }
    }
}

/// Enable the auxiliary device and streaming reports, claim IRQ 12
pub fn init() {
    unsafe {
        // Enable the aux port and its interrupt in the controller config
        wait_write();
        Port::<u8>::new(PS2_COMMAND).write(0xA8);
        wait_write();
        Port::<u8>::new(PS2_COMMAND).write(0x20);
        wait_read();
        let config = Port::<u8>::new(PS2_DATA).read() | 0x02;
        wait_write();
        Port::<u8>::new(PS2_COMMAND).write(0x60);
        wait_write();
        Port::<u8>::new(PS2_DATA).write(config);
    }

    mouse_write(0xF6); // defaults
    mouse_write(0xF4); // enable reporting

    if let Some((w, h)) = crate::graphics::framebuffer::screen_size() {
        MOUSE_X.store(w as i32 / 2, Ordering::Relaxed);
        MOUSE_Y.store(h as i32 / 2, Ordering::Relaxed);
    }

    crate::interrupts::register_irq_handler(MOUSE_IRQ, mouse_irq);
    crate::interrupts::unmask_irq(MOUSE_IRQ);
    crate::log!("mouse: IRQ {} claimed", MOUSE_IRQ);
}

/// Current position
pub fn position() -> (i32, i32) {
    (MOUSE_X.load(Ordering::Relaxed), MOUSE_Y.load(Ordering::Relaxed))
}

/// Current button state (bit 0 left, 1 right, 2 middle)
pub fn buttons() -> u8 {
    BUTTONS.load(Ordering::Relaxed)
}

/// Apply pending packets: move the cursor and feed the window manager.
/// Called from the main loop, never from interrupt context.
pub fn poll() {
    if !MOVED.swap(false, Ordering::Acquire) {
        return;
    }

    let dx = PENDING_DX.swap(0, Ordering::Relaxed);
    let dy = PENDING_DY.swap(0, Ordering::Relaxed);

    let (max_x, max_y) = crate::graphics::framebuffer::screen_size()
        .map(|(w, h)| (w as i32 - 1, h as i32 - 1))
        .unwrap_or((0, 0));

    let x = (MOUSE_X.load(Ordering::Relaxed) + dx).clamp(0, max_x);
    let y = (MOUSE_Y.load(Ordering::Relaxed) + dy).clamp(0, max_y);
    MOUSE_X.store(x, Ordering::Relaxed);
    MOUSE_Y.store(y, Ordering::Relaxed);

    crate::graphics::cursor::move_to(x, y);
    crate::gui::window::handle_mouse(x, y, buttons());
}
