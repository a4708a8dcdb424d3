//! PS/2 keyboard
//!
//! The IRQ 1 handler pushes raw scancodes into a 64-entry ring buffer;
//! decoding to characters happens at poll time in the main thread. The
//! ring is single-producer (IRQ) / single-consumer (poll loop) with
//! head/tail indices only ever advanced by their own side.

use core::sync::atomic::{AtomicUsize, Ordering};
use x86_64::instructions::port::Port;

const PS2_DATA: u16 = 0x60;

/// Scancode ring capacity
const RING_SIZE: usize = 64;

pub const KEYBOARD_IRQ: u8 = 1;

struct ScancodeRing {
    buffer: [core::sync::atomic::AtomicU8; RING_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

static RING: ScancodeRing = ScancodeRing {
    buffer: [const { core::sync::atomic::AtomicU8::new(0) }; RING_SIZE],
    head: AtomicUsize::new(0),
    tail: AtomicUsize::new(0),
};

impl ScancodeRing {
    fn push(&self, scancode: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % RING_SIZE;
        if next == self.tail.load(Ordering::Acquire) {
            // Full: drop the newest rather than corrupt the ring
            return;
        }
        self.buffer[head].store(scancode, Ordering::Relaxed);
        self.head.store(next, Ordering::Release);
    }

    fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let scancode = self.buffer[tail].load(Ordering::Relaxed);
        self.tail.store((tail + 1) % RING_SIZE, Ordering::Release);
        Some(scancode)
    }
}

/// IRQ 1: read the scancode to acknowledge the controller, stash it
fn keyboard_irq() {
    let scancode = unsafe { Port::<u8>::new(PS2_DATA).read() };
    RING.push(scancode);
}

/// Claim IRQ 1
pub fn init() {
    crate::interrupts::register_irq_handler(KEYBOARD_IRQ, keyboard_irq);
    crate::interrupts::unmask_irq(KEYBOARD_IRQ);
    crate::log!("keyboard: IRQ {} claimed", KEYBOARD_IRQ);
}

/// Next raw scancode, if any
pub fn pop_scancode() -> Option<u8> {
    RING.pop()
}

/// US QWERTY set-1 make codes to ASCII, unshifted. Break codes and
/// extended prefixes yield `None`.
pub fn scancode_to_ascii(scancode: u8) -> Option<char> {
    const MAP: &[u8; 58] = b"\x00\x1B1234567890-=\x08\tqwertyuiop[]\n\x00asdfghjkl;'`\x00\\zxcvbnm,./\x00*\x00 ";
    if scancode & 0x80 != 0 {
        return None;
    }
    let c = *MAP.get(scancode as usize)?;
    if c == 0 {
        None
    } else {
        Some(c as char)
    }
}

/// Next decoded character, skipping releases and non-printables
pub fn read_char() -> Option<char> {
    while let Some(scancode) = pop_scancode() {
        if let Some(c) = scancode_to_ascii(scancode) {
            return Some(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo() {
        // The static ring is shared; drain anything left behind first
        while RING.pop().is_some() {}
        RING.push(0x1E);
        RING.push(0x30);
        RING.push(0x2E);
        assert_eq!(RING.pop(), Some(0x1E));
        assert_eq!(RING.pop(), Some(0x30));
        assert_eq!(RING.pop(), Some(0x2E));
        assert_eq!(RING.pop(), None);
    }

    #[test]
    fn decodes_letters_and_ignores_breaks() {
        assert_eq!(scancode_to_ascii(0x1E), Some('a'));
        assert_eq!(scancode_to_ascii(0x30), Some('b'));
        assert_eq!(scancode_to_ascii(0x39), Some(' '));
        assert_eq!(scancode_to_ascii(0x1C), Some('\n'));
        // Break code (bit 7) is not a character
        assert_eq!(scancode_to_ascii(0x9E), None);
    }
}
