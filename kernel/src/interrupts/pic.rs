//! Programmable Interrupt Controller (8259 pair)
//!
//! Remaps the legacy PICs away from the exception range and owns the EOI
//! discipline: an IRQ at or above the follower offset must acknowledge the
//! follower BEFORE the master, or every later follower interrupt wedges.

use spin::Mutex;
use x86_64::instructions::port::Port;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const PIC_EOI: u8 = 0x20;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

/// Master PIC vector offset (IRQ 0-7 -> 0x20-0x27)
pub const PIC1_OFFSET: u8 = 0x20;
/// Follower PIC vector offset (IRQ 8-15 -> 0x28-0x2F)
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

/// IDT vector an IRQ line lands on after the remap
pub fn vector_for_irq(irq: u8, offset_master: u8, offset_follower: u8) -> u8 {
    if irq < 8 {
        offset_master + irq
    } else {
        offset_follower + (irq - 8)
    }
}

/// Chained 8259 pair
pub struct ChainedPics {
    master_command: Port<u8>,
    master_data: Port<u8>,
    follower_command: Port<u8>,
    follower_data: Port<u8>,
    offset_master: u8,
    offset_follower: u8,
}

impl ChainedPics {
    pub const fn new() -> Self {
        Self {
            master_command: Port::new(PIC1_COMMAND),
            master_data: Port::new(PIC1_DATA),
            follower_command: Port::new(PIC2_COMMAND),
            follower_data: Port::new(PIC2_DATA),
            offset_master: PIC1_OFFSET,
            offset_follower: PIC2_OFFSET,
        }
    }

    /// Reprogram both PICs to the given vector offsets. The pre-existing
    /// IRQ masks are saved and restored, so the remap is side-effect-free
    /// on which lines are enabled.
    pub unsafe fn remap(&mut self, offset_master: u8, offset_follower: u8) {
        let saved_master = self.master_data.read();
        let saved_follower = self.follower_data.read();

        // ICW1: start initialization sequence
        self.master_command.write(ICW1_INIT | ICW1_ICW4);
        io_wait();
        self.follower_command.write(ICW1_INIT | ICW1_ICW4);
        io_wait();

        // ICW2: vector offsets
        self.master_data.write(offset_master);
        io_wait();
        self.follower_data.write(offset_follower);
        io_wait();

        // ICW3: follower on master line 2, cascade identity 2
        self.master_data.write(4);
        io_wait();
        self.follower_data.write(2);
        io_wait();

        // ICW4: 8086 mode
        self.master_data.write(ICW4_8086);
        io_wait();
        self.follower_data.write(ICW4_8086);
        io_wait();

        self.master_data.write(saved_master);
        self.follower_data.write(saved_follower);

        self.offset_master = offset_master;
        self.offset_follower = offset_follower;
    }

    /// Mask every IRQ line on both PICs
    pub unsafe fn mask_all(&mut self) {
        self.master_data.write(0xFF);
        self.follower_data.write(0xFF);
    }

    /// Unmask a single IRQ line. Unmasking any follower line also opens
    /// the cascade (IRQ 2) on the master.
    pub unsafe fn unmask(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask & !(1 << irq));
        } else {
            let mask = self.follower_data.read();
            self.follower_data.write(mask & !(1 << (irq - 8)));
            let cascade = self.master_data.read();
            self.master_data.write(cascade & !(1 << 2));
        }
    }

    /// Mask a single IRQ line
    pub unsafe fn mask(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask | (1 << irq));
        } else {
            let mask = self.follower_data.read();
            self.follower_data.write(mask | (1 << (irq - 8)));
        }
    }

    /// Acknowledge the end of an interrupt. For IRQ >= 8 the follower is
    /// acknowledged first, then the master.
    pub unsafe fn notify_end_of_interrupt(&mut self, irq: u8) {
        if irq >= 8 {
            self.follower_command.write(PIC_EOI);
        }
        self.master_command.write(PIC_EOI);
    }

    pub fn offsets(&self) -> (u8, u8) {
        (self.offset_master, self.offset_follower)
    }
}

/// Dummy write to port 0x80, giving the PICs time between ICWs
unsafe fn io_wait() {
    Port::<u8>::new(0x80).write(0);
}

/// Global PIC pair
pub static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_vectors_follow_the_remap_offsets() {
        for irq in 0..16u8 {
            let v = vector_for_irq(irq, PIC1_OFFSET, PIC2_OFFSET);
            if irq < 8 {
                assert_eq!(v, PIC1_OFFSET + irq);
            } else {
                assert_eq!(v, PIC2_OFFSET + irq - 8);
            }
        }
        // Arbitrary offsets keep the same shape
        assert_eq!(vector_for_irq(3, 0x40, 0x48), 0x43);
        assert_eq!(vector_for_irq(12, 0x40, 0x48), 0x4C);
    }
}
