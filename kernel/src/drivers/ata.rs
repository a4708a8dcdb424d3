//! ATA PIO driver
//!
//! Legacy IDE channels at 0x1F0/0x3F6 (IRQ 14) and 0x170/0x376 (IRQ 15),
//! up to two drives each. Transfers use 28-bit LBA PIO with bounded status
//! polling; the IRQ handlers only acknowledge the controller and set a
//! flag. A floating bus reading 0xFF means no drive and fails the call
//! before any register is touched.

use alloc::string::String;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use x86_64::instructions::port::Port;

use super::DiskError;

/// ATA commands
mod cmd {
    pub const READ_SECTORS: u8 = 0x20;
    pub const WRITE_SECTORS: u8 = 0x30;
    pub const CACHE_FLUSH: u8 = 0xE7;
    pub const IDENTIFY: u8 = 0xEC;
}

/// Status register bits
mod status {
    pub const ERR: u8 = 1 << 0;
    pub const DRQ: u8 = 1 << 3;
    pub const DF: u8 = 1 << 5;
    pub const BSY: u8 = 1 << 7;
}

const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CONTROL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CONTROL: u16 = 0x376;

pub const PRIMARY_IRQ: u8 = 14;
pub const SECONDARY_IRQ: u8 = 15;

/// Bounded polling budget for status transitions
const WAIT_ITERATIONS: u32 = 100_000;

/// Drive numbering: 0/1 primary master/follower, 2/3 secondary
pub const MAX_DRIVES: u8 = 4;

/// One ATA channel. The atomics are written from the IRQ handler and read
/// by polling code; nothing else is shared with interrupt context.
pub struct AtaChannel {
    io_base: u16,
    control_base: u16,
    pub irq: u8,
    pub last_status: AtomicU8,
    pub last_error: AtomicU8,
    pub irq_fired: AtomicBool,
}

impl AtaChannel {
    const fn new(io_base: u16, control_base: u16, irq: u8) -> Self {
        Self {
            io_base,
            control_base,
            irq,
            last_status: AtomicU8::new(0),
            last_error: AtomicU8::new(0),
            irq_fired: AtomicBool::new(false),
        }
    }

    fn read_status(&self) -> u8 {
        unsafe { Port::<u8>::new(self.io_base + 7).read() }
    }

    /// Wait for BSY to clear. Detects a floating bus (0xFF) up front.
    fn wait_not_busy(&self) -> Result<u8, DiskError> {
        for _ in 0..WAIT_ITERATIONS {
            let st = self.read_status();
            if st == 0xFF {
                return Err(DiskError::NoDevice);
            }
            if st & status::BSY == 0 {
                if st & status::ERR != 0 {
                    return Err(DiskError::DeviceError);
                }
                if st & status::DF != 0 {
                    return Err(DiskError::DeviceFault);
                }
                return Ok(st);
            }
            core::hint::spin_loop();
        }
        Err(DiskError::Timeout)
    }

    /// Wait for BSY=0 and DRQ=1 (data ready)
    fn wait_drq(&self) -> Result<(), DiskError> {
        for _ in 0..WAIT_ITERATIONS {
            let st = self.read_status();
            if st == 0xFF {
                return Err(DiskError::NoDevice);
            }
            if st & status::ERR != 0 {
                return Err(DiskError::DeviceError);
            }
            if st & status::DF != 0 {
                return Err(DiskError::DeviceFault);
            }
            if st & status::BSY == 0 && st & status::DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(DiskError::Timeout)
    }

    /// Select a drive and give the channel the classic 400ns settle time
    fn select_drive(&self, slave: bool, lba_high_nibble: u8) {
        unsafe {
            Port::<u8>::new(self.io_base + 6)
                .write(0xE0 | ((slave as u8) << 4) | (lba_high_nibble & 0x0F));
            for _ in 0..4 {
                let _ = Port::<u8>::new(self.control_base).read();
            }
        }
    }

    fn soft_reset(&self) {
        unsafe {
            let mut control = Port::<u8>::new(self.control_base);
            control.write(0x04);
            for _ in 0..1000 {
                core::hint::spin_loop();
            }
            control.write(0x00);
            for _ in 0..10_000 {
                core::hint::spin_loop();
            }
        }
    }

    /// IRQ acknowledgment: reading the status register clears the
    /// controller's interrupt condition.
    fn handle_interrupt(&self) {
        let st = self.read_status();
        self.last_status.store(st, Ordering::Relaxed);
        if st & status::ERR != 0 {
            let err = unsafe { Port::<u8>::new(self.io_base + 1).read() };
            self.last_error.store(err, Ordering::Relaxed);
        }
        self.irq_fired.store(true, Ordering::Release);
    }
}

static PRIMARY: AtaChannel = AtaChannel::new(PRIMARY_IO, PRIMARY_CONTROL, PRIMARY_IRQ);
static SECONDARY: AtaChannel = AtaChannel::new(SECONDARY_IO, SECONDARY_CONTROL, SECONDARY_IRQ);

fn channel_for_drive(drive: u8) -> Result<(&'static AtaChannel, bool), DiskError> {
    match drive {
        0 => Ok((&PRIMARY, false)),
        1 => Ok((&PRIMARY, true)),
        2 => Ok((&SECONDARY, false)),
        3 => Ok((&SECONDARY, true)),
        _ => Err(DiskError::NoDevice),
    }
}

fn primary_irq() {
    PRIMARY.handle_interrupt();
}

fn secondary_irq() {
    SECONDARY.handle_interrupt();
}

/// Reset both channels and claim IRQ 14/15
pub fn init() {
    PRIMARY.soft_reset();
    SECONDARY.soft_reset();

    crate::interrupts::register_irq_handler(PRIMARY_IRQ, primary_irq);
    crate::interrupts::register_irq_handler(SECONDARY_IRQ, secondary_irq);
    crate::interrupts::unmask_irq(PRIMARY_IRQ);
    crate::interrupts::unmask_irq(SECONDARY_IRQ);

    crate::log!("ata: channels reset, IRQ {}/{} claimed", PRIMARY_IRQ, SECONDARY_IRQ);

    for drive in 0..MAX_DRIVES {
        match identify(drive) {
            Ok(info) => {
                crate::log!(
                    "ata: drive {}: {} ({} sectors{})",
                    drive,
                    info.model,
                    info.sector_count,
                    if info.lba48 { ", LBA48" } else { "" }
                );
            }
            Err(DiskError::NoDevice) => {}
            Err(e) => crate::log_debug!("ata: drive {} identify failed: {:?}", drive, e),
        }
    }
}

/// Program the taskfile for a 28-bit LBA transfer
fn setup_transfer(
    channel: &AtaChannel,
    slave: bool,
    lba: u32,
    count: u8,
) -> Result<(), DiskError> {
    if lba >= 1 << 28 {
        return Err(DiskError::OutOfBounds);
    }

    channel.select_drive(slave, (lba >> 24) as u8);
    channel.wait_not_busy()?;

    unsafe {
        Port::<u8>::new(channel.io_base + 2).write(count);
        Port::<u8>::new(channel.io_base + 3).write(lba as u8);
        Port::<u8>::new(channel.io_base + 4).write((lba >> 8) as u8);
        Port::<u8>::new(channel.io_base + 5).write((lba >> 16) as u8);
    }
    Ok(())
}

/// Read `count` sectors starting at `lba` into `buffer`
pub fn read_sectors(drive: u8, lba: u32, count: u8, buffer: &mut [u8]) -> Result<(), DiskError> {
    let (channel, slave) = channel_for_drive(drive)?;
    if count == 0 {
        return Ok(());
    }
    if buffer.len() < count as usize * 512 {
        return Err(DiskError::BufferTooSmall);
    }

    setup_transfer(channel, slave, lba, count)?;
    unsafe {
        Port::<u8>::new(channel.io_base + 7).write(cmd::READ_SECTORS);
    }

    let mut data_port = Port::<u16>::new(channel.io_base);
    let mut offset = 0;
    for _ in 0..count {
        channel.wait_drq()?;
        for _ in 0..256 {
            let word = unsafe { data_port.read() };
            buffer[offset] = word as u8;
            buffer[offset + 1] = (word >> 8) as u8;
            offset += 2;
        }
    }
    Ok(())
}

/// Write `count` sectors starting at `lba`, then flush the drive cache
pub fn write_sectors(drive: u8, lba: u32, count: u8, buffer: &[u8]) -> Result<(), DiskError> {
    let (channel, slave) = channel_for_drive(drive)?;
    if count == 0 {
        return Ok(());
    }
    if buffer.len() < count as usize * 512 {
        return Err(DiskError::BufferTooSmall);
    }

    setup_transfer(channel, slave, lba, count)?;
    unsafe {
        Port::<u8>::new(channel.io_base + 7).write(cmd::WRITE_SECTORS);
    }

    let mut data_port = Port::<u16>::new(channel.io_base);
    let mut offset = 0;
    for _ in 0..count {
        channel.wait_drq()?;
        for _ in 0..256 {
            let word = (buffer[offset] as u16) | ((buffer[offset + 1] as u16) << 8);
            unsafe { data_port.write(word) };
            offset += 2;
        }
    }

    unsafe {
        Port::<u8>::new(channel.io_base + 7).write(cmd::CACHE_FLUSH);
    }
    channel.wait_not_busy()?;
    Ok(())
}

/// Convenience single-sector wrappers used by the block-device layer
pub fn read_sector(drive: u8, lba: u32, buffer: &mut [u8]) -> Result<(), DiskError> {
    read_sectors(drive, lba, 1, buffer)
}

pub fn write_sector(drive: u8, lba: u32, buffer: &[u8]) -> Result<(), DiskError> {
    write_sectors(drive, lba, 1, buffer)
}

/// Parsed IDENTIFY data
#[derive(Debug, Clone)]
pub struct DriveInfo {
    pub model: String,
    pub serial: String,
    pub lba48: bool,
    pub sector_count: u64,
}

impl DriveInfo {
    /// Decode the interesting words of an IDENTIFY block. ATA strings are
    /// stored byte-swapped within each word.
    pub fn from_identify(data: &[u16; 256]) -> Self {
        let lba48 = data[83] & (1 << 10) != 0;

        let sector_count = if lba48 {
            (data[100] as u64)
                | ((data[101] as u64) << 16)
                | ((data[102] as u64) << 32)
                | ((data[103] as u64) << 48)
        } else {
            (data[60] as u64) | ((data[61] as u64) << 16)
        };

        DriveInfo {
            model: ata_string(&data[27..47]),
            serial: ata_string(&data[10..20]),
            lba48,
            sector_count,
        }
    }
}

fn ata_string(words: &[u16]) -> String {
    let mut s = String::new();
    for &word in words {
        for byte in [(word >> 8) as u8, word as u8] {
            if byte > 0x20 && byte < 0x7F {
                s.push(byte as char);
            } else if byte == 0x20 {
                s.push(' ');
            }
        }
    }
    String::from(s.trim_end())
}

/// Issue IDENTIFY and parse the 512-byte response
pub fn identify(drive: u8) -> Result<DriveInfo, DiskError> {
    let (channel, slave) = channel_for_drive(drive)?;

    channel.select_drive(slave, 0);
    unsafe {
        Port::<u8>::new(channel.io_base + 2).write(0);
        Port::<u8>::new(channel.io_base + 3).write(0);
        Port::<u8>::new(channel.io_base + 4).write(0);
        Port::<u8>::new(channel.io_base + 5).write(0);
        Port::<u8>::new(channel.io_base + 7).write(cmd::IDENTIFY);
    }

    let st = channel.read_status();
    if st == 0 || st == 0xFF {
        return Err(DiskError::NoDevice);
    }

    channel.wait_not_busy()?;
    channel.wait_drq()?;

    let mut data = [0u16; 256];
    let mut data_port = Port::<u16>::new(channel.io_base);
    for word in data.iter_mut() {
        *word = unsafe { data_port.read() };
    }

    Ok(DriveInfo::from_identify(&data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_block(model: &str, lba48: bool, sectors: u64) -> [u16; 256] {
        let mut data = [0u16; 256];
        let bytes = model.as_bytes();
        for i in 0..20 {
            let hi = *bytes.get(i * 2).unwrap_or(&b' ');
            let lo = *bytes.get(i * 2 + 1).unwrap_or(&b' ');
            data[27 + i] = ((hi as u16) << 8) | lo as u16;
        }
        if lba48 {
            data[83] = 1 << 10;
            data[100] = sectors as u16;
            data[101] = (sectors >> 16) as u16;
            data[102] = (sectors >> 32) as u16;
            data[103] = (sectors >> 48) as u16;
        } else {
            data[60] = sectors as u16;
            data[61] = (sectors >> 16) as u16;
        }
        data
    }

    #[test]
    fn identify_parses_lba28_sector_count() {
        crate::memory::heap::test_support::init_test_heap();
        let info = DriveInfo::from_identify(&identify_block("QEMU HARDDISK", false, 204800));
        assert_eq!(info.sector_count, 204800);
        assert!(!info.lba48);
        assert_eq!(info.model, "QEMU HARDDISK");
    }

    #[test]
    fn identify_parses_lba48_sector_count() {
        crate::memory::heap::test_support::init_test_heap();
        let sectors = 1u64 << 33;
        let info = DriveInfo::from_identify(&identify_block("BIGDISK", true, sectors));
        assert!(info.lba48);
        assert_eq!(info.sector_count, sectors);
    }

    #[test]
    fn lba_past_28_bits_is_rejected() {
        assert!(matches!(
            setup_transfer(&PRIMARY, false, 1 << 28, 1),
            Err(DiskError::OutOfBounds)
        ));
    }
}
