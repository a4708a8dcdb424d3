//! PCI bus enumeration
//!
//! Legacy configuration-space access through ports 0xCF8/0xCFC. The scan
//! walks bus 0 depth-first, follows PCI-to-PCI bridges onto their
//! secondary buses, and records every live function in a flat table that
//! drivers query by id or class.

use spin::Mutex;
use x86_64::instructions::port::Port;

const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// At most this many recorded functions
pub const MAX_PCI_DEVICES: usize = 64;

/// PCI device classes
pub mod class {
    pub const MASS_STORAGE: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const BRIDGE: u8 = 0x06;
}

/// Bridge subclasses
pub mod bridge {
    pub const PCI_TO_PCI: u8 = 0x04;
}

/// Network subclasses
pub mod network {
    pub const ETHERNET: u8 = 0x00;
}

/// Command register bits
mod command {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// One enumerated function
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub bar: [u32; 6],
}

impl PciDevice {
    pub fn is_multifunction(&self) -> bool {
        self.header_type & 0x80 != 0
    }

    /// Decoded BAR address. Memory BARs mask the low flag bits; a 64-bit
    /// BAR (type 2) takes its high half from the following BAR.
    pub fn bar_address(&self, index: usize) -> Option<u64> {
        if index >= 6 {
            return None;
        }
        let bar = self.bar[index];
        if bar == 0 {
            return None;
        }

        if bar & 1 == 0 {
            // Memory BAR
            match (bar >> 1) & 0x3 {
                0 => Some((bar & 0xFFFF_FFF0) as u64),
                2 if index < 5 => {
                    let high = self.bar[index + 1] as u64;
                    Some((high << 32) | (bar & 0xFFFF_FFF0) as u64)
                }
                _ => None,
            }
        } else {
            // I/O BAR
            Some((bar & 0xFFFF_FFFC) as u64)
        }
    }

    pub fn bar_is_memory(&self, index: usize) -> bool {
        index < 6 && self.bar[index] & 1 == 0
    }

    /// Allow the device to master the bus (DMA)
    pub fn enable_bus_mastering(&self) {
        let cmd = config_read16(self.bus, self.device, self.function, 0x04);
        config_write16(self.bus, self.device, self.function, 0x04, cmd | command::BUS_MASTER);
    }

    /// Enable memory-space decoding
    pub fn enable_memory_space(&self) {
        let cmd = config_read16(self.bus, self.device, self.function, 0x04);
        config_write16(self.bus, self.device, self.function, 0x04, cmd | command::MEMORY_SPACE);
    }

    /// Enable I/O-space decoding
    pub fn enable_io_space(&self) {
        let cmd = config_read16(self.bus, self.device, self.function, 0x04);
        config_write16(self.bus, self.device, self.function, 0x04, cmd | command::IO_SPACE);
    }
}

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    (1u32 << 31)
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | ((offset as u32) & 0xFC)
}

/// 32-bit configuration read
pub fn config_read32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    let mut address_port = Port::<u32>::new(PCI_CONFIG_ADDRESS);
    let mut data_port = Port::<u32>::new(PCI_CONFIG_DATA);
    unsafe {
        address_port.write(config_address(bus, device, function, offset));
        data_port.read()
    }
}

/// 16-bit configuration read
pub fn config_read16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    let dword = config_read32(bus, device, function, offset);
    (dword >> ((offset as u32 & 2) * 8)) as u16
}

/// 8-bit configuration read
pub fn config_read8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    let dword = config_read32(bus, device, function, offset);
    (dword >> ((offset as u32 & 3) * 8)) as u8
}

/// 32-bit configuration write
pub fn config_write32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    let mut address_port = Port::<u32>::new(PCI_CONFIG_ADDRESS);
    let mut data_port = Port::<u32>::new(PCI_CONFIG_DATA);
    unsafe {
        address_port.write(config_address(bus, device, function, offset));
        data_port.write(value);
    }
}

/// 16-bit configuration write (read-modify-write of the containing dword)
pub fn config_write16(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    let shift = (offset as u32 & 2) * 8;
    let dword = config_read32(bus, device, function, offset);
    let dword = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
    config_write32(bus, device, function, offset, dword);
}

/// Enumerated device table
static DEVICES: Mutex<PciTable> = Mutex::new(PciTable::new());

struct PciTable {
    devices: [Option<PciDevice>; MAX_PCI_DEVICES],
    count: usize,
}

impl PciTable {
    const fn new() -> Self {
        Self {
            devices: [None; MAX_PCI_DEVICES],
            count: 0,
        }
    }

    fn push(&mut self, dev: PciDevice) {
        if self.count < MAX_PCI_DEVICES {
            self.devices[self.count] = Some(dev);
            self.count += 1;
        } else {
            crate::log_warn!("pci: device table full, dropping {:04x}:{:04x}",
                dev.vendor_id, dev.device_id);
        }
    }
}

fn read_function(bus: u8, device: u8, function: u8) -> PciDevice {
    let reg0 = config_read32(bus, device, function, 0x00);
    let reg2 = config_read32(bus, device, function, 0x08);
    let reg3 = config_read32(bus, device, function, 0x0C);
    let reg_f = config_read32(bus, device, function, 0x3C);

    let mut bar = [0u32; 6];
    for (i, slot) in bar.iter_mut().enumerate() {
        *slot = config_read32(bus, device, function, 0x10 + (i as u8) * 4);
    }

    PciDevice {
        bus,
        device,
        function,
        vendor_id: reg0 as u16,
        device_id: (reg0 >> 16) as u16,
        revision: reg2 as u8,
        prog_if: (reg2 >> 8) as u8,
        subclass: (reg2 >> 16) as u8,
        class_code: (reg2 >> 24) as u8,
        header_type: (reg3 >> 16) as u8,
        interrupt_line: reg_f as u8,
        interrupt_pin: (reg_f >> 8) as u8,
        bar,
    }
}

fn scan_function(table: &mut PciTable, bus: u8, device: u8, function: u8) {
    let dev = read_function(bus, device, function);
    table.push(dev);

    // Follow PCI-to-PCI bridges onto their secondary bus
    if dev.class_code == class::BRIDGE && dev.subclass == bridge::PCI_TO_PCI {
        let secondary = config_read8(bus, device, function, 0x19);
        scan_bus(table, secondary);
    }
}

fn scan_bus(table: &mut PciTable, bus: u8) {
    for device in 0..32 {
        let vendor = config_read16(bus, device, 0, 0x00);
        if vendor == 0xFFFF {
            continue;
        }

        scan_function(table, bus, device, 0);

        let header_type = config_read8(bus, device, 0, 0x0E);
        if header_type & 0x80 != 0 {
            for function in 1..8 {
                if config_read16(bus, device, function, 0x00) != 0xFFFF {
                    scan_function(table, bus, device, function);
                }
            }
        }
    }
}

/// Enumerate every bus reachable from bus 0
pub fn init() {
    let mut table = DEVICES.lock();
    table.count = 0;
    scan_bus(&mut table, 0);

    crate::log!("pci: {} devices found", table.count);
    for i in 0..table.count {
        if let Some(dev) = table.devices[i] {
            crate::log_debug!(
                "pci: {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x} irq {}",
                dev.bus, dev.device, dev.function,
                dev.vendor_id, dev.device_id,
                dev.class_code, dev.subclass, dev.interrupt_line
            );
        }
    }
}

/// Device by exact vendor/device id
pub fn find_device(vendor_id: u16, device_id: u16) -> Option<PciDevice> {
    let table = DEVICES.lock();
    table.devices[..table.count]
        .iter()
        .flatten()
        .find(|d| d.vendor_id == vendor_id && d.device_id == device_id)
        .copied()
}

/// First device of the given class/subclass
pub fn find_by_class(class_code: u8, subclass: u8) -> Option<PciDevice> {
    let table = DEVICES.lock();
    table.devices[..table.count]
        .iter()
        .flatten()
        .find(|d| d.class_code == class_code && d.subclass == subclass)
        .copied()
}

/// Device at a table index, for iteration
pub fn device_at(index: usize) -> Option<PciDevice> {
    let table = DEVICES.lock();
    if index < table.count {
        table.devices[index]
    } else {
        None
    }
}

/// Number of enumerated devices
pub fn device_count() -> usize {
    DEVICES.lock().count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_with_bars(bar: [u32; 6]) -> PciDevice {
        PciDevice {
            bus: 0,
            device: 3,
            function: 0,
            vendor_id: 0x8086,
            device_id: 0x100E,
            class_code: class::NETWORK,
            subclass: network::ETHERNET,
            prog_if: 0,
            revision: 3,
            header_type: 0,
            interrupt_line: 11,
            interrupt_pin: 1,
            bar,
        }
    }

    #[test]
    fn decodes_32bit_memory_bar() {
        let dev = device_with_bars([0xFEBC_0000, 0, 0, 0, 0, 0]);
        assert_eq!(dev.bar_address(0), Some(0xFEBC_0000));
        assert!(dev.bar_is_memory(0));
    }

    #[test]
    fn decodes_64bit_memory_bar_pair() {
        // Type 2 in bits 2:1 means the next BAR holds the high half
        let dev = device_with_bars([0xC000_0004, 0x0000_0001, 0, 0, 0, 0]);
        assert_eq!(dev.bar_address(0), Some(0x1_C000_0000));
    }

    #[test]
    fn decodes_io_bar() {
        let dev = device_with_bars([0x0000_C001, 0, 0, 0, 0, 0]);
        assert_eq!(dev.bar_address(0), Some(0xC000));
        assert!(!dev.bar_is_memory(0));
    }

    #[test]
    fn empty_bar_is_none() {
        let dev = device_with_bars([0; 6]);
        assert_eq!(dev.bar_address(0), None);
        assert_eq!(dev.bar_address(6), None);
    }

    #[test]
    fn config_address_packs_fields() {
        let addr = config_address(1, 2, 3, 0x3D);
        assert_eq!(addr, (1 << 31) | (1 << 16) | (2 << 11) | (3 << 8) | 0x3C);
    }
}
