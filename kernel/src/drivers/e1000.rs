//! Intel e1000 network driver
//!
//! Targets the 82540EM family that QEMU and most hypervisors emulate.
//! MMIO register access through BAR0 (reachable through the identity
//! map), legacy-format descriptor rings (32 RX / 32 TX, 128-byte
//! aligned, 2 KiB buffers), polled receive path. Ring and buffer
//! pointers are translated to physical addresses before the device
//! sees them.

use alloc::vec::Vec;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::memory::{heap, virt_to_phys};
use crate::netstack::NetError;
use crate::pci::{self, PciDevice};

// Registers
const REG_CTRL: u32 = 0x0000;
const REG_STATUS: u32 = 0x0008;
const REG_EERD: u32 = 0x0014;
const REG_ICR: u32 = 0x00C0;
const REG_IMS: u32 = 0x00D0;
const REG_IMC: u32 = 0x00D8;
const REG_RCTL: u32 = 0x0100;
const REG_TCTL: u32 = 0x0400;
const REG_TIPG: u32 = 0x0410;
const REG_RDBAL: u32 = 0x2800;
const REG_RDBAH: u32 = 0x2804;
const REG_RDLEN: u32 = 0x2808;
const REG_RDH: u32 = 0x2810;
const REG_RDT: u32 = 0x2818;
const REG_TDBAL: u32 = 0x3800;
const REG_TDBAH: u32 = 0x3804;
const REG_TDLEN: u32 = 0x3808;
const REG_TDH: u32 = 0x3810;
const REG_TDT: u32 = 0x3818;
const REG_MTA: u32 = 0x5200;
const REG_RAL0: u32 = 0x5400;
const REG_RAH0: u32 = 0x5404;

// Control register bits
const CTRL_SLU: u32 = 1 << 6;
const CTRL_RST: u32 = 1 << 26;

// Status register bits
const STATUS_LU: u32 = 1 << 1;

// Receive control
const RCTL_EN: u32 = 1 << 1;
const RCTL_BAM: u32 = 1 << 15;
const RCTL_BSIZE_2048: u32 = 0 << 16;
const RCTL_SECRC: u32 = 1 << 26;

// Transmit control
const TCTL_EN: u32 = 1 << 1;
const TCTL_PSP: u32 = 1 << 3;
const TCTL_CT_SHIFT: u32 = 4;
const TCTL_COLD_SHIFT: u32 = 12;

// TX descriptor command / status bits
const TXD_CMD_EOP: u8 = 1 << 0;
const TXD_CMD_IFCS: u8 = 1 << 1;
const TXD_CMD_RS: u8 = 1 << 3;
const TXD_STAT_DD: u8 = 1 << 0;

// RX descriptor status bits
const RXD_STAT_DD: u8 = 1 << 0;

// Interrupt causes
const ICR_LSC: u32 = 1 << 2;
const ICR_RXT0: u32 = 1 << 7;

/// Ring geometry
const NUM_RX_DESC: usize = 32;
const NUM_TX_DESC: usize = 32;
const BUFFER_SIZE: usize = 2048;
const RING_ALIGN: usize = 128;

/// Supported (vendor, device) pairs; QEMU's default is 0x100E
const SUPPORTED_IDS: [(u16, u16); 3] = [(0x8086, 0x100E), (0x8086, 0x100F), (0x8086, 0x10D3)];

/// Legacy receive descriptor
#[repr(C)]
#[derive(Clone, Copy)]
struct RxDesc {
    addr: u64,
    length: u16,
    checksum: u16,
    status: u8,
    errors: u8,
    special: u16,
}

/// Legacy transmit descriptor
#[repr(C)]
#[derive(Clone, Copy)]
struct TxDesc {
    addr: u64,
    length: u16,
    cso: u8,
    cmd: u8,
    status: u8,
    css: u8,
    special: u16,
}

pub struct E1000 {
    mmio_base: u64,
    mac: [u8; 6],
    rx_descs: *mut RxDesc,
    tx_descs: *mut TxDesc,
    rx_buffers: [*mut u8; NUM_RX_DESC],
    tx_buffers: [*mut u8; NUM_TX_DESC],
    rx_cur: usize,
    tx_cur: usize,
}

unsafe impl Send for E1000 {}

impl E1000 {
    fn read_reg(&self, offset: u32) -> u32 {
        unsafe { read_volatile((self.mmio_base + offset as u64) as *const u32) }
    }

    fn write_reg(&self, offset: u32, value: u32) {
        unsafe { write_volatile((self.mmio_base + offset as u64) as *mut u32, value) }
    }

    /// Full device reset: mask interrupts, assert RST, wait for it to
    /// self-clear, mask again and drain any latched cause.
    fn reset(&self) {
        self.write_reg(REG_IMC, 0xFFFF_FFFF);

        let ctrl = self.read_reg(REG_CTRL);
        self.write_reg(REG_CTRL, ctrl | CTRL_RST);
        for _ in 0..100_000 {
            if self.read_reg(REG_CTRL) & CTRL_RST == 0 {
                break;
            }
            core::hint::spin_loop();
        }

        self.write_reg(REG_IMC, 0xFFFF_FFFF);
        let _ = self.read_reg(REG_ICR);
    }

    fn read_eeprom(&self, addr: u8) -> Option<u16> {
        self.write_reg(REG_EERD, 1 | ((addr as u32) << 8));
        for _ in 0..1000 {
            let eerd = self.read_reg(REG_EERD);
            if eerd & (1 << 4) != 0 {
                return Some((eerd >> 16) as u16);
            }
            core::hint::spin_loop();
        }
        None
    }

    /// MAC from EEPROM words 0..2, falling back to RAL/RAH
    fn read_mac(&mut self) {
        let mut from_eeprom = true;
        for i in 0..3 {
            match self.read_eeprom(i as u8) {
                Some(word) => {
                    self.mac[i * 2] = word as u8;
                    self.mac[i * 2 + 1] = (word >> 8) as u8;
                }
                None => {
                    from_eeprom = false;
                    break;
                }
            }
        }

        if !from_eeprom || self.mac == [0; 6] {
            let ral = self.read_reg(REG_RAL0);
            let rah = self.read_reg(REG_RAH0);
            self.mac = [
                ral as u8,
                (ral >> 8) as u8,
                (ral >> 16) as u8,
                (ral >> 24) as u8,
                rah as u8,
                (rah >> 8) as u8,
            ];
        }
    }

    fn init_rx(&mut self) -> Result<(), NetError> {
        let ring = heap::alloc_aligned(NUM_RX_DESC * core::mem::size_of::<RxDesc>(), RING_ALIGN)
            .ok_or(NetError::OutOfMemory)?;
        self.rx_descs = ring.as_ptr() as *mut RxDesc;

        for i in 0..NUM_RX_DESC {
            let buffer = heap::alloc_aligned(BUFFER_SIZE, 16).ok_or(NetError::OutOfMemory)?;
            self.rx_buffers[i] = buffer.as_ptr();
            unsafe {
                write_volatile(
                    self.rx_descs.add(i),
                    RxDesc {
                        addr: virt_to_phys(buffer.addr() as u64),
                        length: 0,
                        checksum: 0,
                        status: 0,
                        errors: 0,
                        special: 0,
                    },
                );
            }
        }

        let ring_addr = virt_to_phys(self.rx_descs as u64);
        self.write_reg(REG_RDBAL, ring_addr as u32);
        self.write_reg(REG_RDBAH, (ring_addr >> 32) as u32);
        self.write_reg(REG_RDLEN, (NUM_RX_DESC * core::mem::size_of::<RxDesc>()) as u32);
        self.write_reg(REG_RDH, 0);
        self.write_reg(REG_RDT, (NUM_RX_DESC - 1) as u32);
        self.rx_cur = 0;

        self.write_reg(REG_RCTL, RCTL_EN | RCTL_BAM | RCTL_BSIZE_2048 | RCTL_SECRC);
        Ok(())
    }

    fn init_tx(&mut self) -> Result<(), NetError> {
        let ring = heap::alloc_aligned(NUM_TX_DESC * core::mem::size_of::<TxDesc>(), RING_ALIGN)
            .ok_or(NetError::OutOfMemory)?;
        self.tx_descs = ring.as_ptr() as *mut TxDesc;

        for i in 0..NUM_TX_DESC {
            let buffer = heap::alloc_aligned(BUFFER_SIZE, 16).ok_or(NetError::OutOfMemory)?;
            self.tx_buffers[i] = buffer.as_ptr();
            unsafe {
                write_volatile(
                    self.tx_descs.add(i),
                    TxDesc {
                        addr: virt_to_phys(buffer.addr() as u64),
                        length: 0,
                        cso: 0,
                        cmd: 0,
                        // Done up front so the first send never waits
                        status: TXD_STAT_DD,
                        css: 0,
                        special: 0,
                    },
                );
            }
        }

        let ring_addr = virt_to_phys(self.tx_descs as u64);
        self.write_reg(REG_TDBAL, ring_addr as u32);
        self.write_reg(REG_TDBAH, (ring_addr >> 32) as u32);
        self.write_reg(REG_TDLEN, (NUM_TX_DESC * core::mem::size_of::<TxDesc>()) as u32);
        self.write_reg(REG_TDH, 0);
        self.write_reg(REG_TDT, 0);
        self.tx_cur = 0;

        // Inter-packet gap per IEEE 802.3: IPGT=10, IPGR1=10, IPGR2=10.
        // TX silently does nothing without this.
        self.write_reg(REG_TIPG, 10 | (10 << 10) | (10 << 20));
        self.write_reg(
            REG_TCTL,
            TCTL_EN | TCTL_PSP | (15 << TCTL_CT_SHIFT) | (64 << TCTL_COLD_SHIFT),
        );
        Ok(())
    }

    /// Queue one frame and wait (bounded) for the hardware to report DD
    fn send(&mut self, data: &[u8]) -> Result<(), NetError> {
        if data.len() > BUFFER_SIZE {
            return Err(NetError::TooLarge);
        }

        let idx = self.tx_cur;
        unsafe {
            let desc = self.tx_descs.add(idx);
            if read_volatile(&(*desc).status) & TXD_STAT_DD == 0 {
                return Err(NetError::DescriptorBusy);
            }

            core::ptr::copy_nonoverlapping(data.as_ptr(), self.tx_buffers[idx], data.len());
            write_volatile(
                desc,
                TxDesc {
                    addr: virt_to_phys(self.tx_buffers[idx] as u64),
                    length: data.len() as u16,
                    cso: 0,
                    cmd: TXD_CMD_EOP | TXD_CMD_IFCS | TXD_CMD_RS,
                    status: 0,
                    css: 0,
                    special: 0,
                },
            );

            self.tx_cur = (idx + 1) % NUM_TX_DESC;
            self.write_reg(REG_TDT, self.tx_cur as u32);

            for _ in 0..100_000 {
                if read_volatile(&(*desc).status) & TXD_STAT_DD != 0 {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
        }
        Err(NetError::TxTimeout)
    }

    /// Pull the next completed frame off the RX ring, if any
    fn receive(&mut self) -> Option<Vec<u8>> {
        let idx = self.rx_cur;
        unsafe {
            let desc = self.rx_descs.add(idx);
            if read_volatile(&(*desc).status) & RXD_STAT_DD == 0 {
                return None;
            }

            let length = (read_volatile(&(*desc).length) as usize).min(BUFFER_SIZE);
            let mut packet = Vec::with_capacity(length);
            packet.extend_from_slice(core::slice::from_raw_parts(self.rx_buffers[idx], length));

            write_volatile(&mut (*desc).status, 0);
            self.rx_cur = (idx + 1) % NUM_RX_DESC;
            // Hand the descriptor back by moving the tail over it
            self.write_reg(REG_RDT, idx as u32);

            Some(packet)
        }
    }

    fn link_up(&self) -> bool {
        self.read_reg(REG_STATUS) & STATUS_LU != 0
    }
}

static NIC: Mutex<Option<E1000>> = Mutex::new(None);
static LINK_CHANGED: AtomicBool = AtomicBool::new(false);

/// IRQ handler: reading ICR acknowledges the device. Real receive work
/// happens in the polling loop; the handler only notes link changes.
fn e1000_irq() {
    let nic = NIC.try_lock();
    if let Some(guard) = nic {
        if let Some(dev) = guard.as_ref() {
            let icr = dev.read_reg(REG_ICR);
            if icr & ICR_LSC != 0 {
                LINK_CHANGED.store(true, Ordering::Relaxed);
            }
        }
    }
}

fn find_nic() -> Option<PciDevice> {
    for (vendor, device) in SUPPORTED_IDS {
        if let Some(dev) = pci::find_device(vendor, device) {
            return Some(dev);
        }
    }
    pci::find_by_class(pci::class::NETWORK, pci::network::ETHERNET)
}

/// Probe, reset and bring up the NIC. Returns false when no supported
/// device is present (the net stack then stays dormant).
pub fn init() -> bool {
    let pci_dev = match find_nic() {
        Some(dev) => dev,
        None => {
            crate::log_warn!("e1000: no supported NIC found");
            return false;
        }
    };

    pci_dev.enable_bus_mastering();
    pci_dev.enable_memory_space();

    let bar0 = match pci_dev.bar_address(0) {
        Some(addr) if addr != 0 => addr,
        _ => {
            crate::log_error!("e1000: BAR0 missing");
            return false;
        }
    };

    let mut dev = E1000 {
        mmio_base: bar0,
        mac: [0; 6],
        rx_descs: core::ptr::null_mut(),
        tx_descs: core::ptr::null_mut(),
        rx_buffers: [core::ptr::null_mut(); NUM_RX_DESC],
        tx_buffers: [core::ptr::null_mut(); NUM_TX_DESC],
        rx_cur: 0,
        tx_cur: 0,
    };

    dev.reset();
    dev.read_mac();

    // Link up, clear the multicast table
    let ctrl = dev.read_reg(REG_CTRL);
    dev.write_reg(REG_CTRL, ctrl | CTRL_SLU);
    for i in 0..128 {
        dev.write_reg(REG_MTA + i * 4, 0);
    }

    if dev.init_rx().is_err() || dev.init_tx().is_err() {
        crate::log_error!("e1000: ring allocation failed");
        return false;
    }

    let irq = pci_dev.interrupt_line;
    if irq < 16 {
        crate::interrupts::register_irq_handler(irq, e1000_irq);
        crate::interrupts::unmask_irq(irq);
    }
    dev.write_reg(REG_IMS, ICR_RXT0 | ICR_LSC);

    crate::log!(
        "e1000: {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} mmio {:#x} irq {}",
        dev.mac[0], dev.mac[1], dev.mac[2], dev.mac[3], dev.mac[4], dev.mac[5],
        bar0, irq
    );

    *NIC.lock() = Some(dev);
    true
}

/// Transmit a raw frame
pub fn send_packet(data: &[u8]) -> Result<(), NetError> {
    let mut nic = NIC.lock();
    nic.as_mut().ok_or(NetError::NoDevice)?.send(data)
}

/// Fetch the next received frame, if any
pub fn receive_packet() -> Option<Vec<u8>> {
    let mut nic = NIC.lock();
    nic.as_mut()?.receive()
}

/// Our MAC address
pub fn mac_address() -> Option<[u8; 6]> {
    NIC.lock().as_ref().map(|dev| dev.mac)
}

/// Current link state from the STATUS register
pub fn link_up() -> bool {
    NIC.lock().as_ref().map(|dev| dev.link_up()).unwrap_or(false)
}

pub fn is_initialized() -> bool {
    NIC.lock().is_some()
}
