//! Network protocol stack
//!
//! Polled ARP/IPv4/ICMP/UDP/TCP over the e1000 driver. All wire fields
//! are big-endian; the helpers in `byteorder` convert. Incoming frames
//! are pulled off the NIC by `poll()`, which every blocking wait in the
//! stack also drives, so progress continues while a caller spins.

pub mod arp;
pub mod icmp;
pub mod ip;
pub mod socket;
pub mod tcp;
pub mod udp;

use alloc::vec::Vec;

/// Network error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// No NIC came up
    NoDevice,
    /// Ring/buffer allocation failed
    OutOfMemory,
    /// Frame exceeds the 2 KiB device buffer
    TooLarge,
    /// Frame shorter than its mandatory header
    TooSmall,
    /// No TX descriptor became free
    DescriptorBusy,
    /// DD never came back after transmit
    TxTimeout,
    /// Link reported down
    LinkDown,
    /// A bounded wait expired
    Timeout,
    /// ARP never resolved the next hop
    ArpTimeout,
    /// Connection/socket table exhausted
    TableFull,
    /// Socket not connected / wrong state
    NotConnected,
    /// Peer never completed the handshake
    ConnectionRefused,
    /// Bad socket id or operation for the socket type
    InvalidSocket,
    /// Malformed address string
    InvalidAddress,
}

/// Byte-order helpers (network order is big-endian)
pub mod byteorder {
    pub fn htons(host: u16) -> u16 {
        host.to_be()
    }

    pub fn htonl(host: u32) -> u32 {
        host.to_be()
    }

    pub fn ntohs(net: u16) -> u16 {
        u16::from_be(net)
    }

    pub fn ntohl(net: u32) -> u32 {
        u32::from_be(net)
    }
}

/// EtherType values
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

/// Ethernet II header length
pub const ETH_HEADER_LEN: usize = 14;

/// Minimum frame length on the wire (without FCS)
const ETH_MIN_FRAME: usize = 60;

/// Broadcast MAC
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

/// Interface configuration. QEMU user-mode defaults until `ifconfig`
/// changes them.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub netmask: [u8; 4],
    pub mac: [u8; 6],
}

static CONFIG: spin::Mutex<NetConfig> = spin::Mutex::new(NetConfig {
    ip: [10, 0, 2, 15],
    gateway: [10, 0, 2, 2],
    netmask: [255, 255, 255, 0],
    mac: [0; 6],
});

pub fn config() -> NetConfig {
    *CONFIG.lock()
}

pub fn set_ip(ip: [u8; 4]) {
    CONFIG.lock().ip = ip;
}

pub fn set_gateway(gateway: [u8; 4]) {
    CONFIG.lock().gateway = gateway;
}

pub fn set_netmask(netmask: [u8; 4]) {
    CONFIG.lock().netmask = netmask;
}

pub fn set_mac(mac: [u8; 6]) {
    CONFIG.lock().mac = mac;
}

pub fn local_ip() -> [u8; 4] {
    CONFIG.lock().ip
}

pub fn local_mac() -> [u8; 6] {
    CONFIG.lock().mac
}

/// Bring the stack up over an initialized NIC
pub fn init() {
    if let Some(mac) = crate::drivers::e1000::mac_address() {
        set_mac(mac);
    }
    arp::init();
    tcp::init();
    udp::init();
    socket::init();

    let cfg = config();
    crate::log!(
        "net: ip {}.{}.{}.{} gw {}.{}.{}.{} mask {}.{}.{}.{}",
        cfg.ip[0], cfg.ip[1], cfg.ip[2], cfg.ip[3],
        cfg.gateway[0], cfg.gateway[1], cfg.gateway[2], cfg.gateway[3],
        cfg.netmask[0], cfg.netmask[1], cfg.netmask[2], cfg.netmask[3]
    );
}

/// Dispatch one received ethernet frame
pub fn process_packet(frame: &[u8]) {
    if frame.len() < ETH_HEADER_LEN {
        return;
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let payload = &frame[ETH_HEADER_LEN..];

    match ethertype {
        ethertype::ARP => arp::handle_packet(payload),
        ethertype::IPV4 => ip::handle_packet(payload),
        _ => {}
    }
}

/// Drain the NIC receive ring, dispatching every frame
pub fn poll() {
    crate::logger::tick();
    while let Some(frame) = crate::drivers::e1000::receive_packet() {
        process_packet(&frame);
    }
}

/// Build and transmit one ethernet frame, padding to the 60-byte minimum
pub fn send_frame(dst_mac: [u8; 6], ethertype: u16, payload: &[u8]) -> Result<(), NetError> {
    let src_mac = local_mac();

    let mut frame = Vec::with_capacity(ETH_MIN_FRAME.max(ETH_HEADER_LEN + payload.len()));
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    while frame.len() < ETH_MIN_FRAME {
        frame.push(0);
    }

    #[cfg(feature = "net-trace")]
    crate::log_debug!("net: tx {} bytes, ethertype {:#06x}", frame.len(), ethertype);

    transmit(frame)
}

#[cfg(not(test))]
fn transmit(frame: Vec<u8>) -> Result<(), NetError> {
    crate::drivers::e1000::send_packet(&frame)
}

#[cfg(test)]
fn transmit(frame: Vec<u8>) -> Result<(), NetError> {
    testing::CAPTURED_TX.lock().push(frame);
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Captured-transmit sink: tests inject frames with `process_packet`
    //! and inspect what the stack would have put on the wire.

    use alloc::vec::Vec;
    use spin::Mutex;

    pub static CAPTURED_TX: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

    /// The stack's tables and the TX sink are process-wide, so tests
    /// touching them take this guard to run one at a time.
    static TEST_SERIAL: Mutex<()> = Mutex::new(());

    pub fn serialize_tests() -> spin::MutexGuard<'static, ()> {
        TEST_SERIAL.lock()
    }

    /// Drop everything captured so far
    pub fn clear_tx() {
        CAPTURED_TX.lock().clear();
    }

    /// Captured frames, oldest first
    pub fn take_tx() -> Vec<Vec<u8>> {
        core::mem::take(&mut *CAPTURED_TX.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::byteorder::*;

    #[test]
    fn byte_order_round_trips() {
        for x in [0u16, 1, 0x1234, 0xFFFF, 0x8000] {
            assert_eq!(ntohs(htons(x)), x);
        }
        for x in [0u32, 1, 0x1234_5678, 0xFFFF_FFFF, 0x8000_0000] {
            assert_eq!(ntohl(htonl(x)), x);
        }
        // Network order puts the most significant byte first in memory
        assert_eq!(htons(0x1234).to_ne_bytes(), [0x12, 0x34]);
        assert_eq!(htonl(0x1234_5678).to_ne_bytes(), [0x12, 0x34, 0x56, 0x78]);
    }
}
