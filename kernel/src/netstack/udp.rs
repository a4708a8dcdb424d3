//! UDP
//!
//! Sixteen stateless sockets, each with a single 2 KiB receive slot: a
//! later datagram overwrites an unread earlier one (there is no queue).
//! Checksums use the standard IPv4 pseudo-header.

use spin::Mutex;

use super::{ip, NetError};

pub const UDP_HEADER_LEN: usize = 8;

/// Socket table size
pub const MAX_UDP_SOCKETS: usize = 16;

/// One receive slot per socket
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Largest payload that fits an ethernet frame
const MAX_PAYLOAD: usize = 1472;

/// Bounded blocking-recv budget
const RECV_WAIT_ITERATIONS: u32 = 1_000_000;

struct UdpSocket {
    used: bool,
    bound: bool,
    local_port: u16,
    remote_ip: [u8; 4],
    remote_port: u16,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    recv_len: usize,
    recv_src_ip: [u8; 4],
    recv_src_port: u16,
}

impl UdpSocket {
    const fn unused() -> Self {
        UdpSocket {
            used: false,
            bound: false,
            local_port: 0,
            remote_ip: [0; 4],
            remote_port: 0,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            recv_len: 0,
            recv_src_ip: [0; 4],
            recv_src_port: 0,
        }
    }
}

static SOCKETS: Mutex<[UdpSocket; MAX_UDP_SOCKETS]> =
    Mutex::new([const { UdpSocket::unused() }; MAX_UDP_SOCKETS]);

static NEXT_EPHEMERAL_PORT: Mutex<u16> = Mutex::new(49152);

pub fn init() {
    let mut sockets = SOCKETS.lock();
    for socket in sockets.iter_mut() {
        *socket = UdpSocket::unused();
    }
}

fn alloc_ephemeral_port() -> u16 {
    let mut port = NEXT_EPHEMERAL_PORT.lock();
    let allocated = *port;
    *port = port.checked_add(1).unwrap_or(49152);
    allocated
}

/// UDP checksum over the IPv4 pseudo-header and the datagram
fn udp_checksum(src_ip: [u8; 4], dest_ip: [u8; 4], datagram: &[u8]) -> u16 {
    let mut buf = alloc::vec::Vec::with_capacity(12 + datagram.len());
    buf.extend_from_slice(&src_ip);
    buf.extend_from_slice(&dest_ip);
    buf.push(0);
    buf.push(ip::protocol::UDP);
    buf.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
    buf.extend_from_slice(datagram);
    ip::checksum(&buf)
}

/// Open a socket on an ephemeral port
pub fn socket() -> Result<usize, NetError> {
    let mut sockets = SOCKETS.lock();
    let slot = sockets
        .iter()
        .position(|s| !s.used)
        .ok_or(NetError::TableFull)?;
    sockets[slot] = UdpSocket::unused();
    sockets[slot].used = true;
    sockets[slot].local_port = alloc_ephemeral_port();
    Ok(slot)
}

/// Bind to a well-known local port
pub fn bind(sock: usize, port: u16) -> Result<(), NetError> {
    let mut sockets = SOCKETS.lock();
    let socket = sockets
        .get_mut(sock)
        .filter(|s| s.used)
        .ok_or(NetError::InvalidSocket)?;
    socket.local_port = port;
    socket.bound = true;
    Ok(())
}

/// Fix the remote endpoint for `send`
pub fn connect(sock: usize, dest_ip: [u8; 4], dest_port: u16) -> Result<(), NetError> {
    let mut sockets = SOCKETS.lock();
    let socket = sockets
        .get_mut(sock)
        .filter(|s| s.used)
        .ok_or(NetError::InvalidSocket)?;
    socket.remote_ip = dest_ip;
    socket.remote_port = dest_port;
    Ok(())
}

/// Send one datagram to an explicit destination
pub fn sendto(sock: usize, data: &[u8], dest_ip: [u8; 4], dest_port: u16) -> Result<usize, NetError> {
    if data.len() > MAX_PAYLOAD {
        return Err(NetError::TooLarge);
    }

    let src_port = {
        let sockets = SOCKETS.lock();
        sockets
            .get(sock)
            .filter(|s| s.used)
            .ok_or(NetError::InvalidSocket)?
            .local_port
    };

    let len = UDP_HEADER_LEN + data.len();
    let mut datagram = alloc::vec::Vec::with_capacity(len);
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dest_port.to_be_bytes());
    datagram.extend_from_slice(&(len as u16).to_be_bytes());
    datagram.extend_from_slice(&0u16.to_be_bytes());
    datagram.extend_from_slice(data);

    let mut csum = udp_checksum(super::local_ip(), dest_ip, &datagram);
    // On the wire zero means "no checksum", so a computed zero becomes all-ones
    if csum == 0 {
        csum = 0xFFFF;
    }
    datagram[6..8].copy_from_slice(&csum.to_be_bytes());

    ip::send_packet(dest_ip, ip::protocol::UDP, &datagram)?;
    Ok(data.len())
}

/// Send to the connected endpoint
pub fn send(sock: usize, data: &[u8]) -> Result<usize, NetError> {
    let (ip_addr, port) = {
        let sockets = SOCKETS.lock();
        let socket = sockets
            .get(sock)
            .filter(|s| s.used)
            .ok_or(NetError::InvalidSocket)?;
        (socket.remote_ip, socket.remote_port)
    };
    if ip_addr == [0; 4] {
        return Err(NetError::NotConnected);
    }
    sendto(sock, data, ip_addr, port)
}

/// Take the received datagram out of a socket's slot, if present
fn try_take(sock: usize, buffer: &mut [u8]) -> Result<Option<(usize, [u8; 4], u16)>, NetError> {
    let mut sockets = SOCKETS.lock();
    let socket = sockets
        .get_mut(sock)
        .filter(|s| s.used)
        .ok_or(NetError::InvalidSocket)?;
    if socket.recv_len == 0 {
        return Ok(None);
    }
    let n = socket.recv_len.min(buffer.len());
    buffer[..n].copy_from_slice(&socket.recv_buffer[..n]);
    let meta = (n, socket.recv_src_ip, socket.recv_src_port);
    socket.recv_len = 0;
    Ok(Some(meta))
}

/// Blocking receive with source address, driven by the poll loop and
/// bounded like every other wait in the kernel
pub fn recvfrom(
    sock: usize,
    buffer: &mut [u8],
) -> Result<(usize, [u8; 4], u16), NetError> {
    for _ in 0..RECV_WAIT_ITERATIONS {
        if let Some(result) = try_take(sock, buffer)? {
            return Ok(result);
        }
        super::poll();
        core::hint::spin_loop();
    }
    Err(NetError::Timeout)
}

/// Blocking receive, source ignored
pub fn recv(sock: usize, buffer: &mut [u8]) -> Result<usize, NetError> {
    recvfrom(sock, buffer).map(|(n, _, _)| n)
}

/// Release a socket
pub fn close(sock: usize) -> Result<(), NetError> {
    let mut sockets = SOCKETS.lock();
    let socket = sockets.get_mut(sock).ok_or(NetError::InvalidSocket)?;
    socket.used = false;
    Ok(())
}

/// (local_port, bound) pairs of live sockets, for `netstat`
pub fn table_snapshot() -> alloc::vec::Vec<(u16, bool)> {
    SOCKETS
        .lock()
        .iter()
        .filter(|s| s.used)
        .map(|s| (s.local_port, s.bound))
        .collect()
}

/// Ingest one UDP datagram (the IP payload)
pub fn handle_packet(data: &[u8], src_ip: [u8; 4]) {
    if data.len() < UDP_HEADER_LEN {
        return;
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dest_port = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    if length < UDP_HEADER_LEN || length > data.len() {
        return;
    }
    let payload = &data[UDP_HEADER_LEN..length];

    let mut sockets = SOCKETS.lock();
    if let Some(socket) = sockets.iter_mut().find(|s| s.used && s.local_port == dest_port) {
        // A fresh datagram overwrites an unread one
        let n = payload.len().min(RECV_BUFFER_SIZE);
        socket.recv_buffer[..n].copy_from_slice(&payload[..n]);
        socket.recv_len = n;
        socket.recv_src_ip = src_ip;
        socket.recv_src_port = src_port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::{arp, testing};

    fn setup() -> spin::MutexGuard<'static, ()> {
        let guard = testing::serialize_tests();
        crate::memory::heap::test_support::init_test_heap();
        init();
        arp::init();
        crate::netstack::set_mac([0x02, 0, 0, 1, 2, 3]);
        crate::netstack::set_ip([10, 0, 2, 15]);
        crate::netstack::set_netmask([255, 255, 255, 0]);
        // Pre-resolve a peer
        let mut arp_packet = [0u8; arp::ARP_PACKET_LEN];
        arp_packet[0..2].copy_from_slice(&1u16.to_be_bytes());
        arp_packet[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        arp_packet[4] = 6;
        arp_packet[5] = 4;
        arp_packet[6..8].copy_from_slice(&2u16.to_be_bytes());
        arp_packet[8..14].copy_from_slice(&[0x52, 0x54, 0, 7, 7, 7]);
        arp_packet[14..18].copy_from_slice(&[10, 0, 2, 7]);
        arp::handle_packet(&arp_packet);
        testing::clear_tx();
        guard
    }

    fn datagram(src_port: u16, dest_port: u16, payload: &[u8]) -> alloc::vec::Vec<u8> {
        let len = UDP_HEADER_LEN + payload.len();
        let mut d = alloc::vec::Vec::with_capacity(len);
        d.extend_from_slice(&src_port.to_be_bytes());
        d.extend_from_slice(&dest_port.to_be_bytes());
        d.extend_from_slice(&(len as u16).to_be_bytes());
        d.extend_from_slice(&0u16.to_be_bytes());
        d.extend_from_slice(payload);
        d
    }

    #[test]
    fn bound_socket_receives_matching_datagram() {
        let _guard = setup();
        let sock = socket().unwrap();
        bind(sock, 5000).unwrap();

        handle_packet(&datagram(6000, 5000, b"hello udp"), [10, 0, 2, 7]);

        let mut buf = [0u8; 64];
        let (n, src_ip, src_port) = recvfrom(sock, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello udp");
        assert_eq!(src_ip, [10, 0, 2, 7]);
        assert_eq!(src_port, 6000);
        close(sock).unwrap();
    }

    #[test]
    fn second_datagram_overwrites_the_slot() {
        let _guard = setup();
        let sock = socket().unwrap();
        bind(sock, 5001).unwrap();

        handle_packet(&datagram(6000, 5001, b"first"), [10, 0, 2, 7]);
        handle_packet(&datagram(6000, 5001, b"second"), [10, 0, 2, 7]);

        let mut buf = [0u8; 64];
        let (n, _, _) = recvfrom(sock, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
        close(sock).unwrap();
    }

    #[test]
    fn sendto_emits_checksummed_datagram() {
        let _guard = setup();
        let sock = socket().unwrap();
        bind(sock, 4321).unwrap();

        sendto(sock, b"ping!", [10, 0, 2, 7], 9999).unwrap();

        let frames = testing::take_tx();
        assert_eq!(frames.len(), 1);
        let udp = &frames[0][14 + ip::IP_HEADER_LEN..14 + ip::IP_HEADER_LEN + UDP_HEADER_LEN + 5];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 4321);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 9999);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]) as usize, UDP_HEADER_LEN + 5);
        assert_eq!(&udp[UDP_HEADER_LEN..], b"ping!");

        // Verifying the checksum over the pseudo-header folds to zero
        let mut check = alloc::vec::Vec::new();
        check.extend_from_slice(&[10, 0, 2, 15]);
        check.extend_from_slice(&[10, 0, 2, 7]);
        check.push(0);
        check.push(ip::protocol::UDP);
        check.extend_from_slice(&((UDP_HEADER_LEN + 5) as u16).to_be_bytes());
        check.extend_from_slice(udp);
        assert_eq!(ip::checksum(&check), 0);
        close(sock).unwrap();
    }

    #[test]
    fn datagram_for_unbound_port_is_dropped() {
        let _guard = setup();
        let sock = socket().unwrap();
        bind(sock, 7000).unwrap();
        handle_packet(&datagram(1, 7001, b"nope"), [10, 0, 2, 7]);

        let mut buf = [0u8; 16];
        assert!(try_take(sock, &mut buf).unwrap().is_none());
        close(sock).unwrap();
    }

    #[test]
    fn oversized_send_is_refused() {
        let _guard = setup();
        let sock = socket().unwrap();
        let big = alloc::vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            sendto(sock, &big, [10, 0, 2, 7], 1),
            Err(NetError::TooLarge)
        ));
        close(sock).unwrap();
    }
}
