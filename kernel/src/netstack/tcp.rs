//! TCP
//!
//! Sixteen-slot connection table with the textbook state machine and
//! nothing fancier: fixed initial sequence numbers (1000 for clients,
//! 2000 for listeners), no retransmission, no congestion control, no
//! out-of-order reassembly, no RST generation. Enough to carry an HTTP
//! exchange against a well-behaved peer.
//!
//! Handlers never transmit while holding the table lock; replies are
//! collected and sent afterwards, because sending can re-enter the
//! receive path through the ARP wait.

use alloc::vec::Vec;
use spin::Mutex;

use super::{ip, NetError};

pub const TCP_HEADER_LEN: usize = 20;

/// Connection table size
pub const MAX_TCP_CONNECTIONS: usize = 16;

/// Per-connection receive ring
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Client / listener initial sequence numbers
const CLIENT_ISS: u32 = 1000;
const LISTENER_ISS: u32 = 2000;

/// Segment payload ceiling when chunking sends
const MSS: usize = 1400;

/// Handshake and recv wait budgets
const CONNECT_WAIT_ITERATIONS: u32 = 5000;
const RECV_WAIT_ITERATIONS: u32 = 1_000_000;

/// TCP flag bits
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
}

struct TcpConnection {
    used: bool,
    state: TcpState,
    local_port: u16,
    remote_ip: [u8; 4],
    remote_port: u16,
    /// Next sequence number we will send
    seq_num: u32,
    /// Next sequence number we expect from the peer
    ack_num: u32,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    recv_len: usize,
}

impl TcpConnection {
    const fn unused() -> Self {
        TcpConnection {
            used: false,
            state: TcpState::Closed,
            local_port: 0,
            remote_ip: [0; 4],
            remote_port: 0,
            seq_num: 0,
            ack_num: 0,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            recv_len: 0,
        }
    }
}

static CONNECTIONS: Mutex<[TcpConnection; MAX_TCP_CONNECTIONS]> =
    Mutex::new([const { TcpConnection::unused() }; MAX_TCP_CONNECTIONS]);

static NEXT_EPHEMERAL_PORT: Mutex<u16> = Mutex::new(49152);

pub fn init() {
    let mut conns = CONNECTIONS.lock();
    for conn in conns.iter_mut() {
        *conn = TcpConnection::unused();
    }
}

fn alloc_ephemeral_port() -> u16 {
    let mut port = NEXT_EPHEMERAL_PORT.lock();
    let allocated = *port;
    *port = port.checked_add(1).unwrap_or(49152);
    allocated
}

/// A segment waiting to leave once the table lock is released
struct PendingSegment {
    dest_ip: [u8; 4],
    src_port: u16,
    dest_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: Vec<u8>,
}

fn tcp_checksum(src_ip: [u8; 4], dest_ip: [u8; 4], segment: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(&src_ip);
    buf.extend_from_slice(&dest_ip);
    buf.push(0);
    buf.push(ip::protocol::TCP);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    ip::checksum(&buf)
}

fn transmit(pending: PendingSegment) -> Result<(), NetError> {
    let mut segment = Vec::with_capacity(TCP_HEADER_LEN + pending.payload.len());
    segment.extend_from_slice(&pending.src_port.to_be_bytes());
    segment.extend_from_slice(&pending.dest_port.to_be_bytes());
    segment.extend_from_slice(&pending.seq.to_be_bytes());
    segment.extend_from_slice(&pending.ack.to_be_bytes());
    segment.push(0x50); // data offset 5, no options
    segment.push(pending.flags);
    segment.extend_from_slice(&(RECV_BUFFER_SIZE as u16).to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    segment.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
    segment.extend_from_slice(&pending.payload);

    let csum = tcp_checksum(super::local_ip(), pending.dest_ip, &segment);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    ip::send_packet(pending.dest_ip, ip::protocol::TCP, &segment)
}

/// Start a client connection: allocate a slot and fire the SYN. Does not
/// wait for the handshake.
pub fn connect_start(dest_ip: [u8; 4], dest_port: u16) -> Result<usize, NetError> {
    let pending = {
        let mut conns = CONNECTIONS.lock();
        let slot = conns
            .iter()
            .position(|c| !c.used)
            .ok_or(NetError::TableFull)?;

        let local_port = alloc_ephemeral_port();
        conns[slot] = TcpConnection::unused();
        conns[slot].used = true;
        conns[slot].state = TcpState::SynSent;
        conns[slot].local_port = local_port;
        conns[slot].remote_ip = dest_ip;
        conns[slot].remote_port = dest_port;
        conns[slot].seq_num = CLIENT_ISS + 1; // SYN consumes one
        conns[slot].ack_num = 0;

        (
            slot,
            PendingSegment {
                dest_ip,
                src_port: local_port,
                dest_port,
                seq: CLIENT_ISS,
                ack: 0,
                flags: flags::SYN,
                payload: Vec::new(),
            },
        )
    };

    transmit(pending.1)?;
    Ok(pending.0)
}

/// Connect and wait (bounded) for the handshake to finish
pub fn connect(dest_ip: [u8; 4], dest_port: u16) -> Result<usize, NetError> {
    let sock = connect_start(dest_ip, dest_port)?;

    for _ in 0..CONNECT_WAIT_ITERATIONS {
        super::poll();
        match state_of(sock) {
            Some(TcpState::Established) => return Ok(sock),
            Some(TcpState::SynSent) => {}
            _ => break,
        }
        for _ in 0..1000 {
            core::hint::spin_loop();
        }
    }

    free(sock);
    Err(NetError::ConnectionRefused)
}

/// Open a passive socket
pub fn listen(port: u16) -> Result<usize, NetError> {
    let mut conns = CONNECTIONS.lock();
    let slot = conns
        .iter()
        .position(|c| !c.used)
        .ok_or(NetError::TableFull)?;
    conns[slot] = TcpConnection::unused();
    conns[slot].used = true;
    conns[slot].state = TcpState::Listen;
    conns[slot].local_port = port;
    Ok(slot)
}

/// Wait (bounded) for a connection accepted off a listener
pub fn accept(listen_sock: usize) -> Result<usize, NetError> {
    let listen_port = {
        let conns = CONNECTIONS.lock();
        let conn = conns
            .get(listen_sock)
            .filter(|c| c.used && c.state == TcpState::Listen)
            .ok_or(NetError::InvalidSocket)?;
        conn.local_port
    };

    for _ in 0..RECV_WAIT_ITERATIONS {
        super::poll();
        let conns = CONNECTIONS.lock();
        if let Some(slot) = conns.iter().position(|c| {
            c.used
                && c.state == TcpState::Established
                && c.local_port == listen_port
                && c.remote_port != 0
        }) {
            if slot != listen_sock {
                return Ok(slot);
            }
        }
        drop(conns);
        core::hint::spin_loop();
    }
    Err(NetError::Timeout)
}

/// Send data on an established connection, chunked to the MSS
pub fn send(sock: usize, data: &[u8]) -> Result<usize, NetError> {
    for chunk in data.chunks(MSS) {
        let pending = {
            let mut conns = CONNECTIONS.lock();
            let conn = conns
                .get_mut(sock)
                .filter(|c| c.used)
                .ok_or(NetError::InvalidSocket)?;
            if conn.state != TcpState::Established {
                return Err(NetError::NotConnected);
            }

            let segment = PendingSegment {
                dest_ip: conn.remote_ip,
                src_port: conn.local_port,
                dest_port: conn.remote_port,
                seq: conn.seq_num,
                ack: conn.ack_num,
                flags: flags::PSH | flags::ACK,
                payload: chunk.into(),
            };
            conn.seq_num = conn.seq_num.wrapping_add(chunk.len() as u32);
            segment
        };
        transmit(pending)?;
    }
    Ok(data.len())
}

/// Take buffered data without blocking
pub fn try_recv(sock: usize, buffer: &mut [u8]) -> Result<usize, NetError> {
    let mut conns = CONNECTIONS.lock();
    let conn = conns
        .get_mut(sock)
        .filter(|c| c.used)
        .ok_or(NetError::InvalidSocket)?;

    if conn.recv_len == 0 {
        return Ok(0);
    }

    let n = conn.recv_len.min(buffer.len());
    buffer[..n].copy_from_slice(&conn.recv_buffer[..n]);
    if n < conn.recv_len {
        conn.recv_buffer.copy_within(n..conn.recv_len, 0);
    }
    conn.recv_len -= n;
    Ok(n)
}

/// Blocking receive: polls until data lands, the peer finishes sending,
/// or the wait budget runs out
pub fn recv(sock: usize, buffer: &mut [u8]) -> Result<usize, NetError> {
    for _ in 0..RECV_WAIT_ITERATIONS {
        let n = try_recv(sock, buffer)?;
        if n > 0 {
            return Ok(n);
        }
        match state_of(sock) {
            Some(TcpState::Established) => {}
            // Peer closed or the connection went away: end of stream
            _ => return Ok(0),
        }
        super::poll();
        core::hint::spin_loop();
    }
    Err(NetError::Timeout)
}

/// Close a connection: FIN from ESTABLISHED (active close) or from
/// CLOSE_WAIT (passive close). Anything else just frees the slot.
pub fn close(sock: usize) -> Result<(), NetError> {
    let pending = {
        let mut conns = CONNECTIONS.lock();
        let conn = conns
            .get_mut(sock)
            .filter(|c| c.used)
            .ok_or(NetError::InvalidSocket)?;

        match conn.state {
            TcpState::Established | TcpState::CloseWait => {
                let segment = PendingSegment {
                    dest_ip: conn.remote_ip,
                    src_port: conn.local_port,
                    dest_port: conn.remote_port,
                    seq: conn.seq_num,
                    ack: conn.ack_num,
                    flags: flags::FIN | flags::ACK,
                    payload: Vec::new(),
                };
                conn.seq_num = conn.seq_num.wrapping_add(1);
                conn.state = if conn.state == TcpState::Established {
                    TcpState::FinWait1
                } else {
                    TcpState::LastAck
                };
                Some(segment)
            }
            _ => {
                conn.used = false;
                conn.state = TcpState::Closed;
                None
            }
        }
    };

    if let Some(segment) = pending {
        transmit(segment)?;
    }
    Ok(())
}

/// Forget a connection outright
pub fn free(sock: usize) {
    let mut conns = CONNECTIONS.lock();
    if let Some(conn) = conns.get_mut(sock) {
        conn.used = false;
        conn.state = TcpState::Closed;
    }
}

/// Current state, if the slot is live
pub fn state_of(sock: usize) -> Option<TcpState> {
    let conns = CONNECTIONS.lock();
    conns.get(sock).filter(|c| c.used).map(|c| c.state)
}

/// (local_port, remote_ip, remote_port, state) of live connections
pub fn table_snapshot() -> Vec<(u16, [u8; 4], u16, TcpState)> {
    CONNECTIONS
        .lock()
        .iter()
        .filter(|c| c.used)
        .map(|c| (c.local_port, c.remote_ip, c.remote_port, c.state))
        .collect()
}

/// Ingest one TCP segment (the IP payload)
pub fn handle_packet(data: &[u8], src_ip: [u8; 4]) {
    if data.len() < TCP_HEADER_LEN {
        return;
    }

    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dest_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let segment_flags = data[13];
    let header_len = ((data[12] >> 4) as usize) * 4;
    if header_len < TCP_HEADER_LEN || data.len() < header_len {
        return;
    }
    let payload = &data[header_len..];

    let mut replies: Vec<PendingSegment> = Vec::new();

    {
        let mut conns = CONNECTIONS.lock();

        // Exact four-tuple match wins over a LISTEN match
        let exact = conns.iter().position(|c| {
            c.used
                && c.state != TcpState::Listen
                && c.local_port == dest_port
                && c.remote_port == src_port
                && c.remote_ip == src_ip
        });

        match exact {
            Some(slot) => {
                handle_for_connection(&mut conns, slot, src_ip, seq, segment_flags, payload, &mut replies);
            }
            None => {
                let listener = conns
                    .iter()
                    .position(|c| c.used && c.state == TcpState::Listen && c.local_port == dest_port);

                if listener.is_some() && segment_flags & flags::SYN != 0 {
                    // Passive open: spawn a connection in SYN_RECEIVED
                    if let Some(slot) = conns.iter().position(|c| !c.used) {
                        let conn = &mut conns[slot];
                        *conn = TcpConnection::unused();
                        conn.used = true;
                        conn.state = TcpState::SynReceived;
                        conn.local_port = dest_port;
                        conn.remote_ip = src_ip;
                        conn.remote_port = src_port;
                        conn.ack_num = seq.wrapping_add(1);
                        conn.seq_num = LISTENER_ISS + 1; // SYN consumes one

                        replies.push(PendingSegment {
                            dest_ip: src_ip,
                            src_port: dest_port,
                            dest_port: src_port,
                            seq: LISTENER_ISS,
                            ack: conn.ack_num,
                            flags: flags::SYN | flags::ACK,
                            payload: Vec::new(),
                        });
                    }
                }
            }
        }
    }

    for reply in replies {
        let _ = transmit(reply);
    }
}

fn ack_segment(conn: &TcpConnection) -> PendingSegment {
    PendingSegment {
        dest_ip: conn.remote_ip,
        src_port: conn.local_port,
        dest_port: conn.remote_port,
        seq: conn.seq_num,
        ack: conn.ack_num,
        flags: flags::ACK,
        payload: Vec::new(),
    }
}

fn handle_for_connection(
    conns: &mut [TcpConnection; MAX_TCP_CONNECTIONS],
    slot: usize,
    _src_ip: [u8; 4],
    seq: u32,
    segment_flags: u8,
    payload: &[u8],
    replies: &mut Vec<PendingSegment>,
) {
    let conn = &mut conns[slot];

    match conn.state {
        TcpState::SynSent => {
            if segment_flags & (flags::SYN | flags::ACK) == (flags::SYN | flags::ACK) {
                conn.ack_num = seq.wrapping_add(1);
                conn.state = TcpState::Established;
                replies.push(ack_segment(conn));
            }
        }

        TcpState::SynReceived => {
            if segment_flags & flags::ACK != 0 {
                conn.state = TcpState::Established;
            }
        }

        TcpState::Established => {
            if segment_flags & flags::FIN != 0 {
                conn.ack_num = seq.wrapping_add(payload.len() as u32).wrapping_add(1);
                conn.state = TcpState::CloseWait;
                replies.push(ack_segment(conn));
            } else if !payload.is_empty() {
                let space = RECV_BUFFER_SIZE - conn.recv_len;
                let n = payload.len().min(space);
                conn.recv_buffer[conn.recv_len..conn.recv_len + n].copy_from_slice(&payload[..n]);
                conn.recv_len += n;
                conn.ack_num = conn.ack_num.wrapping_add(payload.len() as u32);
                replies.push(ack_segment(conn));
            }
        }

        TcpState::FinWait1 => {
            if segment_flags & flags::ACK != 0 {
                conn.state = TcpState::FinWait2;
            }
            if segment_flags & flags::FIN != 0 {
                conn.ack_num = seq.wrapping_add(1);
                replies.push(ack_segment(conn));
                conn.state = TcpState::Closed;
                conn.used = false;
            }
        }

        TcpState::FinWait2 => {
            if segment_flags & flags::FIN != 0 {
                conn.ack_num = seq.wrapping_add(1);
                replies.push(ack_segment(conn));
                conn.state = TcpState::Closed;
                conn.used = false;
            }
        }

        TcpState::CloseWait => {
            // Waiting for the application to close
        }

        TcpState::LastAck => {
            if segment_flags & flags::ACK != 0 {
                conn.state = TcpState::Closed;
                conn.used = false;
            }
        }

        TcpState::Closing | TcpState::TimeWait | TcpState::Listen | TcpState::Closed => {}
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
        // Pre-resolve the test peer 10.0.2.2
        let mut arp_packet = [0u8; arp::ARP_PACKET_LEN];
        arp_packet[0..2].copy_from_slice(&1u16.to_be_bytes());
        arp_packet[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        arp_packet[4] = 6;
        arp_packet[5] = 4;
        arp_packet[6..8].copy_from_slice(&2u16.to_be_bytes());
        arp_packet[8..14].copy_from_slice(&[0x52, 0x54, 0, 2, 2, 2]);
        arp_packet[14..18].copy_from_slice(&[10, 0, 2, 2]);
        arp::handle_packet(&arp_packet);
        testing::clear_tx();
        guard
    }

    /// Build a bare segment the peer would send us
    fn segment(src_port: u16, dest_port: u16, seq: u32, ack: u32, seg_flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut s = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
        s.extend_from_slice(&src_port.to_be_bytes());
        s.extend_from_slice(&dest_port.to_be_bytes());
        s.extend_from_slice(&seq.to_be_bytes());
        s.extend_from_slice(&ack.to_be_bytes());
        s.push(0x50);
        s.push(seg_flags);
        s.extend_from_slice(&65535u16.to_be_bytes());
        s.extend_from_slice(&0u16.to_be_bytes());
        s.extend_from_slice(&0u16.to_be_bytes());
        s.extend_from_slice(payload);
        s
    }

    /// Pull the TCP header fields out of the last captured frame. Short
    /// frames are padded to the ethernet minimum, so the segment end
    /// comes from the IP total-length field, not the frame length.
    fn last_tcp(frames: &[Vec<u8>]) -> (u16, u16, u32, u32, u8, Vec<u8>) {
        let frame = frames.last().expect("no frame captured");
        let total_len = u16::from_be_bytes([frame[16], frame[17]]) as usize;
        let tcp = &frame[14 + ip::IP_HEADER_LEN..14 + total_len];
        (
            u16::from_be_bytes([tcp[0], tcp[1]]),
            u16::from_be_bytes([tcp[2], tcp[3]]),
            u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
            u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
            tcp[13],
            tcp[TCP_HEADER_LEN..].to_vec(),
        )
    }

    #[test]
    fn connect_close_walks_the_client_states() {
        let _guard = setup();

        // CLOSED -> SYN_SENT, SYN on the wire with seq 1000
        let sock = connect_start([10, 0, 2, 2], 80).unwrap();
        assert_eq!(state_of(sock), Some(TcpState::SynSent));
        let frames = testing::take_tx();
        let (our_port, their_port, seq, _, seg_flags, _) = last_tcp(&frames);
        assert_eq!(their_port, 80);
        assert_eq!(seq, 1000);
        assert_eq!(seg_flags, flags::SYN);

        // SYN+ACK with their_seq 42 -> ESTABLISHED, our ACK says 43
        handle_packet(
            &segment(80, our_port, 42, 1001, flags::SYN | flags::ACK, &[]),
            [10, 0, 2, 2],
        );
        assert_eq!(state_of(sock), Some(TcpState::Established));
        let frames = testing::take_tx();
        let (_, _, seq, ack, seg_flags, _) = last_tcp(&frames);
        assert_eq!(seq, 1001);
        assert_eq!(ack, 43);
        assert_eq!(seg_flags, flags::ACK);

        // Send 3 bytes -> PSH+ACK, seq advances
        send(sock, b"abc").unwrap();
        let frames = testing::take_tx();
        let (_, _, seq, _, seg_flags, payload) = last_tcp(&frames);
        assert_eq!(seq, 1001);
        assert_eq!(seg_flags, flags::PSH | flags::ACK);
        assert_eq!(payload, b"abc");

        // Active close -> FIN+ACK with seq 1004, FIN_WAIT_1
        close(sock).unwrap();
        assert_eq!(state_of(sock), Some(TcpState::FinWait1));
        let frames = testing::take_tx();
        let (_, _, seq, _, seg_flags, _) = last_tcp(&frames);
        assert_eq!(seq, 1004);
        assert_eq!(seg_flags, flags::FIN | flags::ACK);

        // Their ACK -> FIN_WAIT_2
        handle_packet(&segment(80, our_port, 43, 1005, flags::ACK, &[]), [10, 0, 2, 2]);
        assert_eq!(state_of(sock), Some(TcpState::FinWait2));

        // Their FIN -> our ACK, CLOSED (slot freed)
        testing::clear_tx();
        handle_packet(&segment(80, our_port, 43, 1005, flags::FIN | flags::ACK, &[]), [10, 0, 2, 2]);
        assert_eq!(state_of(sock), None);
        let frames = testing::take_tx();
        let (_, _, _, ack, seg_flags, _) = last_tcp(&frames);
        assert_eq!(seg_flags, flags::ACK);
        assert_eq!(ack, 44);
    }

    #[test]
    fn received_data_is_buffered_and_acked() {
        let _guard = setup();
        let sock = connect_start([10, 0, 2, 2], 80).unwrap();
        let our_port = {
            let frames = testing::take_tx();
            last_tcp(&frames).0
        };
        handle_packet(&segment(80, our_port, 42, 1001, flags::SYN | flags::ACK, &[]), [10, 0, 2, 2]);
        testing::clear_tx();

        handle_packet(&segment(80, our_port, 43, 1001, flags::PSH | flags::ACK, b"response"), [10, 0, 2, 2]);

        let mut buf = [0u8; 32];
        let n = try_recv(sock, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"response");

        // The ACK acknowledges all 8 bytes
        let frames = testing::take_tx();
        let (_, _, _, ack, seg_flags, _) = last_tcp(&frames);
        assert_eq!(seg_flags, flags::ACK);
        assert_eq!(ack, 43 + 8);
    }

    #[test]
    fn peer_fin_moves_us_to_close_wait() {
        let _guard = setup();
        let sock = connect_start([10, 0, 2, 2], 80).unwrap();
        let our_port = {
            let frames = testing::take_tx();
            last_tcp(&frames).0
        };
        handle_packet(&segment(80, our_port, 42, 1001, flags::SYN | flags::ACK, &[]), [10, 0, 2, 2]);
        testing::clear_tx();

        handle_packet(&segment(80, our_port, 43, 1001, flags::FIN | flags::ACK, &[]), [10, 0, 2, 2]);
        assert_eq!(state_of(sock), Some(TcpState::CloseWait));
        let frames = testing::take_tx();
        let (_, _, _, ack, _, _) = last_tcp(&frames);
        assert_eq!(ack, 44);

        // Passive close: FIN+ACK, LAST_ACK, then the peer's ACK frees us
        close(sock).unwrap();
        assert_eq!(state_of(sock), Some(TcpState::LastAck));
        handle_packet(&segment(80, our_port, 44, 1002, flags::ACK, &[]), [10, 0, 2, 2]);
        assert_eq!(state_of(sock), None);
    }

    #[test]
    fn listener_spawns_connections_with_syn_ack() {
        let _guard = setup();
        let listener = listen(8080).unwrap();
        assert_eq!(state_of(listener), Some(TcpState::Listen));

        handle_packet(&segment(5555, 8080, 7000, 0, flags::SYN, &[]), [10, 0, 2, 2]);

        let frames = testing::take_tx();
        let (src_port, dest_port, seq, ack, seg_flags, _) = last_tcp(&frames);
        assert_eq!(src_port, 8080);
        assert_eq!(dest_port, 5555);
        assert_eq!(seq, 2000);
        assert_eq!(ack, 7001);
        assert_eq!(seg_flags, flags::SYN | flags::ACK);

        // The spawned connection completes on the peer's ACK
        let spawned = table_snapshot()
            .iter()
            .position(|(port, _, rport, state)| {
                *port == 8080 && *rport == 5555 && *state == TcpState::SynReceived
            });
        assert!(spawned.is_some());
        handle_packet(&segment(5555, 8080, 7001, 2001, flags::ACK, &[]), [10, 0, 2, 2]);
        let established = table_snapshot()
            .iter()
            .any(|(port, _, rport, state)| {
                *port == 8080 && *rport == 5555 && *state == TcpState::Established
            });
        assert!(established);
        // The listener itself is untouched
        assert_eq!(state_of(listener), Some(TcpState::Listen));
    }

    #[test]
    fn exact_match_beats_listener() {
        let _guard = setup();
        let _listener = listen(9000).unwrap();

        // Bring up a full connection on the same local port
        handle_packet(&segment(4000, 9000, 100, 0, flags::SYN, &[]), [10, 0, 2, 2]);
        handle_packet(&segment(4000, 9000, 101, 2001, flags::ACK, &[]), [10, 0, 2, 2]);
        testing::clear_tx();

        // Data from that peer lands in the established connection
        handle_packet(&segment(4000, 9000, 101, 2001, flags::PSH | flags::ACK, b"direct"), [10, 0, 2, 2]);

        let sock = table_snapshot()
            .iter()
            .position(|(port, _, rport, state)| {
                *port == 9000 && *rport == 4000 && *state == TcpState::Established
            })
            .unwrap();
        let mut buf = [0u8; 16];
        let n = try_recv(sock, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"direct");
    }
}
