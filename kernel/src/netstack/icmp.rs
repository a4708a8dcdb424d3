//! ICMP echo
//!
//! Answers echo requests by mirroring the packet with the type flipped,
//! and tracks the one outstanding echo request `ping` has in flight.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use super::{ip, NetError};

pub const ICMP_HEADER_LEN: usize = 8;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// Payload carried by our echo requests
const PING_PAYLOAD_LEN: usize = 32;

/// Ping wait budget: outer iterations of packet processing
const PING_WAIT_ITERATIONS: u32 = 30_000;

// The one outstanding request (id, seq) and its reply flag
static LAST_ID: AtomicU16 = AtomicU16::new(0);
static LAST_SEQ: AtomicU16 = AtomicU16::new(0);
static REPLY_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Ingest one ICMP message
pub fn handle_packet(data: &[u8], src_ip: [u8; 4]) {
    if data.len() < ICMP_HEADER_LEN {
        return;
    }

    match data[0] {
        ECHO_REQUEST => {
            // Clone the whole message, flip the type, recompute the
            // checksum over everything
            let mut reply: Vec<u8> = data.into();
            reply[0] = ECHO_REPLY;
            reply[2] = 0;
            reply[3] = 0;
            let csum = ip::checksum(&reply);
            reply[2..4].copy_from_slice(&csum.to_be_bytes());

            let _ = ip::send_packet(src_ip, ip::protocol::ICMP, &reply);
        }
        ECHO_REPLY => {
            let id = u16::from_be_bytes([data[4], data[5]]);
            let seq = u16::from_be_bytes([data[6], data[7]]);
            if id == LAST_ID.load(Ordering::Relaxed) && seq == LAST_SEQ.load(Ordering::Relaxed) {
                REPLY_RECEIVED.store(true, Ordering::Release);
            }
        }
        _ => {}
    }
}

/// Send an echo request with 32 bytes of counting payload
pub fn send_echo_request(dest_ip: [u8; 4], id: u16, seq: u16) -> Result<(), NetError> {
    let mut packet = [0u8; ICMP_HEADER_LEN + PING_PAYLOAD_LEN];
    packet[0] = ECHO_REQUEST;
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, byte) in packet[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    let csum = ip::checksum(&packet);
    packet[2..4].copy_from_slice(&csum.to_be_bytes());

    LAST_ID.store(id, Ordering::Relaxed);
    LAST_SEQ.store(seq, Ordering::Relaxed);
    REPLY_RECEIVED.store(false, Ordering::Release);

    ip::send_packet(dest_ip, ip::protocol::ICMP, &packet)
}

/// Ping a host `count` times. Returns how many replies came back.
pub fn ping(dest_ip: [u8; 4], count: u32) -> u32 {
    if !crate::drivers::e1000::link_up() {
        crate::log_error!("ping: link is down");
        return 0;
    }

    let mut successes = 0;
    for seq in 1..=count {
        if let Err(e) = send_echo_request(dest_ip, 1, seq as u16) {
            crate::log_error!("ping: send failed: {:?}", e);
            continue;
        }

        let mut got_reply = false;
        for _ in 0..PING_WAIT_ITERATIONS {
            super::poll();
            if REPLY_RECEIVED.load(Ordering::Acquire) {
                got_reply = true;
                break;
            }
            for _ in 0..1000 {
                core::hint::spin_loop();
            }
        }

        if got_reply {
            successes += 1;
            crate::log!(
                "ping: reply from {}.{}.{}.{} seq={}",
                dest_ip[0], dest_ip[1], dest_ip[2], dest_ip[3], seq
            );
        } else {
            crate::log_warn!("ping: timeout for seq={}", seq);
        }
    }
    successes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::{arp, testing};

    fn setup() -> spin::MutexGuard<'static, ()> {
        let guard = testing::serialize_tests();
        crate::memory::heap::test_support::init_test_heap();
        arp::init();
        crate::netstack::set_mac([0x02, 0, 0, 0xAA, 0xBB, 0xCC]);
        crate::netstack::set_ip([10, 0, 2, 15]);
        crate::netstack::set_netmask([255, 255, 255, 0]);
        // Pre-resolve the peer so replies need no live ARP exchange
        let mut arp_packet = [0u8; arp::ARP_PACKET_LEN];
        arp_packet[0..2].copy_from_slice(&1u16.to_be_bytes());
        arp_packet[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
        arp_packet[4] = 6;
        arp_packet[5] = 4;
        arp_packet[6..8].copy_from_slice(&2u16.to_be_bytes());
        arp_packet[8..14].copy_from_slice(&[0x52, 0x54, 0, 9, 9, 9]);
        arp_packet[14..18].copy_from_slice(&[10, 0, 2, 5]);
        arp::handle_packet(&arp_packet);
        testing::clear_tx();
        guard
    }

    #[test]
    fn echo_request_is_mirrored_with_valid_checksum() {
        let _guard = setup();

        // Request: id 0x1234, seq 1, payload 0..31
        let mut request = [0u8; ICMP_HEADER_LEN + 32];
        request[0] = ECHO_REQUEST;
        request[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        request[6..8].copy_from_slice(&1u16.to_be_bytes());
        for i in 0..32 {
            request[ICMP_HEADER_LEN + i] = i as u8;
        }
        let csum = ip::checksum(&request);
        request[2..4].copy_from_slice(&csum.to_be_bytes());

        handle_packet(&request, [10, 0, 2, 5]);

        let frames = testing::take_tx();
        assert_eq!(frames.len(), 1);
        let reply = &frames[0][14 + ip::IP_HEADER_LEN..14 + ip::IP_HEADER_LEN + request.len()];
        assert_eq!(reply[0], ECHO_REPLY);
        assert_eq!(reply[1], 0);
        assert_eq!(&reply[4..6], &0x1234u16.to_be_bytes());
        assert_eq!(&reply[6..8], &1u16.to_be_bytes());
        assert_eq!(&reply[ICMP_HEADER_LEN..], &request[ICMP_HEADER_LEN..]);
        // Checksum over the whole message folds to zero
        assert_eq!(ip::checksum(reply), 0);
    }

    #[test]
    fn matching_reply_sets_the_flag() {
        let _guard = setup();
        send_echo_request([10, 0, 2, 5], 7, 3).unwrap();
        assert!(!REPLY_RECEIVED.load(Ordering::Acquire));

        let mut reply = [0u8; ICMP_HEADER_LEN + 32];
        reply[0] = ECHO_REPLY;
        reply[4..6].copy_from_slice(&7u16.to_be_bytes());
        reply[6..8].copy_from_slice(&3u16.to_be_bytes());
        handle_packet(&reply, [10, 0, 2, 5]);
        assert!(REPLY_RECEIVED.load(Ordering::Acquire));
    }

    #[test]
    fn mismatched_reply_is_ignored() {
        let _guard = setup();
        send_echo_request([10, 0, 2, 5], 7, 4).unwrap();

        let mut reply = [0u8; ICMP_HEADER_LEN];
        reply[0] = ECHO_REPLY;
        reply[4..6].copy_from_slice(&7u16.to_be_bytes());
        reply[6..8].copy_from_slice(&99u16.to_be_bytes()); // wrong seq
        handle_packet(&reply, [10, 0, 2, 5]);
        assert!(!REPLY_RECEIVED.load(Ordering::Acquire));
    }

    #[test]
    fn our_requests_carry_counting_payload() {
        let _guard = setup();
        send_echo_request([10, 0, 2, 5], 1, 1).unwrap();
        let frames = testing::take_tx();
        assert_eq!(frames.len(), 1);
        let icmp = &frames[0][14 + ip::IP_HEADER_LEN..];
        assert_eq!(icmp[0], ECHO_REQUEST);
        for i in 0..32 {
            assert_eq!(icmp[ICMP_HEADER_LEN + i], i as u8);
        }
        assert_eq!(ip::checksum(&icmp[..ICMP_HEADER_LEN + 32]), 0);
    }
}
