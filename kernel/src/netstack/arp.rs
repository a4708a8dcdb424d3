//! ARP
//!
//! A 32-entry IPv4-to-MAC cache. Every ARP packet teaches us its sender;
//! requests for our own address get a reply. Upper layers call `lookup`
//! before sending IP and `send_request` when it misses.

use spin::Mutex;

use super::{ethertype, NetError, BROADCAST_MAC};

/// Cache capacity
pub const ARP_CACHE_SIZE: usize = 32;

/// Wire size of an ARP packet for Ethernet/IPv4
pub const ARP_PACKET_LEN: usize = 28;

const HARDWARE_ETHERNET: u16 = 1;
pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, Default)]
struct ArpEntry {
    ip: [u8; 4],
    mac: [u8; 6],
    valid: bool,
}

static CACHE: Mutex<[ArpEntry; ARP_CACHE_SIZE]> =
    Mutex::new([ArpEntry { ip: [0; 4], mac: [0; 6], valid: false }; ARP_CACHE_SIZE]);

pub fn init() {
    *CACHE.lock() = [ArpEntry::default(); ARP_CACHE_SIZE];
}

/// MAC for an IP, if cached
pub fn lookup(ip: [u8; 4]) -> Option<[u8; 6]> {
    CACHE
        .lock()
        .iter()
        .find(|e| e.valid && e.ip == ip)
        .map(|e| e.mac)
}

/// Learn (or refresh) a mapping. When the cache is full the first slot
/// is sacrificed.
fn cache_add(ip: [u8; 4], mac: [u8; 6]) {
    let mut cache = CACHE.lock();

    if let Some(entry) = cache.iter_mut().find(|e| e.valid && e.ip == ip) {
        entry.mac = mac;
        return;
    }
    if let Some(entry) = cache.iter_mut().find(|e| !e.valid) {
        *entry = ArpEntry { ip, mac, valid: true };
        return;
    }
    cache[0] = ArpEntry { ip, mac, valid: true };
}

/// Number of valid cache entries
pub fn cache_len() -> usize {
    CACHE.lock().iter().filter(|e| e.valid).count()
}

/// Valid (ip, mac) pairs, for `netstat`-style listings
pub fn entries() -> alloc::vec::Vec<([u8; 4], [u8; 6])> {
    CACHE
        .lock()
        .iter()
        .filter(|e| e.valid)
        .map(|e| (e.ip, e.mac))
        .collect()
}

fn build_packet(
    operation: u16,
    sender_mac: [u8; 6],
    sender_ip: [u8; 4],
    target_mac: [u8; 6],
    target_ip: [u8; 4],
) -> [u8; ARP_PACKET_LEN] {
    let mut p = [0u8; ARP_PACKET_LEN];
    p[0..2].copy_from_slice(&HARDWARE_ETHERNET.to_be_bytes());
    p[2..4].copy_from_slice(&ethertype::IPV4.to_be_bytes());
    p[4] = 6; // hardware address length
    p[5] = 4; // protocol address length
    p[6..8].copy_from_slice(&operation.to_be_bytes());
    p[8..14].copy_from_slice(&sender_mac);
    p[14..18].copy_from_slice(&sender_ip);
    p[18..24].copy_from_slice(&target_mac);
    p[24..28].copy_from_slice(&target_ip);
    p
}

/// Broadcast a who-has for `target_ip`
pub fn send_request(target_ip: [u8; 4]) -> Result<(), NetError> {
    let cfg = super::config();
    let packet = build_packet(OP_REQUEST, cfg.mac, cfg.ip, [0; 6], target_ip);
    super::send_frame(BROADCAST_MAC, ethertype::ARP, &packet)
}

fn send_reply(target_mac: [u8; 6], target_ip: [u8; 4]) -> Result<(), NetError> {
    let cfg = super::config();
    let packet = build_packet(OP_REPLY, cfg.mac, cfg.ip, target_mac, target_ip);
    super::send_frame(target_mac, ethertype::ARP, &packet)
}

/// Ingest one ARP packet (the ethernet payload)
pub fn handle_packet(data: &[u8]) {
    if data.len() < ARP_PACKET_LEN {
        return;
    }

    let hardware_type = u16::from_be_bytes([data[0], data[1]]);
    let protocol_type = u16::from_be_bytes([data[2], data[3]]);
    if hardware_type != HARDWARE_ETHERNET || protocol_type != ethertype::IPV4 {
        return;
    }

    let operation = u16::from_be_bytes([data[6], data[7]]);
    let sender_mac: [u8; 6] = data[8..14].try_into().unwrap();
    let sender_ip: [u8; 4] = data[14..18].try_into().unwrap();
    let target_ip: [u8; 4] = data[24..28].try_into().unwrap();

    // Always learn the sender
    cache_add(sender_ip, sender_mac);

    if operation == OP_REQUEST && target_ip == super::local_ip() {
        let _ = send_reply(sender_mac, sender_ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::testing;

    fn setup() -> spin::MutexGuard<'static, ()> {
        let guard = testing::serialize_tests();
        crate::memory::heap::test_support::init_test_heap();
        init();
        crate::netstack::set_mac([0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC]);
        crate::netstack::set_ip([10, 0, 2, 15]);
        testing::clear_tx();
        guard
    }

    #[test]
    fn any_arp_packet_teaches_the_sender() {
        let _guard = setup();
        let mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        let packet = build_packet(OP_REPLY, mac, [10, 0, 2, 5], [0; 6], [10, 0, 2, 15]);
        handle_packet(&packet);
        assert_eq!(lookup([10, 0, 2, 5]), Some(mac));
    }

    #[test]
    fn request_for_our_ip_draws_a_reply() {
        let _guard = setup();
        let peer_mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        let request = build_packet(OP_REQUEST, peer_mac, [10, 0, 2, 5], [0; 6], [10, 0, 2, 15]);
        handle_packet(&request);

        let frames = testing::take_tx();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        // Unicast back to the asker
        assert_eq!(&frame[0..6], &peer_mac);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ethertype::ARP);

        let arp = &frame[14..];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), OP_REPLY);
        // Our MAC/IP as sender, the asker as target
        assert_eq!(&arp[8..14], &[0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC]);
        assert_eq!(&arp[14..18], &[10, 0, 2, 15]);
        assert_eq!(&arp[18..24], &peer_mac);
        assert_eq!(&arp[24..28], &[10, 0, 2, 5]);

        // And the exchange populated the cache
        assert_eq!(lookup([10, 0, 2, 5]), Some(peer_mac));
    }

    #[test]
    fn request_for_other_ip_is_learned_but_unanswered() {
        let _guard = setup();
        let peer_mac = [0xAA; 6];
        let request = build_packet(OP_REQUEST, peer_mac, [10, 0, 2, 9], [0; 6], [10, 0, 2, 99]);
        handle_packet(&request);

        assert!(testing::take_tx().is_empty());
        assert_eq!(lookup([10, 0, 2, 9]), Some(peer_mac));
    }

    #[test]
    fn outgoing_request_is_broadcast_with_zero_target() {
        let _guard = setup();
        send_request([10, 0, 2, 2]).unwrap();
        let frames = testing::take_tx();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(&frame[0..6], &BROADCAST_MAC);
        let arp = &frame[14..];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), OP_REQUEST);
        assert_eq!(&arp[18..24], &[0u8; 6]);
        assert_eq!(&arp[24..28], &[10, 0, 2, 2]);
    }

    #[test]
    fn full_cache_recycles_a_slot() {
        let _guard = setup();
        for i in 0..ARP_CACHE_SIZE as u8 {
            cache_add([192, 168, 1, i], [i; 6]);
        }
        assert_eq!(cache_len(), ARP_CACHE_SIZE);
        cache_add([172, 16, 0, 1], [0xEE; 6]);
        assert_eq!(cache_len(), ARP_CACHE_SIZE);
        assert_eq!(lookup([172, 16, 0, 1]), Some([0xEE; 6]));
    }
}
