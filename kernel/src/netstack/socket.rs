//! Socket layer
//!
//! A thin multiplexer mapping user socket ids onto the TCP and UDP
//! tables, plus the minimal HTTP client the shell's `wget` is built on.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use super::{tcp, udp, NetError};

/// Socket table size
pub const MAX_SOCKETS: usize = 32;

/// Socket types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// TCP
    Stream,
    /// UDP
    Dgram,
}

#[derive(Debug, Clone, Copy)]
struct Socket {
    used: bool,
    kind: SocketType,
    /// Index into the TCP or UDP table; usize::MAX until bound
    proto_sock: usize,
}

const NO_PROTO: usize = usize::MAX;

static SOCKETS: Mutex<[Socket; MAX_SOCKETS]> = Mutex::new(
    [Socket { used: false, kind: SocketType::Dgram, proto_sock: NO_PROTO }; MAX_SOCKETS],
);

pub fn init() {
    let mut sockets = SOCKETS.lock();
    for socket in sockets.iter_mut() {
        socket.used = false;
        socket.proto_sock = NO_PROTO;
    }
}

fn get(sock: usize) -> Result<Socket, NetError> {
    SOCKETS
        .lock()
        .get(sock)
        .filter(|s| s.used)
        .copied()
        .ok_or(NetError::InvalidSocket)
}

/// Open a socket of the given type. Datagram sockets get their UDP slot
/// immediately; stream sockets bind a TCP slot at connect/listen time.
pub fn create(kind: SocketType) -> Result<usize, NetError> {
    let mut sockets = SOCKETS.lock();
    let slot = sockets
        .iter()
        .position(|s| !s.used)
        .ok_or(NetError::TableFull)?;

    let proto_sock = match kind {
        SocketType::Stream => NO_PROTO,
        SocketType::Dgram => {
            drop(sockets);
            let udp_sock = udp::socket()?;
            sockets = SOCKETS.lock();
            udp_sock
        }
    };

    sockets[slot] = Socket { used: true, kind, proto_sock };
    Ok(slot)
}

/// Bind a datagram socket to a local port
pub fn bind(sock: usize, port: u16) -> Result<(), NetError> {
    let socket = get(sock)?;
    match socket.kind {
        SocketType::Dgram => udp::bind(socket.proto_sock, port),
        // Stream sockets pick their port at listen time
        SocketType::Stream => Ok(()),
    }
}

/// Listen on a port (stream only)
pub fn listen(sock: usize, port: u16) -> Result<(), NetError> {
    let socket = get(sock)?;
    if socket.kind != SocketType::Stream {
        return Err(NetError::InvalidSocket);
    }
    let tcp_sock = tcp::listen(port)?;
    SOCKETS.lock()[sock].proto_sock = tcp_sock;
    Ok(())
}

/// Accept a connection off a listening stream socket
pub fn accept(sock: usize) -> Result<usize, NetError> {
    let socket = get(sock)?;
    if socket.kind != SocketType::Stream || socket.proto_sock == NO_PROTO {
        return Err(NetError::InvalidSocket);
    }

    let tcp_sock = tcp::accept(socket.proto_sock)?;

    let mut sockets = SOCKETS.lock();
    let slot = sockets.iter().position(|s| !s.used).ok_or_else(|| {
        tcp::free(tcp_sock);
        NetError::TableFull
    })?;
    sockets[slot] = Socket { used: true, kind: SocketType::Stream, proto_sock: tcp_sock };
    Ok(slot)
}

/// Connect to a remote endpoint
pub fn connect(sock: usize, ip: [u8; 4], port: u16) -> Result<(), NetError> {
    let socket = get(sock)?;
    match socket.kind {
        SocketType::Stream => {
            let tcp_sock = tcp::connect(ip, port)?;
            SOCKETS.lock()[sock].proto_sock = tcp_sock;
            Ok(())
        }
        SocketType::Dgram => udp::connect(socket.proto_sock, ip, port),
    }
}

/// Send on a connected socket
pub fn send(sock: usize, data: &[u8]) -> Result<usize, NetError> {
    let socket = get(sock)?;
    if socket.proto_sock == NO_PROTO {
        return Err(NetError::NotConnected);
    }
    match socket.kind {
        SocketType::Stream => tcp::send(socket.proto_sock, data),
        SocketType::Dgram => udp::send(socket.proto_sock, data),
    }
}

/// Receive from a connected socket
pub fn recv(sock: usize, buffer: &mut [u8]) -> Result<usize, NetError> {
    let socket = get(sock)?;
    if socket.proto_sock == NO_PROTO {
        return Err(NetError::NotConnected);
    }
    match socket.kind {
        SocketType::Stream => tcp::recv(socket.proto_sock, buffer),
        SocketType::Dgram => udp::recv(socket.proto_sock, buffer),
    }
}

/// Send a datagram to an explicit destination
pub fn sendto(sock: usize, data: &[u8], ip: [u8; 4], port: u16) -> Result<usize, NetError> {
    let socket = get(sock)?;
    if socket.kind != SocketType::Dgram {
        return Err(NetError::InvalidSocket);
    }
    udp::sendto(socket.proto_sock, data, ip, port)
}

/// Receive a datagram with its source
pub fn recvfrom(sock: usize, buffer: &mut [u8]) -> Result<(usize, [u8; 4], u16), NetError> {
    let socket = get(sock)?;
    if socket.kind != SocketType::Dgram {
        return Err(NetError::InvalidSocket);
    }
    udp::recvfrom(socket.proto_sock, buffer)
}

/// Close a socket, tearing down its protocol state
pub fn close(sock: usize) -> Result<(), NetError> {
    let socket = get(sock)?;
    if socket.proto_sock != NO_PROTO {
        match socket.kind {
            SocketType::Stream => {
                let _ = tcp::close(socket.proto_sock);
            }
            SocketType::Dgram => {
                let _ = udp::close(socket.proto_sock);
            }
        }
    }
    SOCKETS.lock()[sock].used = false;
    Ok(())
}

/// Parse a dotted-quad IPv4 address
pub fn parse_ip(s: &str) -> Result<[u8; 4], NetError> {
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in s.split('.') {
        if count >= 4 {
            return Err(NetError::InvalidAddress);
        }
        octets[count] = part.parse::<u8>().map_err(|_| NetError::InvalidAddress)?;
        count += 1;
    }
    if count != 4 {
        return Err(NetError::InvalidAddress);
    }
    Ok(octets)
}

/// Minimal HTTP/1.0 GET. `host` must be a dotted-quad address (there is
/// no DNS). Drains the reply into `response` until the peer closes.
pub fn http_get(host: &str, port: u16, path: &str, response: &mut [u8]) -> Result<usize, NetError> {
    let ip = parse_ip(host)?;

    let sock = create(SocketType::Stream)?;
    if let Err(e) = connect(sock, ip, port) {
        let _ = close(sock);
        return Err(e);
    }

    let mut request = String::new();
    request.push_str("GET ");
    request.push_str(path);
    request.push_str(" HTTP/1.0\r\nHost: ");
    request.push_str(host);
    request.push_str("\r\nConnection: close\r\n\r\n");

    if let Err(e) = send(sock, request.as_bytes()) {
        let _ = close(sock);
        return Err(e);
    }

    let mut total = 0;
    while total < response.len() {
        match recv(sock, &mut response[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => break,
        }
    }

    let _ = close(sock);
    Ok(total)
}

/// Live sockets as (id, type), for `netstat`
pub fn table_snapshot() -> Vec<(usize, SocketType)> {
    SOCKETS
        .lock()
        .iter()
        .enumerate()
        .filter(|(_, s)| s.used)
        .map(|(i, s)| (i, s.kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::testing;

    #[test]
    fn parses_dotted_quads() {
        assert_eq!(parse_ip("10.0.2.2"), Ok([10, 0, 2, 2]));
        assert_eq!(parse_ip("255.255.255.255"), Ok([255, 255, 255, 255]));
        assert_eq!(parse_ip("0.0.0.0"), Ok([0, 0, 0, 0]));
        assert!(parse_ip("10.0.2").is_err());
        assert!(parse_ip("10.0.2.2.2").is_err());
        assert!(parse_ip("10.0.2.256").is_err());
        assert!(parse_ip("ten.zero.two.two").is_err());
        assert!(parse_ip("").is_err());
    }

    #[test]
    fn dgram_sockets_multiplex_onto_udp() {
        let _guard = testing::serialize_tests();
        crate::memory::heap::test_support::init_test_heap();
        init();
        udp::init();

        let sock = create(SocketType::Dgram).unwrap();
        bind(sock, 5353).unwrap();
        assert!(udp::table_snapshot().iter().any(|(port, bound)| *port == 5353 && *bound));
        close(sock).unwrap();
        assert!(udp::table_snapshot().iter().all(|(port, _)| *port != 5353));
    }

    #[test]
    fn socket_table_exhausts_cleanly() {
        let _guard = testing::serialize_tests();
        crate::memory::heap::test_support::init_test_heap();
        init();
        tcp::init();

        let mut opened = alloc::vec::Vec::new();
        for _ in 0..MAX_SOCKETS {
            opened.push(create(SocketType::Stream).unwrap());
        }
        assert!(matches!(create(SocketType::Stream), Err(NetError::TableFull)));
        for sock in opened {
            close(sock).unwrap();
        }
    }
}
