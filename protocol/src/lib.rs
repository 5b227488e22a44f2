//! # Shared Protocol Library
//!
//! Wire formats for the two protocols spoken by the server:
//!
//! - The **gateway protocol** ([`gateway`]): a framed stream protocol with a
//!   5-byte header, used between clients and the gateway and between game
//!   servers and the gateway (registration, game creation, join routing).
//! - The **game server protocol** ([`gameserver`]): a datagram protocol with
//!   a 21-byte header carrying sequence numbers, a selective-ACK window,
//!   a delivery channel and a client id, used between clients and game
//!   servers during play.
//!
//! All multi-byte integers on the wire are big-endian. IP addresses are
//! always carried as 16 bytes; IPv4 addresses use the IPv4-mapped IPv6 form
//! (`::ffff:a.b.c.d`).
//!
//! This crate only encodes and decodes bytes. Session state, retransmission
//! and authentication live in the server crate.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub mod error;
pub mod gameserver;
pub mod gateway;

pub use error::FrameError;

/// Magic prefix of every gateway (stream) frame.
pub const GW_MAGIC: u16 = 0x4257;
/// Magic prefix of every game server (datagram) frame.
pub const GS_MAGIC: u16 = 0x4254;
/// Only protocol version accepted on either transport.
pub const VERSION: u8 = 0x01;

/// A network endpoint as it appears on the wire: 16 address bytes plus a
/// port. IPv4 addresses are stored IPv4-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WireAddr {
    pub ip: [u8; 16],
    pub port: u16,
}

impl WireAddr {
    pub fn new(ip: [u8; 16], port: u16) -> Self {
        Self { ip, port }
    }

    /// Maps a socket address into wire form, widening IPv4 to
    /// IPv4-mapped IPv6.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            ip,
            port: addr.port(),
        }
    }

    /// Recovers a socket address, narrowing IPv4-mapped addresses back to
    /// plain IPv4.
    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }
}

impl fmt::Display for WireAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Returns true when sequence `a` is newer than `b` under wrapping
/// 32-bit arithmetic.
pub fn seq_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Returns true when `a` is `b` or older under wrapping arithmetic.
pub fn seq_older_eq(a: u32, b: u32) -> bool {
    !seq_newer(a, b)
}
