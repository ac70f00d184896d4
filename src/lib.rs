//! User-space TCP/IP stack attached to a Linux tap device.
//!
//! The stack reads raw Ethernet frames from a tap interface, runs them
//! through a layered parse/dispatch pipeline and either answers them itself
//! (ARP, ICMP echo, neighbor discovery, native UDP echo) or delivers them to
//! sockets. The transmit side walks the inverse chain: socket send, protocol
//! assembly, L3-to-L2 resolution, Ethernet framing, TX ring, device write.
//!
//! # Features
//!
//! - Ethernet II, ARP, IPv4, IPv6, ICMPv4, ICMPv6/NDP, UDP and TCP codecs
//! - IPv4 and IPv6 fragment reassembly tolerant of reordering and duplicates
//! - ARP and Neighbor Discovery caches with pending-frame queues and
//!   duplicate-address-detection conflict signaling
//! - Full RFC 9293 TCP state machine with retransmission and flow control
//! - Blocking BSD-style sockets for UDP and TCP
//! - Per-frame statistics counters for every receive and transmit decision

pub mod addr;
pub mod arp;
pub mod buffer;
pub mod checksum;
pub mod config;
pub mod device;
pub mod ethernet;
pub mod fragment;
pub mod handler;
pub mod icmp;
pub mod icmpv6;
pub mod ipv4;
pub mod ipv6;
pub mod neighbor;
pub mod rand;
pub mod socket;
pub mod stack;
pub mod stats;
pub mod tcp;
pub mod udp;

use core::fmt;
use std::sync::OnceLock;
use std::time::Instant;

pub use addr::{Ip4Address, Ip4Host, Ip6Address, Ip6Host, IpAddress, MacAddress};
pub use config::StackConfig;
pub use handler::PacketHandler;
pub use socket::Socket;
pub use stack::TcpIpStack;

/// Network error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid packet format
    InvalidPacket,
    /// Buffer overflow
    BufferOverflow,
    /// Transmit ring saturated
    QueueFull,
    /// Network unreachable
    NetworkUnreachable,
    /// Host unreachable
    HostUnreachable,
    /// Port unreachable
    PortUnreachable,
    /// Connection refused
    ConnectionRefused,
    /// Operation timed out
    TimedOut,
    /// Connection reset
    ConnectionReset,
    /// Invalid address
    InvalidAddress,
    /// Address already in use
    AddressInUse,
    /// Address not owned by this stack
    AddressNotAvailable,
    /// Socket has no local address
    NotBound,
    /// Socket is not connected
    NotConnected,
    /// Operation would block
    WouldBlock,
    /// Socket or stack has been closed
    Closed,
    /// Operation not supported
    NotSupported,
    /// Invalid argument
    InvalidArgument,
    /// Invalid state for the requested operation
    InvalidState,
    /// Hardware or device error
    HardwareError,
    /// Resource not found
    NotFound,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::InvalidPacket => write!(f, "Invalid packet format"),
            NetworkError::BufferOverflow => write!(f, "Buffer overflow"),
            NetworkError::QueueFull => write!(f, "Transmit ring saturated"),
            NetworkError::NetworkUnreachable => write!(f, "Network unreachable"),
            NetworkError::HostUnreachable => write!(f, "Host unreachable"),
            NetworkError::PortUnreachable => write!(f, "Port unreachable"),
            NetworkError::ConnectionRefused => write!(f, "Connection refused"),
            NetworkError::TimedOut => write!(f, "Operation timed out"),
            NetworkError::ConnectionReset => write!(f, "Connection reset"),
            NetworkError::InvalidAddress => write!(f, "Invalid address"),
            NetworkError::AddressInUse => write!(f, "Address already in use"),
            NetworkError::AddressNotAvailable => write!(f, "Address not available"),
            NetworkError::NotBound => write!(f, "Socket not bound"),
            NetworkError::NotConnected => write!(f, "Socket not connected"),
            NetworkError::WouldBlock => write!(f, "Operation would block"),
            NetworkError::Closed => write!(f, "Socket closed"),
            NetworkError::NotSupported => write!(f, "Operation not supported"),
            NetworkError::InvalidArgument => write!(f, "Invalid argument"),
            NetworkError::InvalidState => write!(f, "Invalid state"),
            NetworkError::HardwareError => write!(f, "Hardware error"),
            NetworkError::NotFound => write!(f, "Resource not found"),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Network result type
pub type NetworkResult<T> = Result<T, NetworkError>;

/// IP protocol numbers carried in the IPv4 protocol / IPv6 next-header field.
pub mod ip_proto {
    pub const HOPOPT: u8 = 0;
    pub const ICMP4: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const IP6_ROUTE: u8 = 43;
    pub const IP6_FRAG: u8 = 44;
    pub const ICMP6: u8 = 58;
    pub const NO_NEXT: u8 = 59;
    pub const IP6_OPTS: u8 = 60;
}

/// Milliseconds since the first call in this process.
///
/// Monotonic; used for cache aging, fragment-flow expiry and TCP timers.
pub(crate) fn current_time_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
