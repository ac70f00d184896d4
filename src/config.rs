//! Stack configuration
//!
//! An immutable configuration value constructed before the stack starts and
//! shared by reference with every component. There is no runtime-mutable
//! global configuration.

use crate::addr::{Ip4Host, Ip6Host, MacAddress};

/// Immutable stack configuration.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Handle IPv4 traffic.
    pub ip4_support: bool,
    /// Handle IPv6 traffic.
    pub ip6_support: bool,
    /// Verify checksums and other wire-level integrity on receive.
    pub packet_integrity_check: bool,
    /// Drop packets with semantically suspicious fields.
    pub packet_sanity_check: bool,
    /// MTU of the attached tap device; bounds IP fragmentation thresholds.
    pub tap_mtu: usize,
    /// Disable the in-stack UDP echo (port 7) responder.
    pub udp_echo_native_disable: bool,
    /// Learn sender mappings from ARP requests addressed to this stack.
    pub arp_cache_update_from_direct_request: bool,
    /// Learn sender mappings from gratuitous ARP replies.
    pub arp_cache_update_from_gratuitous_reply: bool,
    /// MSS advertised on TCP connection setup.
    pub tcp_mss: usize,
    /// TCP receive buffer size per session.
    pub tcp_rx_buf: usize,
    /// TCP transmit buffer size per session.
    pub tcp_tx_buf: usize,
    /// Link-layer address of the stack.
    pub mac_address: MacAddress,
    /// IPv4 assignment claimed (after an ARP probe) at startup.
    pub ip4_host: Option<Ip4Host>,
    /// IPv6 assignment claimed (after DAD) at startup, in addition to the
    /// EUI-64 link-local address.
    pub ip6_host: Option<Ip6Host>,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            ip4_support: true,
            ip6_support: true,
            packet_integrity_check: true,
            packet_sanity_check: true,
            tap_mtu: 1500,
            udp_echo_native_disable: false,
            arp_cache_update_from_direct_request: true,
            arp_cache_update_from_gratuitous_reply: true,
            tcp_mss: 1460,
            tcp_rx_buf: 65536,
            tcp_tx_buf: 65536,
            mac_address: MacAddress::new([0x02, 0x00, 0x00, 0x77, 0x77, 0x77]),
            ip4_host: None,
            ip6_host: None,
        }
    }
}
