//! UDP protocol processing (RFC 768)
//!
//! Datagram parsing and assembly with pseudo-header checksums, delivery to
//! bound sockets, the native echo shortcut, and destination-unreachable
//! generation for closed ports.

use core::ops::Range;

use crate::addr::IpAddress;
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::checksum;
use crate::handler::PacketHandler;
use crate::ip_proto;
use crate::{icmp, icmpv6, ipv4, ipv6};

/// UDP header size.
pub const UDP_HEADER_LEN: usize = 8;

/// Port answered by the in-stack native echo responder.
pub const UDP_ECHO_PORT: u16 = 7;

/// Parsed UDP header view.
#[derive(Debug, Clone)]
pub struct UdpHdr {
    pub sport: u16,
    pub dport: u16,
    pub len: usize,
    pub cksum: u16,
    pub payload: Range<usize>,
}

impl UdpHdr {
    /// Parse the header spanning `at` in `frame`.
    pub fn parse(frame: &[u8], at: Range<usize>) -> Result<UdpHdr, &'static str> {
        let data = &frame[at.clone()];
        if data.len() < UDP_HEADER_LEN {
            return Err("udp: datagram shorter than header");
        }
        let len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if len < UDP_HEADER_LEN || len > data.len() {
            return Err("udp: bad length field");
        }
        Ok(UdpHdr {
            sport: u16::from_be_bytes([data[0], data[1]]),
            dport: u16::from_be_bytes([data[2], data[3]]),
            len,
            cksum: u16::from_be_bytes([data[6], data[7]]),
            payload: at.start + UDP_HEADER_LEN..at.start + len,
        })
    }

    /// Verify the pseudo-header checksum. An all-zero checksum is legal
    /// over IPv4 (checksum disabled) but not over IPv6.
    pub fn verify_checksum(&self, frame: &[u8], src: &IpAddress, dst: &IpAddress) -> bool {
        if self.cksum == 0 {
            return src.is_ip4();
        }
        let start = self.payload.start - UDP_HEADER_LEN;
        let segment = &frame[start..start + self.len];
        let pseudo = checksum::pseudo_sum(src, dst, ip_proto::UDP, self.len);
        checksum::checksum(segment, pseudo) == 0
    }
}

/// Handle an inbound UDP datagram carried over IPv4.
pub fn phrx_udp(ph: &PacketHandler, rx: &mut PacketRx) {
    let at = match rx.ip4.as_ref() {
        Some(ip4) => ip4.payload.clone(),
        None => return,
    };
    phrx_udp_at(ph, rx, at.start, at.end);
}

/// Handle an inbound UDP datagram at `[at, end)` of either family.
pub fn phrx_udp_at(ph: &PacketHandler, rx: &mut PacketRx, at: usize, end: usize) {
    ph.stats_rx.write().udp__pre_parse += 1;

    let (src, dst) = match (&rx.ip6, &rx.ip4) {
        (Some(ip6), _) => (IpAddress::Ip6(ip6.src), IpAddress::Ip6(ip6.dst)),
        (None, Some(ip4)) => (IpAddress::Ip4(ip4.src), IpAddress::Ip4(ip4.dst)),
        (None, None) => return,
    };

    let hdr = match UdpHdr::parse(&rx.frame, at..end) {
        Ok(hdr) => hdr,
        Err(reason) => {
            ph.stats_rx.write().udp__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "udp", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    if ph.config.packet_integrity_check && !hdr.verify_checksum(&rx.frame, &src, &dst) {
        ph.stats_rx.write().udp__failed_parse += 1;
        rx.parse_failed = Some("udp: bad checksum");
        log::warn!(target: "udp", "{} - bad checksum", rx.tracker);
        return;
    }

    if ph.config.packet_sanity_check && hdr.dport == 0 {
        ph.stats_rx.write().udp__failed_sanity += 1;
        rx.parse_failed = Some("udp: destination port zero");
        log::warn!(target: "udp", "{} - destination port zero", rx.tracker);
        return;
    }

    log::debug!(
        target: "udp",
        "{} - {}:{} > {}:{}, len {}",
        rx.tracker, src, hdr.sport, dst, hdr.dport, hdr.len
    );

    let sport = hdr.sport;
    let dport = hdr.dport;
    let payload = rx.frame[hdr.payload.clone()].to_vec();
    rx.udp = Some(hdr);

    // In-stack echo: bounce port 7 straight back without a socket.
    if dport == UDP_ECHO_PORT && !ph.config.udp_echo_native_disable {
        ph.stats_rx.write().udp__echo_native__respond_udp += 1;
        log::debug!(target: "udp", "{} - echoing natively", rx.tracker);
        phtx_udp(
            ph,
            &payload,
            dst,
            UDP_ECHO_PORT,
            src,
            sport,
            Some(rx.tracker),
        );
        return;
    }

    if let Some(endpoint) = ph.sockets.lookup_udp(&dst, dport) {
        ph.stats_rx.write().udp__socket_match += 1;
        endpoint.deliver(payload, src, sport);
        return;
    }

    // Nothing is listening on this port; answer with the unreachable of the
    // matching family, quoting the offending datagram.
    match (&rx.ip4, &rx.ip6) {
        (Some(ip4), _) => {
            ph.stats_rx
                .write()
                .udp__no_socket_match__respond_icmp4_unreachable += 1;
            let original = rx.frame[ip4.packet.clone()].to_vec();
            icmp::phtx_icmp4_unreachable_port(ph, &original, ip4.dst, ip4.src, Some(rx.tracker));
        }
        (None, Some(ip6)) => {
            ph.stats_rx
                .write()
                .udp__no_socket_match__respond_icmp6_unreachable += 1;
            let original = rx.frame[ip6.packet.clone()].to_vec();
            let reply_src = if ph.ip6_unicast_owned(ip6.dst) {
                ip6.dst
            } else {
                match ph.ip6_src_for(ip6.src) {
                    Some(src) => src,
                    None => return,
                }
            };
            icmpv6::phtx_icmp6_unreachable_port(
                ph,
                &original,
                reply_src,
                ip6.src,
                Some(rx.tracker),
            );
        }
        (None, None) => {}
    }
}

/// Assemble and transmit a UDP datagram.
pub fn phtx_udp(
    ph: &PacketHandler,
    payload: &[u8],
    src: IpAddress,
    sport: u16,
    dst: IpAddress,
    dport: u16,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.udp__pre_assemble += 1;
        stats.udp__send += 1;
    }

    let len = UDP_HEADER_LEN + payload.len();
    let mut tx = PacketTx::new(payload, echo_tracker);
    let header = tx.prepend(UDP_HEADER_LEN);
    header[0..2].copy_from_slice(&sport.to_be_bytes());
    header[2..4].copy_from_slice(&dport.to_be_bytes());
    header[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    header[6] = 0;
    header[7] = 0;
    let pseudo = checksum::pseudo_sum(&src, &dst, ip_proto::UDP, len);
    let mut cksum = checksum::checksum(tx.as_slice(), pseudo);
    if cksum == 0 {
        // A computed zero is transmitted as all-ones; zero means "absent".
        cksum = 0xffff;
    }
    tx.patch(6, &cksum.to_be_bytes());

    match (src, dst) {
        (IpAddress::Ip4(src), IpAddress::Ip4(dst)) => {
            ipv4::phtx_ip4(ph, tx, src, dst, ip_proto::UDP, false, echo_tracker);
        }
        (IpAddress::Ip6(src), IpAddress::Ip6(dst)) => {
            ipv6::phtx_ip6(
                ph,
                tx,
                src,
                dst,
                ip_proto::UDP,
                ipv6::DEFAULT_HOP_LIMIT,
                echo_tracker,
            );
        }
        _ => {
            log::error!(target: "udp", "{:?} - mixed address families, dropping", echo_tracker);
        }
    }
}
