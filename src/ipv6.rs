//! IPv6 packet processing (RFC 8200)
//!
//! Fixed-header parsing and assembly, extension-header walking, fragment
//! reassembly via the Fragment extension header, and transmit-side
//! fragmentation that inserts a Fragment extension header with a
//! per-destination monotonic identifier. A reassembled packet re-enters the
//! IPv6 receive path from the top.

use core::ops::Range;

use crate::addr::{Ip6Address, IpAddress, MacAddress};
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::ethernet::{self, ether_type, EtherHdr};
use crate::fragment::FlowKey;
use crate::handler::PacketHandler;
use crate::ip_proto;
use crate::{icmpv6, tcp, udp};

/// Fixed header size.
pub const IPV6_HEADER_LEN: usize = 40;

/// Fragment extension header size.
pub const IPV6_FRAG_HEADER_LEN: usize = 8;

/// Default hop limit for originated packets.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Parsed IPv6 fixed header view.
#[derive(Debug, Clone)]
pub struct Ipv6Hdr {
    pub payload_len: usize,
    pub next: u8,
    pub hop: u8,
    pub src: Ip6Address,
    pub dst: Ip6Address,
    pub payload: Range<usize>,
    /// Full packet (header + payload), for ICMP error quoting.
    pub packet: Range<usize>,
}

impl Ipv6Hdr {
    /// Parse the fixed header at `at` within `frame`.
    pub fn parse(frame: &[u8], at: Range<usize>) -> Result<Ipv6Hdr, &'static str> {
        let data = &frame[at.clone()];
        if data.len() < IPV6_HEADER_LEN {
            return Err("ip6: packet shorter than header");
        }
        if data[0] >> 4 != 6 {
            return Err("ip6: version not 6");
        }
        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if IPV6_HEADER_LEN + payload_len > data.len() {
            return Err("ip6: bad payload length");
        }
        let mut src = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&data[24..40]);
        Ok(Ipv6Hdr {
            payload_len,
            next: data[6],
            hop: data[7],
            src: Ip6Address::new(src),
            dst: Ip6Address::new(dst),
            payload: at.start + IPV6_HEADER_LEN..at.start + IPV6_HEADER_LEN + payload_len,
            packet: at.start..at.start + IPV6_HEADER_LEN + payload_len,
        })
    }

    /// Prepend a fixed header onto an assembled payload.
    pub fn assemble(tx: &mut PacketTx, src: Ip6Address, dst: Ip6Address, next: u8, hop: u8) {
        let payload_len = tx.len();
        let header = tx.prepend(IPV6_HEADER_LEN);
        header[0] = 0x60;
        header[1] = 0;
        header[2] = 0;
        header[3] = 0;
        header[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
        header[6] = next;
        header[7] = hop;
        header[8..24].copy_from_slice(&src.octets());
        header[24..40].copy_from_slice(&dst.octets());
    }
}

/// Parsed Fragment extension header view.
#[derive(Debug, Clone)]
pub struct Ipv6FragHdr {
    pub next: u8,
    /// Fragment offset in bytes.
    pub offset: usize,
    pub more: bool,
    pub id: u32,
    pub payload: Range<usize>,
}

impl Ipv6FragHdr {
    /// Parse a Fragment extension header at `at` within `frame`; `end`
    /// bounds the IPv6 payload.
    pub fn parse(frame: &[u8], at: usize, end: usize) -> Result<Ipv6FragHdr, &'static str> {
        if at + IPV6_FRAG_HEADER_LEN > end {
            return Err("ip6_ext_frag: header truncated");
        }
        let data = &frame[at..at + IPV6_FRAG_HEADER_LEN];
        let word = u16::from_be_bytes([data[2], data[3]]);
        Ok(Ipv6FragHdr {
            next: data[0],
            offset: ((word & 0xfff8) as usize), // already a byte count, low 3 bits are flags
            more: (word & 0x0001) != 0,
            id: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            payload: at + IPV6_FRAG_HEADER_LEN..end,
        })
    }

    /// Prepend a Fragment extension header onto a fragment payload.
    pub fn assemble(tx: &mut PacketTx, next: u8, offset: usize, more: bool, id: u32) {
        let word = (offset as u16 & 0xfff8) | (more as u16);
        let header = tx.prepend(IPV6_FRAG_HEADER_LEN);
        header[0] = next;
        header[1] = 0;
        header[2..4].copy_from_slice(&word.to_be_bytes());
        header[4..8].copy_from_slice(&id.to_be_bytes());
    }
}

/// Handle an inbound IPv6 packet.
pub fn phrx_ip6(ph: &PacketHandler, rx: &mut PacketRx) {
    ph.stats_rx.write().ip6__pre_parse += 1;

    let at = match rx.ether.as_ref() {
        Some(ether) => ether.payload.clone(),
        None => return,
    };

    let hdr = match Ipv6Hdr::parse(&rx.frame, at) {
        Ok(hdr) => hdr,
        Err(reason) => {
            ph.stats_rx.write().ip6__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "ip6", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    if ph.config.packet_sanity_check && hdr.src.is_multicast() {
        ph.stats_rx.write().ip6__failed_sanity += 1;
        rx.parse_failed = Some("ip6: multicast source address");
        log::warn!(target: "ip6", "{} - multicast source {}", rx.tracker, hdr.src);
        return;
    }

    log::debug!(
        target: "ip6",
        "{} - {} > {}, next {}, len {}",
        rx.tracker, hdr.src, hdr.dst, hdr.next, hdr.payload_len
    );

    if hdr.hop == 0 {
        ph.stats_rx.write().ip6__hop_exceeded_drop += 1;
        log::debug!(target: "ip6", "{} - hop limit exceeded, dropping", rx.tracker);
        return;
    }

    if ph.ip6_unicast_owned(hdr.dst) {
        ph.stats_rx.write().ip6__dst_unicast += 1;
    } else if hdr.dst.is_multicast() && ph.ip6_multicast_owned(hdr.dst) {
        ph.stats_rx.write().ip6__dst_multicast += 1;
    } else {
        ph.stats_rx.write().ip6__dst_unknown_drop += 1;
        log::debug!(target: "ip6", "{} - not for this stack, dropping", rx.tracker);
        return;
    }

    rx.ip6 = Some(hdr.clone());

    // Walk extension headers until an upper-layer protocol is found.
    let mut next = hdr.next;
    let mut cursor = hdr.payload.start;
    let end = hdr.payload.end;
    loop {
        match next {
            ip_proto::IP6_FRAG => {
                ph.stats_rx.write().ip6_ext_frag__pre_parse += 1;
                let frag = match Ipv6FragHdr::parse(&rx.frame, cursor, end) {
                    Ok(frag) => frag,
                    Err(reason) => {
                        ph.stats_rx.write().ip6_ext_frag__failed_parse += 1;
                        rx.parse_failed = Some(reason);
                        log::warn!(target: "ip6", "{} - {}", rx.tracker, reason);
                        return;
                    }
                };
                let key = FlowKey {
                    src: IpAddress::Ip6(hdr.src),
                    dst: IpAddress::Ip6(hdr.dst),
                    proto: frag.next,
                    id: frag.id,
                };
                let payload = rx.frame[frag.payload.clone()].to_vec();
                match ph
                    .ip6_frag_flows
                    .add_fragment(key, frag.offset, &payload, !frag.more)
                {
                    None => return,
                    Some(datagram) => {
                        ph.stats_rx.write().ip6_ext_frag__defrag += 1;
                        log::debug!(
                            target: "ip6",
                            "{} - reassembled {} bytes, re-parsing",
                            rx.tracker, datagram.len()
                        );
                        // Rebuild a whole packet and run it through the IPv6
                        // receive path again.
                        let mut rebuilt = PacketTx::new(&datagram, None);
                        Ipv6Hdr::assemble(&mut rebuilt, hdr.src, hdr.dst, frag.next, hdr.hop);
                        let mut rx2 = PacketRx::new(rebuilt.as_slice().to_vec(), rx.tracker);
                        let ether = rx.ether.clone().map(|e| EtherHdr {
                            payload: 0..rx2.frame.len(),
                            ..e
                        });
                        rx2.ether = ether;
                        phrx_ip6(ph, &mut rx2);
                        return;
                    }
                }
            }
            ip_proto::HOPOPT | ip_proto::IP6_OPTS | ip_proto::IP6_ROUTE => {
                // Generic extension header: next header byte plus length in
                // 8-byte units, not counting the first 8 bytes.
                if cursor + 2 > end {
                    ph.stats_rx.write().ip6__failed_parse += 1;
                    rx.parse_failed = Some("ip6: extension header truncated");
                    return;
                }
                let ext_len = 8 + rx.frame[cursor + 1] as usize * 8;
                if cursor + ext_len > end {
                    ph.stats_rx.write().ip6__failed_parse += 1;
                    rx.parse_failed = Some("ip6: extension header overruns payload");
                    return;
                }
                next = rx.frame[cursor];
                cursor += ext_len;
            }
            ip_proto::ICMP6 => {
                icmpv6::phrx_icmp6(ph, rx, cursor, end);
                return;
            }
            ip_proto::UDP => {
                udp::phrx_udp_at(ph, rx, cursor, end);
                return;
            }
            ip_proto::TCP => {
                tcp::phrx_tcp_at(ph, rx, cursor, end);
                return;
            }
            ip_proto::NO_NEXT => return,
            _ => {
                ph.stats_rx.write().ip6__next_unknown_drop += 1;
                log::debug!(
                    target: "ip6",
                    "{} - unsupported next header {}, dropping",
                    rx.tracker, next
                );
                return;
            }
        }
    }
}

/// Assemble an IPv6 packet around `tx` and hand it to Ethernet framing,
/// fragmenting through the Fragment extension header when the payload
/// exceeds the device MTU.
pub fn phtx_ip6(
    ph: &PacketHandler,
    tx: PacketTx,
    src: Ip6Address,
    dst: Ip6Address,
    next: u8,
    hop: u8,
    echo_tracker: Option<Tracker>,
) {
    ph.stats_tx.write().ip6__pre_assemble += 1;

    if tx.len() + IPV6_HEADER_LEN <= ph.config.tap_mtu {
        let mut tx = tx;
        Ipv6Hdr::assemble(&mut tx, src, dst, next, hop);
        ph.stats_tx.write().ip6__mtu_ok__send += 1;
        ethernet::phtx_ether(
            ph,
            tx,
            MacAddress::UNSPECIFIED,
            MacAddress::UNSPECIFIED,
            ether_type::IP6,
            Some(IpAddress::Ip6(dst)),
        );
        return;
    }

    ph.stats_tx.write().ip6__mtu_exceed__frag += 1;
    log::debug!(
        target: "ip6",
        "{:?} - {} byte payload exceeds MTU {}, fragmenting",
        echo_tracker,
        tx.len(),
        ph.config.tap_mtu
    );
    phtx_ip6_ext_frag(ph, tx, src, dst, next, hop, echo_tracker);
}

/// Split an oversized payload into fragments, each carried in its own IPv6
/// packet behind a Fragment extension header.
fn phtx_ip6_ext_frag(
    ph: &PacketHandler,
    tx: PacketTx,
    src: Ip6Address,
    dst: Ip6Address,
    next: u8,
    hop: u8,
    echo_tracker: Option<Tracker>,
) {
    ph.stats_tx.write().ip6_ext_frag__pre_assemble += 1;

    let data = tx.as_slice().to_vec();
    let id = ph.next_ip6_frag_id(dst);
    let chunk = (ph.config.tap_mtu - IPV6_HEADER_LEN - IPV6_FRAG_HEADER_LEN) & !7;
    let mut offset = 0;
    while offset < data.len() {
        let frag_end = (offset + chunk).min(data.len());
        let more = frag_end < data.len();
        let mut frag_tx = PacketTx::new(&data[offset..frag_end], echo_tracker);
        Ipv6FragHdr::assemble(&mut frag_tx, next, offset, more, id);
        ph.stats_tx.write().ip6_ext_frag__send += 1;
        phtx_ip6(ph, frag_tx, src, dst, ip_proto::IP6_FRAG, hop, echo_tracker);
        offset = frag_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_assemble_are_inverse() {
        let src: Ip6Address = "2603:9000:e307:9f09::1fa1".parse().unwrap();
        let dst: Ip6Address = "2603:9000:e307:9f09:0:ff:fe77:7777".parse().unwrap();
        let mut tx = PacketTx::new(b"sixteen byte pay", None);
        Ipv6Hdr::assemble(&mut tx, src, dst, ip_proto::UDP, 64);

        let frame = tx.as_slice().to_vec();
        let hdr = Ipv6Hdr::parse(&frame, 0..frame.len()).unwrap();
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.dst, dst);
        assert_eq!(hdr.next, ip_proto::UDP);
        assert_eq!(hdr.hop, 64);
        assert_eq!(hdr.payload_len, 16);
        assert_eq!(&frame[hdr.payload.clone()], b"sixteen byte pay");
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut frame = vec![0u8; IPV6_HEADER_LEN];
        frame[0] = 0x40;
        assert!(Ipv6Hdr::parse(&frame, 0..frame.len()).is_err());
    }

    #[test]
    fn frag_header_round_trip() {
        let mut tx = PacketTx::new(&[0u8; 32], None);
        Ipv6FragHdr::assemble(&mut tx, ip_proto::UDP, 1432, true, 0xdeadbeef);
        let frame = tx.as_slice().to_vec();
        let frag = Ipv6FragHdr::parse(&frame, 0, frame.len()).unwrap();
        assert_eq!(frag.next, ip_proto::UDP);
        assert_eq!(frag.offset, 1432);
        assert!(frag.more);
        assert_eq!(frag.id, 0xdeadbeef);
        assert_eq!(frag.payload.len(), 32);
    }

    #[test]
    fn frag_header_offset_is_8_byte_aligned() {
        let mut tx = PacketTx::new(&[0u8; 8], None);
        Ipv6FragHdr::assemble(&mut tx, ip_proto::TCP, 1440, false, 7);
        let frame = tx.as_slice().to_vec();
        let frag = Ipv6FragHdr::parse(&frame, 0, frame.len()).unwrap();
        assert_eq!(frag.offset, 1440);
        assert!(!frag.more);
    }
}
