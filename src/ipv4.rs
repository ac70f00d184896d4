//! IPv4 packet processing (RFC 791)
//!
//! Header parsing and assembly, destination filtering, fragment reassembly
//! on the receive side and MTU-driven fragmentation on the transmit side.

use core::ops::Range;

use bitflags::bitflags;

use crate::addr::{Ip4Address, IpAddress, MacAddress};
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::checksum;
use crate::ethernet::{self, ether_type};
use crate::fragment::FlowKey;
use crate::handler::PacketHandler;
use crate::ip_proto;
use crate::{icmp, tcp, udp};

/// Header length without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// Default TTL for originated packets.
pub const DEFAULT_TTL: u8 = 64;

bitflags! {
    /// Flag bits of the flags/fragment-offset word.
    pub struct Ipv4Flags: u16 {
        const DF = 0x4000;
        const MF = 0x2000;
    }
}

/// Parsed IPv4 header view.
#[derive(Debug, Clone)]
pub struct Ipv4Hdr {
    pub hlen: usize,
    pub dscp: u8,
    pub total_len: usize,
    pub id: u16,
    pub flags: Ipv4Flags,
    /// Fragment offset in bytes.
    pub frag_offset: usize,
    pub ttl: u8,
    pub proto: u8,
    pub cksum: u16,
    pub src: Ip4Address,
    pub dst: Ip4Address,
    pub options: Range<usize>,
    pub payload: Range<usize>,
    /// Full datagram (header + payload), for ICMP error quoting.
    pub packet: Range<usize>,
}

impl Ipv4Hdr {
    /// Parse the header at `at` within `frame`.
    pub fn parse(frame: &[u8], at: Range<usize>) -> Result<Ipv4Hdr, &'static str> {
        let data = &frame[at.clone()];
        if data.len() < IPV4_HEADER_LEN {
            return Err("ip4: packet shorter than header");
        }
        if data[0] >> 4 != 4 {
            return Err("ip4: version not 4");
        }
        let hlen = ((data[0] & 0x0f) as usize) * 4;
        if hlen < IPV4_HEADER_LEN || hlen > data.len() {
            return Err("ip4: bad header length");
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len < hlen || total_len > data.len() {
            return Err("ip4: bad total length");
        }
        let word = u16::from_be_bytes([data[6], data[7]]);
        let mut src = [0u8; 4];
        src.copy_from_slice(&data[12..16]);
        let mut dst = [0u8; 4];
        dst.copy_from_slice(&data[16..20]);
        Ok(Ipv4Hdr {
            hlen,
            dscp: data[1],
            total_len,
            id: u16::from_be_bytes([data[4], data[5]]),
            flags: Ipv4Flags::from_bits_truncate(word),
            frag_offset: ((word & 0x1fff) as usize) * 8,
            ttl: data[8],
            proto: data[9],
            cksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ip4Address::new(src),
            dst: Ip4Address::new(dst),
            options: at.start + IPV4_HEADER_LEN..at.start + hlen,
            payload: at.start + hlen..at.start + total_len,
            packet: at.start..at.start + total_len,
        })
    }

    /// Header checksum over the header bytes verifies to zero when intact.
    pub fn verify_checksum(&self, frame: &[u8]) -> bool {
        checksum::checksum(&frame[self.packet.start..self.packet.start + self.hlen], 0) == 0
    }

    /// Whether this packet is one fragment of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.flags.contains(Ipv4Flags::MF) || self.frag_offset > 0
    }

    /// Prepend a header onto an assembled L4 payload.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        tx: &mut PacketTx,
        src: Ip4Address,
        dst: Ip4Address,
        proto: u8,
        ttl: u8,
        id: u16,
        flags: Ipv4Flags,
        frag_offset: usize,
    ) {
        let total_len = IPV4_HEADER_LEN + tx.len();
        let word = flags.bits() | ((frag_offset / 8) as u16 & 0x1fff);
        let header = tx.prepend(IPV4_HEADER_LEN);
        header[0] = 0x45;
        header[1] = 0;
        header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        header[4..6].copy_from_slice(&id.to_be_bytes());
        header[6..8].copy_from_slice(&word.to_be_bytes());
        header[8] = ttl;
        header[9] = proto;
        header[10] = 0;
        header[11] = 0;
        header[12..16].copy_from_slice(&src.octets());
        header[16..20].copy_from_slice(&dst.octets());
        let cksum = checksum::checksum(&header[..IPV4_HEADER_LEN], 0);
        header[10..12].copy_from_slice(&cksum.to_be_bytes());
    }
}

/// Handle an inbound IPv4 packet.
pub fn phrx_ip4(ph: &PacketHandler, rx: &mut PacketRx) {
    ph.stats_rx.write().ip4__pre_parse += 1;

    let at = match rx.ether.as_ref() {
        Some(ether) => ether.payload.clone(),
        None => return,
    };

    let hdr = match Ipv4Hdr::parse(&rx.frame, at) {
        Ok(hdr) => hdr,
        Err(reason) => {
            ph.stats_rx.write().ip4__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "ip4", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    if ph.config.packet_integrity_check && !hdr.verify_checksum(&rx.frame) {
        ph.stats_rx.write().ip4__failed_parse += 1;
        rx.parse_failed = Some("ip4: bad header checksum");
        log::warn!(target: "ip4", "{} - bad header checksum", rx.tracker);
        return;
    }

    if ph.config.packet_sanity_check
        && (hdr.src.is_multicast() || hdr.src.is_limited_broadcast())
    {
        ph.stats_rx.write().ip4__failed_sanity += 1;
        rx.parse_failed = Some("ip4: invalid source address");
        log::warn!(target: "ip4", "{} - invalid source {}", rx.tracker, hdr.src);
        return;
    }

    log::debug!(
        target: "ip4",
        "{} - {} > {}, proto {}, len {}",
        rx.tracker, hdr.src, hdr.dst, hdr.proto, hdr.total_len
    );

    if hdr.ttl == 0 {
        ph.stats_rx.write().ip4__ttl_exceeded_drop += 1;
        log::debug!(target: "ip4", "{} - TTL exceeded, dropping", rx.tracker);
        return;
    }

    if ph.ip4_unicast_owned(hdr.dst) {
        ph.stats_rx.write().ip4__dst_unicast += 1;
    } else if hdr.dst.is_limited_broadcast() || ph.ip4_broadcast_match(hdr.dst) {
        ph.stats_rx.write().ip4__dst_broadcast += 1;
    } else if hdr.dst.is_multicast() && ph.ip4_multicast_owned(hdr.dst) {
        ph.stats_rx.write().ip4__dst_multicast += 1;
    } else {
        ph.stats_rx.write().ip4__dst_unknown_drop += 1;
        log::debug!(target: "ip4", "{} - not for this stack, dropping", rx.tracker);
        return;
    }

    let mut hdr = hdr;
    if hdr.is_fragment() {
        ph.stats_rx.write().ip4__frag += 1;
        let key = FlowKey {
            src: IpAddress::Ip4(hdr.src),
            dst: IpAddress::Ip4(hdr.dst),
            proto: hdr.proto,
            id: hdr.id as u32,
        };
        let last = !hdr.flags.contains(Ipv4Flags::MF);
        let payload = rx.frame[hdr.payload.clone()].to_vec();
        match ph.ip4_frag_flows.add_fragment(key, hdr.frag_offset, &payload, last) {
            None => return,
            Some(datagram) => {
                ph.stats_rx.write().ip4__defrag += 1;
                log::debug!(
                    target: "ip4",
                    "{} - reassembled {} bytes from fragments",
                    rx.tracker, datagram.len()
                );
                // Continue processing as one whole datagram: rebuild the
                // frame as header + reassembled payload.
                let mut rebuilt = PacketTx::new(&datagram, None);
                Ipv4Hdr::assemble(
                    &mut rebuilt,
                    hdr.src,
                    hdr.dst,
                    hdr.proto,
                    hdr.ttl,
                    hdr.id,
                    Ipv4Flags::empty(),
                    0,
                );
                rx.frame = rebuilt.as_slice().to_vec();
                hdr = match Ipv4Hdr::parse(&rx.frame, 0..rx.frame.len()) {
                    Ok(hdr) => hdr,
                    Err(_) => return,
                };
            }
        }
    }

    let proto = hdr.proto;
    rx.ip4 = Some(hdr);

    match proto {
        ip_proto::ICMP4 => icmp::phrx_icmp4(ph, rx),
        ip_proto::UDP => udp::phrx_udp(ph, rx),
        ip_proto::TCP => tcp::phrx_tcp(ph, rx),
        _ => {
            ph.stats_rx.write().ip4__proto_unknown_drop += 1;
            log::debug!(
                target: "ip4",
                "{} - unsupported protocol {}, dropping",
                rx.tracker, proto
            );
        }
    }
}

/// Assemble an IPv4 datagram around `tx` and hand it to Ethernet framing.
/// A payload exceeding the device MTU is fragmented, unless `df` forbids
/// it, in which case the packet is dropped and counted.
pub fn phtx_ip4(
    ph: &PacketHandler,
    tx: PacketTx,
    src: Ip4Address,
    dst: Ip4Address,
    proto: u8,
    df: bool,
    echo_tracker: Option<Tracker>,
) {
    ph.stats_tx.write().ip4__pre_assemble += 1;

    let mtu_payload = (ph.config.tap_mtu - IPV4_HEADER_LEN) & !7;
    if tx.len() + IPV4_HEADER_LEN <= ph.config.tap_mtu {
        let mut tx = tx;
        Ipv4Hdr::assemble(
            &mut tx,
            src,
            dst,
            proto,
            DEFAULT_TTL,
            ph.next_ip4_id(),
            if df { Ipv4Flags::DF } else { Ipv4Flags::empty() },
            0,
        );
        ph.stats_tx.write().ip4__mtu_ok__send += 1;
        ethernet::phtx_ether(
            ph,
            tx,
            MacAddress::UNSPECIFIED,
            MacAddress::UNSPECIFIED,
            ether_type::IP4,
            Some(IpAddress::Ip4(dst)),
        );
        return;
    }

    if df {
        ph.stats_tx.write().ip4__mtu_exceed__df_drop += 1;
        log::warn!(
            target: "ip4",
            "{:?} - {} byte payload exceeds MTU with DF set, dropping",
            echo_tracker,
            tx.len()
        );
        return;
    }

    ph.stats_tx.write().ip4__mtu_exceed__frag += 1;
    log::debug!(
        target: "ip4",
        "{:?} - {} byte payload exceeds MTU {}, fragmenting",
        echo_tracker,
        tx.len(),
        ph.config.tap_mtu
    );

    let data = tx.as_slice().to_vec();
    let id = ph.next_ip4_id();
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + mtu_payload).min(data.len());
        let more = end < data.len();
        let mut frag_tx = PacketTx::new(&data[offset..end], echo_tracker);
        Ipv4Hdr::assemble(
            &mut frag_tx,
            src,
            dst,
            proto,
            DEFAULT_TTL,
            id,
            if more { Ipv4Flags::MF } else { Ipv4Flags::empty() },
            offset,
        );
        ph.stats_tx.write().ip4__mtu_exceed__frag__send += 1;
        ethernet::phtx_ether(
            ph,
            frag_tx,
            MacAddress::UNSPECIFIED,
            MacAddress::UNSPECIFIED,
            ether_type::IP4,
            Some(IpAddress::Ip4(dst)),
        );
        offset = end;
    }
}
