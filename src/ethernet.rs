//! Ethernet frame processing
//!
//! Ethernet II (DIX) parsing and assembly, destination filtering on the
//! receive side, and the L2 destination resolution logic on the transmit
//! side: an unspecified destination is resolved from the carried L3
//! destination via broadcast/multicast mapping or the ARP/ND caches, parking
//! the frame on an Incomplete cache entry while resolution is in flight.

use core::ops::Range;

use crate::addr::{IpAddress, MacAddress};
use crate::buffer::{PacketRx, PacketTx};
use crate::handler::PacketHandler;
use crate::neighbor::TxResolution;
use crate::{arp, icmpv6, ipv4, ipv6};

/// Ethernet header size.
pub const ETHER_HEADER_LEN: usize = 14;

/// Minimum frame size on the wire (without FCS); shorter frames are padded.
pub const ETHER_MIN_FRAME: usize = 60;

/// EtherType values dispatched by the stack.
pub mod ether_type {
    pub const IP4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const IP6: u16 = 0x86dd;
}

/// Parsed Ethernet header view.
#[derive(Debug, Clone)]
pub struct EtherHdr {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: Range<usize>,
}

impl EtherHdr {
    /// Parse the header at the start of `frame`.
    pub fn parse(frame: &[u8]) -> Result<EtherHdr, &'static str> {
        if frame.len() < ETHER_HEADER_LEN {
            return Err("ether: frame shorter than header");
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        let mut src = [0u8; 6];
        src.copy_from_slice(&frame[6..12]);
        Ok(EtherHdr {
            dst: MacAddress::new(dst),
            src: MacAddress::new(src),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
            payload: ETHER_HEADER_LEN..frame.len(),
        })
    }

    /// Prepend an Ethernet header onto an assembled L3 packet.
    pub fn assemble(tx: &mut PacketTx, dst: MacAddress, src: MacAddress, ethertype: u16) {
        let header = tx.prepend(ETHER_HEADER_LEN);
        header[0..6].copy_from_slice(&dst.octets());
        header[6..12].copy_from_slice(&src.octets());
        header[12..14].copy_from_slice(&ethertype.to_be_bytes());
    }
}

/// Handle an inbound Ethernet frame; entry point of the receive pipeline.
pub fn phrx_ether(ph: &PacketHandler, rx: &mut PacketRx) {
    ph.stats_rx.write().ether__pre_parse += 1;

    let hdr = match EtherHdr::parse(&rx.frame) {
        Ok(hdr) => hdr,
        Err(reason) => {
            ph.stats_rx.write().ether__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "ether", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    log::debug!(
        target: "ether",
        "{} - {} > {}, type 0x{:04x}",
        rx.tracker, hdr.src, hdr.dst, hdr.ethertype
    );

    // Destination filter: unicast to us, one of our multicast groups, or
    // broadcast. Anything else is not for this stack.
    if hdr.dst == ph.mac_unicast {
        ph.stats_rx.write().ether__dst_unicast += 1;
    } else if hdr.dst.is_broadcast() {
        ph.stats_rx.write().ether__dst_broadcast += 1;
    } else if ph.mac_multicast.read().contains(&hdr.dst) {
        ph.stats_rx.write().ether__dst_multicast += 1;
    } else {
        ph.stats_rx.write().ether__dst_unknown_drop += 1;
        log::debug!(target: "ether", "{} - not for this stack, dropping", rx.tracker);
        return;
    }

    let ethertype = hdr.ethertype;
    rx.ether = Some(hdr);

    match ethertype {
        ether_type::ARP if ph.config.ip4_support => arp::phrx_arp(ph, rx),
        ether_type::IP4 if ph.config.ip4_support => ipv4::phrx_ip4(ph, rx),
        ether_type::IP6 if ph.config.ip6_support => ipv6::phrx_ip6(ph, rx),
        _ => {
            log::debug!(
                target: "ether",
                "{} - unsupported ethertype 0x{:04x}, dropping",
                rx.tracker, ethertype
            );
        }
    }
}

/// Frame an assembled L3 packet and hand it to the TX ring.
///
/// An unspecified source is filled with the stack MAC. An unspecified
/// destination is resolved from `l3_dst`; when ARP/ND resolution is pending
/// the frame is parked on the cache entry instead of being dropped.
pub fn phtx_ether(
    ph: &PacketHandler,
    mut tx: PacketTx,
    src: MacAddress,
    dst: MacAddress,
    ethertype: u16,
    l3_dst: Option<IpAddress>,
) {
    ph.stats_tx.write().ether__pre_assemble += 1;

    let src = if src.is_unspecified() {
        ph.stats_tx.write().ether__src_unspec__fill += 1;
        ph.mac_unicast
    } else {
        ph.stats_tx.write().ether__src_spec += 1;
        src
    };

    if !dst.is_unspecified() {
        ph.stats_tx.write().ether__dst_spec__send += 1;
        EtherHdr::assemble(&mut tx, dst, src, ethertype);
        ph.enqueue_frame(tx);
        return;
    }

    match l3_dst {
        Some(IpAddress::Ip4(ip4_dst)) => {
            ph.stats_tx.write().ether__dst_unspec__ip4_lookup += 1;

            if ip4_dst.is_limited_broadcast() || ph.ip4_broadcast_match(ip4_dst) {
                ph.stats_tx
                    .write()
                    .ether__dst_unspec__ip4_lookup__broadcast__send += 1;
                EtherHdr::assemble(&mut tx, MacAddress::BROADCAST, src, ethertype);
                ph.enqueue_frame(tx);
                return;
            }

            if ip4_dst.is_multicast() {
                ph.stats_tx
                    .write()
                    .ether__dst_unspec__ip4_lookup__multicast__send += 1;
                EtherHdr::assemble(&mut tx, MacAddress::from_ip4_multicast(ip4_dst), src, ethertype);
                ph.enqueue_frame(tx);
                return;
            }

            // Inside the attached subnet the destination resolves directly;
            // everything else goes through the default gateway.
            let (next_hop, locnet) = if ph.ip4_locnet(ip4_dst) {
                (ip4_dst, true)
            } else if let Some(gateway) = ph.ip4_gateway() {
                (gateway, false)
            } else {
                ph.stats_tx
                    .write()
                    .ether__dst_unspec__ip4_lookup__extnet__no_gw_drop += 1;
                log::warn!(
                    target: "ether",
                    "{:?} - no route to {}, dropping",
                    tx.echo_tracker, ip4_dst
                );
                return;
            };

            // Header goes on before resolution so a parked frame only needs
            // its destination patched when the mapping arrives.
            EtherHdr::assemble(&mut tx, MacAddress::UNSPECIFIED, src, ethertype);
            match ph.arp_cache.resolve_or_park(next_hop, tx) {
                TxResolution::Resolved(mac, mut frame) => {
                    let mut stats = ph.stats_tx.write();
                    if locnet {
                        stats.ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send += 1;
                    } else {
                        stats.ether__dst_unspec__ip4_lookup__extnet__gw_arp_cache_hit__send += 1;
                    }
                    drop(stats);
                    frame.patch(0, &mac.octets());
                    ph.enqueue_frame(frame);
                }
                TxResolution::Queued { probe } => {
                    let mut stats = ph.stats_tx.write();
                    if locnet {
                        stats.ether__dst_unspec__ip4_lookup__locnet__arp_cache_miss += 1;
                    } else {
                        stats.ether__dst_unspec__ip4_lookup__extnet__gw_arp_cache_miss += 1;
                    }
                    drop(stats);
                    if probe {
                        arp::phtx_arp_request(ph, next_hop);
                    }
                }
            }
        }
        Some(IpAddress::Ip6(ip6_dst)) => {
            ph.stats_tx.write().ether__dst_unspec__ip6_lookup += 1;

            if ip6_dst.is_multicast() {
                ph.stats_tx
                    .write()
                    .ether__dst_unspec__ip6_lookup__multicast__send += 1;
                EtherHdr::assemble(&mut tx, MacAddress::from_ip6_multicast(ip6_dst), src, ethertype);
                ph.enqueue_frame(tx);
                return;
            }

            let (next_hop, locnet) = if ph.ip6_locnet(ip6_dst) {
                (ip6_dst, true)
            } else if let Some(gateway) = ph.ip6_gateway() {
                (gateway, false)
            } else {
                ph.stats_tx
                    .write()
                    .ether__dst_unspec__ip6_lookup__extnet__no_gw_drop += 1;
                log::warn!(
                    target: "ether",
                    "{:?} - no route to {}, dropping",
                    tx.echo_tracker, ip6_dst
                );
                return;
            };

            EtherHdr::assemble(&mut tx, MacAddress::UNSPECIFIED, src, ethertype);
            match ph.nd_cache.resolve_or_park(next_hop, tx) {
                TxResolution::Resolved(mac, mut frame) => {
                    let mut stats = ph.stats_tx.write();
                    if locnet {
                        stats.ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send += 1;
                    } else {
                        stats.ether__dst_unspec__ip6_lookup__extnet__gw_nd_cache_hit__send += 1;
                    }
                    drop(stats);
                    frame.patch(0, &mac.octets());
                    ph.enqueue_frame(frame);
                }
                TxResolution::Queued { probe } => {
                    let mut stats = ph.stats_tx.write();
                    if locnet {
                        stats.ether__dst_unspec__ip6_lookup__locnet__nd_cache_miss += 1;
                    } else {
                        stats.ether__dst_unspec__ip6_lookup__extnet__gw_nd_cache_miss += 1;
                    }
                    drop(stats);
                    if probe {
                        icmpv6::phtx_nd_neighbor_solicitation(ph, next_hop);
                    }
                }
            }
        }
        None => {
            ph.stats_tx.write().ether__dst_unspec__drop += 1;
            log::warn!(
                target: "ether",
                "{:?} - destination unresolvable, dropping",
                tx.echo_tracker
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_runt_frame() {
        assert!(EtherHdr::parse(&[0u8; 13]).is_err());
    }

    #[test]
    fn parse_and_assemble_are_inverse() {
        let mut tx = PacketTx::new(b"payload", None);
        let dst = MacAddress::new([0x52, 0x54, 0x00, 0xdf, 0x85, 0x37]);
        let src = MacAddress::new([0x02, 0x00, 0x00, 0x77, 0x77, 0x77]);
        EtherHdr::assemble(&mut tx, dst, src, ether_type::IP4);

        let hdr = EtherHdr::parse(tx.as_slice()).unwrap();
        assert_eq!(hdr.dst, dst);
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.ethertype, ether_type::IP4);
        assert_eq!(&tx.as_slice()[hdr.payload.clone()], b"payload");
    }
}
