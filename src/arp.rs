//! ARP protocol processing (RFC 826)
//!
//! Maps IPv4 addresses to MAC addresses on the attached subnet. Inbound
//! handling also feeds duplicate-address detection: a request carrying one
//! of our addresses as its sender, or a reply answering one of our probes,
//! is recorded as an address conflict instead of updating the cache.

use core::ops::Range;

use crate::addr::{Ip4Address, MacAddress};
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::ethernet::{self, ether_type};
use crate::handler::PacketHandler;

/// ARP packet size for Ethernet/IPv4.
pub const ARP_PACKET_LEN: usize = 28;

/// Operation codes.
pub mod arp_op {
    pub const REQUEST: u16 = 1;
    pub const REPLY: u16 = 2;
}

/// Parsed ARP packet view.
#[derive(Debug, Clone)]
pub struct ArpHdr {
    pub oper: u16,
    /// Sender hardware address.
    pub sha: MacAddress,
    /// Sender protocol address.
    pub spa: Ip4Address,
    /// Target hardware address.
    pub tha: MacAddress,
    /// Target protocol address.
    pub tpa: Ip4Address,
}

impl ArpHdr {
    /// Parse an ARP packet at `at` within `frame`.
    pub fn parse(frame: &[u8], at: Range<usize>) -> Result<ArpHdr, &'static str> {
        let data = &frame[at];
        if data.len() < ARP_PACKET_LEN {
            return Err("arp: packet shorter than header");
        }
        if u16::from_be_bytes([data[0], data[1]]) != 1 {
            return Err("arp: hardware type not Ethernet");
        }
        if u16::from_be_bytes([data[2], data[3]]) != ether_type::IP4 {
            return Err("arp: protocol type not IPv4");
        }
        if data[4] != 6 || data[5] != 4 {
            return Err("arp: bad address lengths");
        }
        let mut sha = [0u8; 6];
        sha.copy_from_slice(&data[8..14]);
        let mut spa = [0u8; 4];
        spa.copy_from_slice(&data[14..18]);
        let mut tha = [0u8; 6];
        tha.copy_from_slice(&data[18..24]);
        let mut tpa = [0u8; 4];
        tpa.copy_from_slice(&data[24..28]);
        Ok(ArpHdr {
            oper: u16::from_be_bytes([data[6], data[7]]),
            sha: MacAddress::new(sha),
            spa: Ip4Address::new(spa),
            tha: MacAddress::new(tha),
            tpa: Ip4Address::new(tpa),
        })
    }

    /// Assemble an ARP packet into `tx`.
    pub fn assemble(
        tx: &mut PacketTx,
        oper: u16,
        sha: MacAddress,
        spa: Ip4Address,
        tha: MacAddress,
        tpa: Ip4Address,
    ) {
        let body = tx.prepend(ARP_PACKET_LEN);
        body[0..2].copy_from_slice(&1u16.to_be_bytes());
        body[2..4].copy_from_slice(&ether_type::IP4.to_be_bytes());
        body[4] = 6;
        body[5] = 4;
        body[6..8].copy_from_slice(&oper.to_be_bytes());
        body[8..14].copy_from_slice(&sha.octets());
        body[14..18].copy_from_slice(&spa.octets());
        body[18..24].copy_from_slice(&tha.octets());
        body[24..28].copy_from_slice(&tpa.octets());
    }
}

/// Handle an inbound ARP packet.
pub fn phrx_arp(ph: &PacketHandler, rx: &mut PacketRx) {
    ph.stats_rx.write().arp__pre_parse += 1;

    let ether = match rx.ether.as_ref() {
        Some(ether) => ether.clone(),
        None => return,
    };

    let hdr = match ArpHdr::parse(&rx.frame, ether.payload.clone()) {
        Ok(hdr) => hdr,
        Err(reason) => {
            ph.stats_rx.write().arp__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "arp", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    log::debug!(
        target: "arp",
        "{} - op {}, {} ({}) > {} ({})",
        rx.tracker, hdr.oper, hdr.spa, hdr.sha, hdr.tpa, hdr.tha
    );

    match hdr.oper {
        arp_op::REQUEST => {
            ph.stats_rx.write().arp__op_request += 1;

            // A request whose sender claims one of our addresses means
            // another host is using it.
            if ph.ip4_unicast_owned(hdr.spa) {
                ph.stats_rx.write().arp__op_request__ip_conflict_drop += 1;
                log::warn!(
                    target: "arp",
                    "{} - IP conflict: {} also claimed by {}",
                    rx.tracker, hdr.spa, hdr.sha
                );
                ph.record_ip4_conflict(hdr.spa);
                return;
            }

            if ph.ip4_unicast_owned(hdr.tpa) {
                ph.stats_rx.write().arp__op_request__tpa_stack__respond += 1;
                phtx_arp(
                    ph,
                    ph.mac_unicast,
                    hdr.sha,
                    arp_op::REPLY,
                    ph.mac_unicast,
                    hdr.tpa,
                    hdr.sha,
                    hdr.spa,
                    Some(rx.tracker),
                );

                // The request was addressed to us, so the sender mapping is
                // trustworthy enough to learn.
                if ph.config.arp_cache_update_from_direct_request {
                    ph.stats_rx.write().arp__op_request__update_arp_cache += 1;
                    log::debug!(
                        target: "arp",
                        "{} - learning {} -> {} from direct request",
                        rx.tracker, hdr.spa, hdr.sha
                    );
                    ph.arp_cache_learn(hdr.spa, hdr.sha);
                }
            } else {
                ph.stats_rx.write().arp__op_request__tpa_unknown_drop += 1;
            }
        }
        arp_op::REPLY => {
            ph.stats_rx.write().arp__op_reply += 1;

            if ether.dst == ph.mac_unicast {
                // A reply matching one of our outstanding probes means the
                // address we are trying to claim is already in use.
                if ph.ip4_candidate_owned(hdr.spa)
                    && hdr.tha == ph.mac_unicast
                    && hdr.tpa.is_unspecified()
                {
                    ph.stats_rx.write().arp__op_reply__dad_conflict_drop += 1;
                    log::warn!(
                        target: "arp",
                        "{} - probe conflict: {} in use at {}",
                        rx.tracker, hdr.spa, hdr.sha
                    );
                    ph.record_ip4_conflict(hdr.spa);
                    return;
                }

                ph.stats_rx.write().arp__op_reply__update_arp_cache += 1;
                log::debug!(
                    target: "arp",
                    "{} - learning {} -> {} from direct reply",
                    rx.tracker, hdr.spa, hdr.sha
                );
                ph.arp_cache_learn(hdr.spa, hdr.sha);
            } else if ether.dst.is_broadcast()
                && hdr.spa == hdr.tpa
                && ph.config.arp_cache_update_from_gratuitous_reply
            {
                ph.stats_rx.write().arp__op_reply__update_arp_cache_gratuitous += 1;
                log::debug!(
                    target: "arp",
                    "{} - learning {} -> {} from gratuitous reply",
                    rx.tracker, hdr.spa, hdr.sha
                );
                ph.arp_cache_learn(hdr.spa, hdr.sha);
            }
        }
        _ => {
            ph.stats_rx.write().arp__op_unknown_drop += 1;
        }
    }

    rx.arp = Some(hdr);
}

/// Assemble and transmit an ARP packet.
#[allow(clippy::too_many_arguments)]
pub fn phtx_arp(
    ph: &PacketHandler,
    ether_src: MacAddress,
    ether_dst: MacAddress,
    oper: u16,
    sha: MacAddress,
    spa: Ip4Address,
    tha: MacAddress,
    tpa: Ip4Address,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.arp__pre_assemble += 1;
        match oper {
            arp_op::REQUEST => stats.arp__op_request__send += 1,
            arp_op::REPLY => stats.arp__op_reply__send += 1,
            _ => {}
        }
    }

    let mut tx = PacketTx::empty(echo_tracker);
    ArpHdr::assemble(&mut tx, oper, sha, spa, tha, tpa);
    ethernet::phtx_ether(ph, tx, ether_src, ether_dst, ether_type::ARP, None);
}

/// Broadcast an ARP request for `tpa`; used when a transmit-path cache miss
/// starts a resolution and when the cache retries one.
pub(crate) fn phtx_arp_request(ph: &PacketHandler, tpa: Ip4Address) {
    let spa = ph
        .ip4_src_for(tpa)
        .unwrap_or(Ip4Address::UNSPECIFIED);
    phtx_arp(
        ph,
        ph.mac_unicast,
        MacAddress::BROADCAST,
        arp_op::REQUEST,
        ph.mac_unicast,
        spa,
        MacAddress::UNSPECIFIED,
        tpa,
        None,
    );
}

/// Broadcast an ARP probe for a tentative address (sender IP all-zero).
pub(crate) fn phtx_arp_probe(ph: &PacketHandler, tpa: Ip4Address) {
    phtx_arp(
        ph,
        ph.mac_unicast,
        MacAddress::BROADCAST,
        arp_op::REQUEST,
        ph.mac_unicast,
        Ip4Address::UNSPECIFIED,
        MacAddress::UNSPECIFIED,
        tpa,
        None,
    );
}

/// Broadcast a gratuitous ARP announcement for a claimed address.
pub(crate) fn phtx_arp_announcement(ph: &PacketHandler, address: Ip4Address) {
    phtx_arp(
        ph,
        ph.mac_unicast,
        MacAddress::BROADCAST,
        arp_op::REPLY,
        ph.mac_unicast,
        address,
        MacAddress::BROADCAST,
        address,
        None,
    );
}
