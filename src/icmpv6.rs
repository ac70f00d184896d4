//! ICMPv6 and Neighbor Discovery processing (RFC 4443, RFC 4861)
//!
//! Echo responder, destination-unreachable generation, and the ND state
//! the stack depends on: neighbor solicitation/advertisement handling with
//! SLLA/TLLA cache learning, duplicate address detection on both sides,
//! and router-advertisement prefix adoption (SLAAC).

use core::ops::Range;

use bitflags::bitflags;

use crate::addr::{Ip6Address, Ip6Host, MacAddress};
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::checksum;
use crate::handler::PacketHandler;
use crate::ip_proto;
use crate::ipv6;

/// Fixed part of every ICMPv6 message.
pub const ICMP6_HEADER_LEN: usize = 4;

/// Hop limit required on ND messages.
pub const ND_HOP_LIMIT: u8 = 255;

/// Longest quote in an unreachable message: the whole packet must fit the
/// IPv6 minimum MTU (1280) less the IPv6 and ICMPv6 headers.
pub const ICMP6_UNREACHABLE_QUOTE: usize = 1280 - ipv6::IPV6_HEADER_LEN - 8;

/// Message types handled by the stack.
pub mod icmp6_type {
    pub const UNREACHABLE: u8 = 1;
    pub const PACKET_TOO_BIG: u8 = 2;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;
    pub const ROUTER_SOLICITATION: u8 = 133;
    pub const ROUTER_ADVERTISEMENT: u8 = 134;
    pub const NEIGHBOR_SOLICITATION: u8 = 135;
    pub const NEIGHBOR_ADVERTISEMENT: u8 = 136;
}

/// Unreachable codes.
pub mod icmp6_code {
    pub const UNREACHABLE_PORT: u8 = 4;
}

/// ND option types.
pub mod nd_option {
    pub const SOURCE_LINK_ADDR: u8 = 1;
    pub const TARGET_LINK_ADDR: u8 = 2;
    pub const PREFIX_INFO: u8 = 3;
    pub const MTU: u8 = 5;
}

bitflags! {
    /// Neighbor Advertisement flags (first byte of the flags word).
    pub struct NaFlags: u8 {
        const ROUTER = 0x80;
        const SOLICITED = 0x40;
        const OVERRIDE = 0x20;
    }
}

/// Prefix Information option payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfo {
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub prefix: Ip6Address,
}

/// Options carried by an ND message.
#[derive(Debug, Clone, Default)]
pub struct NdOptions {
    pub slla: Option<MacAddress>,
    pub tlla: Option<MacAddress>,
    pub prefixes: Vec<PrefixInfo>,
    pub mtu: Option<u32>,
}

impl NdOptions {
    /// Parse the TLV option list in `data`.
    fn parse(data: &[u8]) -> Result<NdOptions, &'static str> {
        let mut options = NdOptions::default();
        let mut cursor = 0;
        while cursor + 2 <= data.len() {
            let opt_type = data[cursor];
            let opt_len = data[cursor + 1] as usize * 8;
            if opt_len == 0 || cursor + opt_len > data.len() {
                return Err("icmp6: malformed nd option");
            }
            let value = &data[cursor + 2..cursor + opt_len];
            match opt_type {
                nd_option::SOURCE_LINK_ADDR if value.len() >= 6 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&value[..6]);
                    options.slla = Some(MacAddress::new(mac));
                }
                nd_option::TARGET_LINK_ADDR if value.len() >= 6 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&value[..6]);
                    options.tlla = Some(MacAddress::new(mac));
                }
                nd_option::PREFIX_INFO if value.len() >= 30 => {
                    let mut prefix = [0u8; 16];
                    prefix.copy_from_slice(&value[14..30]);
                    options.prefixes.push(PrefixInfo {
                        prefix_len: value[0],
                        on_link: (value[1] & 0x80) != 0,
                        autonomous: (value[1] & 0x40) != 0,
                        valid_lifetime: u32::from_be_bytes([
                            value[2], value[3], value[4], value[5],
                        ]),
                        preferred_lifetime: u32::from_be_bytes([
                            value[6], value[7], value[8], value[9],
                        ]),
                        prefix: Ip6Address::new(prefix),
                    });
                }
                nd_option::MTU if value.len() >= 6 => {
                    options.mtu =
                        Some(u32::from_be_bytes([value[2], value[3], value[4], value[5]]));
                }
                _ => {} // unrecognized options are skipped
            }
            cursor += opt_len;
        }
        Ok(options)
    }
}

/// Parsed ICMPv6 message.
#[derive(Debug, Clone)]
pub enum Icmp6Msg {
    EchoRequest {
        id: u16,
        seq: u16,
        data: Range<usize>,
    },
    EchoReply {
        id: u16,
        seq: u16,
        data: Range<usize>,
    },
    Unreachable {
        code: u8,
        quote: Range<usize>,
    },
    NeighborSolicitation {
        target: Ip6Address,
        options: NdOptions,
    },
    NeighborAdvertisement {
        flags: NaFlags,
        target: Ip6Address,
        options: NdOptions,
    },
    RouterSolicitation,
    RouterAdvertisement {
        hop: u8,
        router_lifetime: u16,
        options: NdOptions,
    },
    Other {
        msg_type: u8,
        code: u8,
    },
}

impl Icmp6Msg {
    /// Parse and checksum-verify the message spanning `at` in `frame`.
    pub fn parse(
        frame: &[u8],
        at: Range<usize>,
        src: &Ip6Address,
        dst: &Ip6Address,
    ) -> Result<Icmp6Msg, &'static str> {
        let data = &frame[at.clone()];
        if data.len() < ICMP6_HEADER_LEN {
            return Err("icmp6: message shorter than header");
        }
        let pseudo = checksum::pseudo_sum_v6(src, dst, ip_proto::ICMP6, data.len());
        if checksum::checksum(data, pseudo) != 0 {
            return Err("icmp6: bad checksum");
        }
        let msg_type = data[0];
        let code = data[1];
        match msg_type {
            icmp6_type::ECHO_REQUEST | icmp6_type::ECHO_REPLY => {
                if data.len() < 8 {
                    return Err("icmp6: echo message truncated");
                }
                let id = u16::from_be_bytes([data[4], data[5]]);
                let seq = u16::from_be_bytes([data[6], data[7]]);
                let body = at.start + 8..at.end;
                if msg_type == icmp6_type::ECHO_REQUEST {
                    Ok(Icmp6Msg::EchoRequest { id, seq, data: body })
                } else {
                    Ok(Icmp6Msg::EchoReply { id, seq, data: body })
                }
            }
            icmp6_type::UNREACHABLE => {
                if data.len() < 8 {
                    return Err("icmp6: unreachable message truncated");
                }
                Ok(Icmp6Msg::Unreachable {
                    code,
                    quote: at.start + 8..at.end,
                })
            }
            icmp6_type::NEIGHBOR_SOLICITATION => {
                if data.len() < 24 {
                    return Err("icmp6: neighbor solicitation truncated");
                }
                let mut target = [0u8; 16];
                target.copy_from_slice(&data[8..24]);
                Ok(Icmp6Msg::NeighborSolicitation {
                    target: Ip6Address::new(target),
                    options: NdOptions::parse(&data[24..])?,
                })
            }
            icmp6_type::NEIGHBOR_ADVERTISEMENT => {
                if data.len() < 24 {
                    return Err("icmp6: neighbor advertisement truncated");
                }
                let mut target = [0u8; 16];
                target.copy_from_slice(&data[8..24]);
                Ok(Icmp6Msg::NeighborAdvertisement {
                    flags: NaFlags::from_bits_truncate(data[4]),
                    target: Ip6Address::new(target),
                    options: NdOptions::parse(&data[24..])?,
                })
            }
            icmp6_type::ROUTER_SOLICITATION => Ok(Icmp6Msg::RouterSolicitation),
            icmp6_type::ROUTER_ADVERTISEMENT => {
                if data.len() < 16 {
                    return Err("icmp6: router advertisement truncated");
                }
                Ok(Icmp6Msg::RouterAdvertisement {
                    hop: data[4],
                    router_lifetime: u16::from_be_bytes([data[6], data[7]]),
                    options: NdOptions::parse(&data[16..])?,
                })
            }
            _ => Ok(Icmp6Msg::Other { msg_type, code }),
        }
    }
}

/// Handle an inbound ICMPv6 message found at `[at, end)` after the
/// extension-header walk.
pub fn phrx_icmp6(ph: &PacketHandler, rx: &mut PacketRx, at: usize, end: usize) {
    ph.stats_rx.write().icmp6__pre_parse += 1;

    let ip6 = match rx.ip6.as_ref() {
        Some(ip6) => ip6.clone(),
        None => return,
    };

    let msg = match Icmp6Msg::parse(&rx.frame, at..end, &ip6.src, &ip6.dst) {
        Ok(msg) => msg,
        Err(reason) => {
            ph.stats_rx.write().icmp6__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "icmp6", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    match msg {
        Icmp6Msg::EchoRequest { id, seq, data } => {
            ph.stats_rx.write().icmp6__echo_request__respond_echo_reply += 1;
            log::debug!(
                target: "icmp6",
                "{} - echo request from {}, id {}, seq {}",
                rx.tracker, ip6.src, id, seq
            );
            let body = rx.frame[data].to_vec();
            let src = if ph.ip6_unicast_owned(ip6.dst) {
                ip6.dst
            } else {
                match ph.ip6_src_for(ip6.src) {
                    Some(src) => src,
                    None => return,
                }
            };
            phtx_icmp6_echo_reply(ph, id, seq, &body, src, ip6.src, Some(rx.tracker));
        }
        Icmp6Msg::EchoReply { id, seq, .. } => {
            ph.stats_rx.write().icmp6__echo_reply += 1;
            log::debug!(
                target: "icmp6",
                "{} - echo reply from {}, id {}, seq {}",
                rx.tracker, ip6.src, id, seq
            );
        }
        Icmp6Msg::Unreachable { code, .. } => {
            ph.stats_rx.write().icmp6__unreachable += 1;
            log::debug!(
                target: "icmp6",
                "{} - destination unreachable (code {}) from {}",
                rx.tracker, code, ip6.src
            );
        }
        Icmp6Msg::NeighborSolicitation { target, options } => {
            ph.stats_rx.write().icmp6__nd_neighbor_solicitation += 1;

            // A solicitation from the unspecified address is a peer running
            // duplicate address detection on the target.
            let peer_dad = ip6.src.is_unspecified();
            if peer_dad {
                ph.stats_rx.write().icmp6__nd_neighbor_solicitation__dad += 1;
                log::debug!(
                    target: "icmp6",
                    "{} - DAD solicitation for {}",
                    rx.tracker, target
                );
            } else if let Some(slla) = options.slla {
                ph.stats_rx
                    .write()
                    .icmp6__nd_neighbor_solicitation__update_nd_cache += 1;
                log::debug!(
                    target: "icmp6",
                    "{} - learning {} -> {} from solicitation",
                    rx.tracker, ip6.src, slla
                );
                ph.nd_cache_learn(ip6.src, slla);
            }

            if ph.ip6_unicast_owned(target) {
                ph.stats_rx
                    .write()
                    .icmp6__nd_neighbor_solicitation__target_stack__respond += 1;
                // A DAD probe cannot be answered unicast; the advertisement
                // goes to the solicited-node group of the contested target.
                let (dst, flags) = if peer_dad {
                    (
                        target.solicited_node_multicast(),
                        NaFlags::OVERRIDE,
                    )
                } else {
                    (ip6.src, NaFlags::SOLICITED | NaFlags::OVERRIDE)
                };
                let src = target;
                phtx_icmp6_nd_neighbor_advertisement(
                    ph,
                    target,
                    src,
                    dst,
                    flags,
                    Some(rx.tracker),
                );
            } else {
                ph.stats_rx
                    .write()
                    .icmp6__nd_neighbor_solicitation__target_unknown_drop += 1;
            }
        }
        Icmp6Msg::NeighborAdvertisement { target, options, .. } => {
            ph.stats_rx.write().icmp6__nd_neighbor_advertisement += 1;

            // An advertisement for an address we are still probing means the
            // address is already in use.
            if ph.ip6_candidate_owned(target) {
                ph.stats_rx
                    .write()
                    .icmp6__nd_neighbor_advertisement__dad_conflict += 1;
                log::warn!(
                    target: "icmp6",
                    "{} - DAD conflict: {} already in use",
                    rx.tracker, target
                );
                ph.record_ip6_conflict(target);
                return;
            }

            if let Some(tlla) = options.tlla {
                ph.stats_rx
                    .write()
                    .icmp6__nd_neighbor_advertisement__update_nd_cache += 1;
                log::debug!(
                    target: "icmp6",
                    "{} - learning {} -> {} from advertisement",
                    rx.tracker, target, tlla
                );
                ph.nd_cache_learn(target, tlla);
            }
        }
        Icmp6Msg::RouterSolicitation => {
            ph.stats_rx.write().icmp6__nd_router_solicitation_drop += 1;
        }
        Icmp6Msg::RouterAdvertisement { options, .. } => {
            ph.stats_rx.write().icmp6__nd_router_advertisement += 1;
            if let Some(slla) = options.slla {
                ph.nd_cache_learn(ip6.src, slla);
            }
            // SLAAC: adopt an advertised on-link autonomous /64 prefix.
            for info in &options.prefixes {
                if info.autonomous && info.on_link && info.prefix_len == 64 {
                    let address = Ip6Address::from_prefix_and_mac(info.prefix, ph.mac_unicast);
                    if !ph.ip6_unicast_owned(address) {
                        log::info!(
                            target: "icmp6",
                            "{} - adopting advertised prefix {}/64 as {}",
                            rx.tracker, info.prefix, address
                        );
                        ph.assign_ip6_host(
                            Ip6Host::new(address, 64).with_gateway(ip6.src),
                        );
                    }
                }
            }
        }
        Icmp6Msg::Other { msg_type, .. } => {
            ph.stats_rx.write().icmp6__unknown_drop += 1;
            log::debug!(
                target: "icmp6",
                "{} - unsupported type {}, dropping",
                rx.tracker, msg_type
            );
        }
    }
}

fn finish_and_send(
    ph: &PacketHandler,
    mut tx: PacketTx,
    src: Ip6Address,
    dst: Ip6Address,
    hop: u8,
    echo_tracker: Option<Tracker>,
) {
    let pseudo = checksum::pseudo_sum_v6(&src, &dst, ip_proto::ICMP6, tx.len());
    let cksum = checksum::checksum(tx.as_slice(), pseudo);
    tx.patch(2, &cksum.to_be_bytes());
    ipv6::phtx_ip6(ph, tx, src, dst, ip_proto::ICMP6, hop, echo_tracker);
}

/// Assemble and transmit an echo reply.
pub fn phtx_icmp6_echo_reply(
    ph: &PacketHandler,
    id: u16,
    seq: u16,
    data: &[u8],
    src: Ip6Address,
    dst: Ip6Address,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp6__pre_assemble += 1;
        stats.icmp6__echo_reply__send += 1;
    }
    let mut tx = PacketTx::new(data, echo_tracker);
    let header = tx.prepend(8);
    header[0] = icmp6_type::ECHO_REPLY;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4..6].copy_from_slice(&id.to_be_bytes());
    header[6..8].copy_from_slice(&seq.to_be_bytes());
    finish_and_send(ph, tx, src, dst, ipv6::DEFAULT_HOP_LIMIT, echo_tracker);
}

/// Assemble and transmit an echo request.
pub fn phtx_icmp6_echo_request(
    ph: &PacketHandler,
    id: u16,
    seq: u16,
    data: &[u8],
    src: Ip6Address,
    dst: Ip6Address,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp6__pre_assemble += 1;
        stats.icmp6__echo_request__send += 1;
    }
    let mut tx = PacketTx::new(data, None);
    let header = tx.prepend(8);
    header[0] = icmp6_type::ECHO_REQUEST;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4..6].copy_from_slice(&id.to_be_bytes());
    header[6..8].copy_from_slice(&seq.to_be_bytes());
    finish_and_send(ph, tx, src, dst, ipv6::DEFAULT_HOP_LIMIT, None);
}

/// Assemble and transmit a destination-unreachable (port) message quoting
/// the offending packet.
pub fn phtx_icmp6_unreachable_port(
    ph: &PacketHandler,
    original: &[u8],
    src: Ip6Address,
    dst: Ip6Address,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp6__pre_assemble += 1;
        stats.icmp6__unreachable_port__send += 1;
    }
    let quote = &original[..original.len().min(ICMP6_UNREACHABLE_QUOTE)];
    let mut tx = PacketTx::new(quote, echo_tracker);
    let header = tx.prepend(8);
    header[0] = icmp6_type::UNREACHABLE;
    header[1] = icmp6_code::UNREACHABLE_PORT;
    header[2] = 0;
    header[3] = 0;
    header[4..8].copy_from_slice(&[0; 4]);
    finish_and_send(ph, tx, src, dst, ipv6::DEFAULT_HOP_LIMIT, echo_tracker);
}

/// Assemble and transmit a neighbor advertisement carrying our link-layer
/// address in a TLLA option.
pub fn phtx_icmp6_nd_neighbor_advertisement(
    ph: &PacketHandler,
    target: Ip6Address,
    src: Ip6Address,
    dst: Ip6Address,
    flags: NaFlags,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp6__pre_assemble += 1;
        stats.icmp6__nd_neighbor_advertisement__send += 1;
    }
    let mut tlla = [0u8; 8];
    tlla[0] = nd_option::TARGET_LINK_ADDR;
    tlla[1] = 1;
    tlla[2..8].copy_from_slice(&ph.mac_unicast.octets());

    let mut tx = PacketTx::new(&tlla, echo_tracker);
    let header = tx.prepend(24);
    header[0] = icmp6_type::NEIGHBOR_ADVERTISEMENT;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4] = flags.bits();
    header[5..8].copy_from_slice(&[0; 3]);
    header[8..24].copy_from_slice(&target.octets());
    finish_and_send(ph, tx, src, dst, ND_HOP_LIMIT, echo_tracker);
}

/// Solicit the link-layer address of `target`; used on ND cache misses and
/// probe retries.
pub(crate) fn phtx_nd_neighbor_solicitation(ph: &PacketHandler, target: Ip6Address) {
    let src = match ph.ip6_src_for(target) {
        Some(src) => src,
        None => return,
    };
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp6__pre_assemble += 1;
        stats.icmp6__nd_neighbor_solicitation__send += 1;
    }
    let mut slla = [0u8; 8];
    slla[0] = nd_option::SOURCE_LINK_ADDR;
    slla[1] = 1;
    slla[2..8].copy_from_slice(&ph.mac_unicast.octets());

    let mut tx = PacketTx::new(&slla, None);
    let header = tx.prepend(24);
    header[0] = icmp6_type::NEIGHBOR_SOLICITATION;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4..8].copy_from_slice(&[0; 4]);
    header[8..24].copy_from_slice(&target.octets());
    finish_and_send(ph, tx, src, target.solicited_node_multicast(), ND_HOP_LIMIT, None);
}

/// DAD probe for a tentative address: unspecified source, no SLLA option.
pub(crate) fn phtx_nd_dad_solicitation(ph: &PacketHandler, target: Ip6Address) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp6__pre_assemble += 1;
        stats.icmp6__nd_neighbor_solicitation__send += 1;
    }
    let mut tx = PacketTx::empty(None);
    let header = tx.prepend(24);
    header[0] = icmp6_type::NEIGHBOR_SOLICITATION;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4..8].copy_from_slice(&[0; 4]);
    header[8..24].copy_from_slice(&target.octets());
    finish_and_send(
        ph,
        tx,
        Ip6Address::UNSPECIFIED,
        target.solicited_node_multicast(),
        ND_HOP_LIMIT,
        None,
    );
}
