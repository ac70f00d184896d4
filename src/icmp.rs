//! ICMPv4 protocol processing (RFC 792)
//!
//! Echo responder plus destination-unreachable generation for closed UDP
//! ports. Other message types are counted and dropped.

use core::ops::Range;

use crate::addr::Ip4Address;
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::checksum;
use crate::handler::PacketHandler;
use crate::ip_proto;
use crate::ipv4;

/// Fixed part of every ICMPv4 message.
pub const ICMP4_HEADER_LEN: usize = 4;

/// How much of the offending datagram an unreachable message quotes.
pub const ICMP4_UNREACHABLE_QUOTE: usize = 548;

/// Message types handled by the stack.
pub mod icmp4_type {
    pub const ECHO_REPLY: u8 = 0;
    pub const UNREACHABLE: u8 = 3;
    pub const ECHO_REQUEST: u8 = 8;
}

/// Unreachable codes.
pub mod icmp4_code {
    pub const UNREACHABLE_PORT: u8 = 3;
}

/// Parsed ICMPv4 message.
#[derive(Debug, Clone)]
pub enum Icmp4Msg {
    EchoRequest { id: u16, seq: u16, data: Range<usize> },
    EchoReply { id: u16, seq: u16, data: Range<usize> },
    Unreachable { code: u8, quote: Range<usize> },
    Other { msg_type: u8, code: u8 },
}

impl Icmp4Msg {
    /// Parse and checksum-verify the message spanning `at` in `frame`.
    pub fn parse(frame: &[u8], at: Range<usize>) -> Result<Icmp4Msg, &'static str> {
        let data = &frame[at.clone()];
        if data.len() < ICMP4_HEADER_LEN {
            return Err("icmp4: message shorter than header");
        }
        if checksum::checksum(data, 0) != 0 {
            return Err("icmp4: bad checksum");
        }
        let msg_type = data[0];
        let code = data[1];
        match msg_type {
            icmp4_type::ECHO_REQUEST | icmp4_type::ECHO_REPLY => {
                if data.len() < 8 {
                    return Err("icmp4: echo message truncated");
                }
                let id = u16::from_be_bytes([data[4], data[5]]);
                let seq = u16::from_be_bytes([data[6], data[7]]);
                let body = at.start + 8..at.end;
                if msg_type == icmp4_type::ECHO_REQUEST {
                    Ok(Icmp4Msg::EchoRequest { id, seq, data: body })
                } else {
                    Ok(Icmp4Msg::EchoReply { id, seq, data: body })
                }
            }
            icmp4_type::UNREACHABLE => {
                if data.len() < 8 {
                    return Err("icmp4: unreachable message truncated");
                }
                Ok(Icmp4Msg::Unreachable {
                    code,
                    quote: at.start + 8..at.end,
                })
            }
            _ => Ok(Icmp4Msg::Other { msg_type, code }),
        }
    }
}

/// Handle an inbound ICMPv4 message.
pub fn phrx_icmp4(ph: &PacketHandler, rx: &mut PacketRx) {
    ph.stats_rx.write().icmp4__pre_parse += 1;

    let ip4 = match rx.ip4.as_ref() {
        Some(ip4) => ip4.clone(),
        None => return,
    };

    let msg = match Icmp4Msg::parse(&rx.frame, ip4.payload.clone()) {
        Ok(msg) => msg,
        Err(reason) => {
            ph.stats_rx.write().icmp4__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "icmp4", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    match msg {
        Icmp4Msg::EchoRequest { id, seq, data } => {
            ph.stats_rx.write().icmp4__echo_request__respond_echo_reply += 1;
            log::debug!(
                target: "icmp4",
                "{} - echo request from {}, id {}, seq {}",
                rx.tracker, ip4.src, id, seq
            );
            let body = rx.frame[data].to_vec();
            phtx_icmp4_echo_reply(ph, id, seq, &body, ip4.dst, ip4.src, Some(rx.tracker));
        }
        Icmp4Msg::EchoReply { id, seq, .. } => {
            ph.stats_rx.write().icmp4__echo_reply += 1;
            log::debug!(
                target: "icmp4",
                "{} - echo reply from {}, id {}, seq {}",
                rx.tracker, ip4.src, id, seq
            );
        }
        Icmp4Msg::Unreachable { code, .. } => {
            ph.stats_rx.write().icmp4__unreachable += 1;
            log::debug!(
                target: "icmp4",
                "{} - destination unreachable (code {}) from {}",
                rx.tracker, code, ip4.src
            );
        }
        Icmp4Msg::Other { msg_type, .. } => {
            ph.stats_rx.write().icmp4__unknown_drop += 1;
            log::debug!(
                target: "icmp4",
                "{} - unsupported type {}, dropping",
                rx.tracker, msg_type
            );
        }
    }
}

/// Assemble and transmit an echo reply.
pub fn phtx_icmp4_echo_reply(
    ph: &PacketHandler,
    id: u16,
    seq: u16,
    data: &[u8],
    src: Ip4Address,
    dst: Ip4Address,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp4__pre_assemble += 1;
        stats.icmp4__echo_reply__send += 1;
    }
    let mut tx = PacketTx::new(data, echo_tracker);
    let header = tx.prepend(8);
    header[0] = icmp4_type::ECHO_REPLY;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4..6].copy_from_slice(&id.to_be_bytes());
    header[6..8].copy_from_slice(&seq.to_be_bytes());
    let cksum = checksum::checksum(tx.as_slice(), 0);
    tx.patch(2, &cksum.to_be_bytes());
    ipv4::phtx_ip4(ph, tx, src, dst, ip_proto::ICMP4, false, echo_tracker);
}

/// Assemble and transmit an echo request.
pub fn phtx_icmp4_echo_request(
    ph: &PacketHandler,
    id: u16,
    seq: u16,
    data: &[u8],
    src: Ip4Address,
    dst: Ip4Address,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp4__pre_assemble += 1;
        stats.icmp4__echo_request__send += 1;
    }
    let mut tx = PacketTx::new(data, None);
    let header = tx.prepend(8);
    header[0] = icmp4_type::ECHO_REQUEST;
    header[1] = 0;
    header[2] = 0;
    header[3] = 0;
    header[4..6].copy_from_slice(&id.to_be_bytes());
    header[6..8].copy_from_slice(&seq.to_be_bytes());
    let cksum = checksum::checksum(tx.as_slice(), 0);
    tx.patch(2, &cksum.to_be_bytes());
    ipv4::phtx_ip4(ph, tx, src, dst, ip_proto::ICMP4, false, None);
}

/// Assemble and transmit a destination-unreachable (port) message quoting
/// the offending datagram.
pub fn phtx_icmp4_unreachable_port(
    ph: &PacketHandler,
    original: &[u8],
    src: Ip4Address,
    dst: Ip4Address,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.icmp4__pre_assemble += 1;
        stats.icmp4__unreachable_port__send += 1;
    }
    let quote = &original[..original.len().min(ICMP4_UNREACHABLE_QUOTE)];
    let mut tx = PacketTx::new(quote, echo_tracker);
    let header = tx.prepend(8);
    header[0] = icmp4_type::UNREACHABLE;
    header[1] = icmp4_code::UNREACHABLE_PORT;
    header[2] = 0;
    header[3] = 0;
    header[4..8].copy_from_slice(&[0; 4]);
    let cksum = checksum::checksum(tx.as_slice(), 0);
    tx.patch(2, &cksum.to_be_bytes());
    ipv4::phtx_ip4(ph, tx, src, dst, ip_proto::ICMP4, false, echo_tracker);
}
