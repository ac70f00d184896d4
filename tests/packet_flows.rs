//! RX/TX packet-flow tests.
//!
//! Each test feeds a synthesized inbound frame (or fragment sequence) to
//! the packet handler and asserts the exact receive/transmit statistics
//! bundle plus the frames that came out of the TX ring. Addresses match
//! the stack's canonical test setup: the stack at 02:00:00:77:77:77 /
//! 192.168.9.7/24 / 2603:9000:e307:9f09:0:ff:fe77:7777/64, the peer at
//! 52:54:00:df:85:37 / 192.168.9.102 / 2603:9000:e307:9f09::1fa1.

use std::sync::Arc;

use tapstack::addr::{Ip4Address, Ip6Address, MacAddress};
use tapstack::buffer::PacketTx;
use tapstack::checksum;
use tapstack::config::StackConfig;
use tapstack::ethernet::{ether_type, EtherHdr};
use tapstack::handler::PacketHandler;
use tapstack::icmpv6::{icmp6_type, nd_option};
use tapstack::ip_proto;
use tapstack::ipv4::{Ipv4Flags, Ipv4Hdr};
use tapstack::ipv6::{Ipv6FragHdr, Ipv6Hdr};
use tapstack::stats::{PacketStatsRx, PacketStatsTx};
use tapstack::tcp::TcpHdr;
use tapstack::udp::UdpHdr;

fn stack_mac() -> MacAddress {
    "02:00:00:77:77:77".parse().unwrap()
}

fn peer_mac() -> MacAddress {
    "52:54:00:df:85:37".parse().unwrap()
}

fn stack_ip4() -> Ip4Address {
    "192.168.9.7".parse().unwrap()
}

fn peer_ip4() -> Ip4Address {
    "192.168.9.102".parse().unwrap()
}

fn stack_ip6() -> Ip6Address {
    "2603:9000:e307:9f09:0:ff:fe77:7777".parse().unwrap()
}

fn peer_ip6() -> Ip6Address {
    "2603:9000:e307:9f09::1fa1".parse().unwrap()
}

/// Handler with the canonical test addresses claimed and both neighbor
/// caches primed with the peer, so transmit-side lookups hit.
fn handler() -> Arc<PacketHandler> {
    let ph = PacketHandler::new(StackConfig::default());
    ph.assign_ip4_host("192.168.9.7/24".parse().unwrap());
    ph.assign_ip6_host("2603:9000:e307:9f09:0:ff:fe77:7777/64".parse().unwrap());
    ph.join_ip6_multicast(Ip6Address::ALL_NODES);
    ph.arp_cache.add_entry(peer_ip4(), peer_mac());
    ph.nd_cache.add_entry(peer_ip6(), peer_mac());
    ph
}

fn assert_stats(ph: &PacketHandler, rx: PacketStatsRx, tx: PacketStatsTx) {
    assert_eq!(*ph.stats_rx.read(), rx, "receive counters diverge");
    assert_eq!(*ph.stats_tx.read(), tx, "transmit counters diverge");
}

// Inbound frame builders

fn ip4_frame(proto: u8, id: u16, flags: Ipv4Flags, frag_offset: usize, payload: &[u8]) -> Vec<u8> {
    let mut tx = PacketTx::new(payload, None);
    Ipv4Hdr::assemble(&mut tx, peer_ip4(), stack_ip4(), proto, 64, id, flags, frag_offset);
    EtherHdr::assemble(&mut tx, stack_mac(), peer_mac(), ether_type::IP4);
    tx.as_slice().to_vec()
}

fn ip6_frame_to(dst_mac: MacAddress, dst: Ip6Address, src: Ip6Address, next: u8, payload: &[u8]) -> Vec<u8> {
    let mut tx = PacketTx::new(payload, None);
    Ipv6Hdr::assemble(&mut tx, src, dst, next, 64);
    EtherHdr::assemble(&mut tx, dst_mac, peer_mac(), ether_type::IP6);
    tx.as_slice().to_vec()
}

fn ip6_frame(next: u8, payload: &[u8]) -> Vec<u8> {
    ip6_frame_to(stack_mac(), stack_ip6(), peer_ip6(), next, payload)
}

fn icmp4_echo_request(id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut msg = vec![8u8, 0, 0, 0];
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(data);
    let cksum = checksum::checksum(&msg, 0);
    msg[2..4].copy_from_slice(&cksum.to_be_bytes());
    msg
}

fn udp4_segment(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut seg = Vec::with_capacity(len);
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&(len as u16).to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.extend_from_slice(payload);
    let pseudo = checksum::pseudo_sum_v4(peer_ip4(), stack_ip4(), ip_proto::UDP, len);
    let cksum = checksum::checksum(&seg, pseudo);
    seg[6..8].copy_from_slice(&cksum.to_be_bytes());
    seg
}

fn udp6_segment(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut seg = Vec::with_capacity(len);
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&(len as u16).to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.extend_from_slice(payload);
    let pseudo = checksum::pseudo_sum_v6(&peer_ip6(), &stack_ip6(), ip_proto::UDP, len);
    let cksum = checksum::checksum(&seg, pseudo);
    seg[6..8].copy_from_slice(&cksum.to_be_bytes());
    seg
}

fn tcp4_syn(sport: u16, dport: u16, seq: u32) -> Vec<u8> {
    let mut seg = vec![0u8; 24];
    seg[0..2].copy_from_slice(&sport.to_be_bytes());
    seg[2..4].copy_from_slice(&dport.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    seg[12] = 6 << 4;
    seg[13] = 0x02; // SYN
    seg[14..16].copy_from_slice(&64_240u16.to_be_bytes());
    seg[20..24].copy_from_slice(&[2, 4, 0x05, 0xb4]); // MSS 1460
    let pseudo = checksum::pseudo_sum_v4(peer_ip4(), stack_ip4(), ip_proto::TCP, seg.len());
    let cksum = checksum::checksum(&seg, pseudo);
    seg[16..18].copy_from_slice(&cksum.to_be_bytes());
    seg
}

fn tcp6_syn(sport: u16, dport: u16, seq: u32) -> Vec<u8> {
    let mut seg = vec![0u8; 24];
    seg[0..2].copy_from_slice(&sport.to_be_bytes());
    seg[2..4].copy_from_slice(&dport.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    seg[12] = 6 << 4;
    seg[13] = 0x02;
    seg[14..16].copy_from_slice(&64_240u16.to_be_bytes());
    seg[20..24].copy_from_slice(&[2, 4, 0x05, 0xb4]);
    let pseudo = checksum::pseudo_sum_v6(&peer_ip6(), &stack_ip6(), ip_proto::TCP, seg.len());
    let cksum = checksum::checksum(&seg, pseudo);
    seg[16..18].copy_from_slice(&cksum.to_be_bytes());
    seg
}

/// Parse an emitted frame down to the IPv4 layer.
fn parse_ip4_reply(frame: &[u8]) -> (EtherHdr, Ipv4Hdr) {
    let ether = EtherHdr::parse(frame).unwrap();
    assert_eq!(ether.ethertype, ether_type::IP4);
    let ip4 = Ipv4Hdr::parse(frame, ether.payload.clone()).unwrap();
    assert!(ip4.verify_checksum(frame));
    (ether, ip4)
}

fn parse_ip6_reply(frame: &[u8]) -> (EtherHdr, Ipv6Hdr) {
    let ether = EtherHdr::parse(frame).unwrap();
    assert_eq!(ether.ethertype, ether_type::IP6);
    let ip6 = Ipv6Hdr::parse(frame, ether.payload.clone()).unwrap();
    (ether, ip6)
}

#[test]
fn icmp4_ping_is_answered() {
    let ph = handler();
    let icmp = icmp4_echo_request(0x1234, 7, &[0xab; 56]);
    ph.receive_frame(ip4_frame(ip_proto::ICMP4, 0x0101, Ipv4Flags::empty(), 0, &icmp));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip4__pre_parse: 1,
            ip4__dst_unicast: 1,
            icmp4__pre_parse: 1,
            icmp4__echo_request__respond_echo_reply: 1,
            ..Default::default()
        },
        PacketStatsTx {
            icmp4__pre_assemble: 1,
            icmp4__echo_reply__send: 1,
            ip4__pre_assemble: 1,
            ip4__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip4_lookup: 1,
            ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (ether, ip4) = parse_ip4_reply(frame);
    assert_eq!(ether.dst, peer_mac());
    assert_eq!(ether.src, stack_mac());
    assert_eq!(ip4.src, stack_ip4());
    assert_eq!(ip4.dst, peer_ip4());
    assert_eq!(ip4.proto, ip_proto::ICMP4);
    let icmp = &frame[ip4.payload.clone()];
    assert_eq!(icmp[0], 0); // echo reply
    assert_eq!(checksum::checksum(icmp, 0), 0);
    assert_eq!(&icmp[4..6], &0x1234u16.to_be_bytes());
    assert_eq!(&icmp[6..8], &7u16.to_be_bytes());
    assert_eq!(&icmp[8..], &[0xab; 56]);
}

#[test]
fn udp4_to_closed_port_draws_unreachable() {
    let ph = handler();
    let udp = udp4_segment(54321, 9999, b"is anyone there?");
    let inbound = ip4_frame(ip_proto::UDP, 0x0202, Ipv4Flags::empty(), 0, &udp);
    ph.receive_frame(inbound.clone());

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip4__pre_parse: 1,
            ip4__dst_unicast: 1,
            udp__pre_parse: 1,
            udp__no_socket_match__respond_icmp4_unreachable: 1,
            ..Default::default()
        },
        PacketStatsTx {
            icmp4__pre_assemble: 1,
            icmp4__unreachable_port__send: 1,
            ip4__pre_assemble: 1,
            ip4__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip4_lookup: 1,
            ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip4) = parse_ip4_reply(frame);
    assert_eq!(ip4.proto, ip_proto::ICMP4);
    let icmp = &frame[ip4.payload.clone()];
    assert_eq!(icmp[0], 3); // destination unreachable
    assert_eq!(icmp[1], 3); // port
    assert_eq!(checksum::checksum(icmp, 0), 0);
    // The quote is the offending IP datagram.
    assert_eq!(&icmp[8..], &inbound[14..]);
}

#[test]
fn udp4_echo_native_bounces_datagram() {
    let ph = handler();
    let udp = udp4_segment(12345, 7, b"bounce me back please");
    ph.receive_frame(ip4_frame(ip_proto::UDP, 0x0303, Ipv4Flags::empty(), 0, &udp));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip4__pre_parse: 1,
            ip4__dst_unicast: 1,
            udp__pre_parse: 1,
            udp__echo_native__respond_udp: 1,
            ..Default::default()
        },
        PacketStatsTx {
            udp__pre_assemble: 1,
            udp__send: 1,
            ip4__pre_assemble: 1,
            ip4__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip4_lookup: 1,
            ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip4) = parse_ip4_reply(frame);
    let udp = UdpHdr::parse(frame, ip4.payload.clone()).unwrap();
    assert_eq!(udp.sport, 7);
    assert_eq!(udp.dport, 12345);
    assert_eq!(&frame[udp.payload.clone()], b"bounce me back please");
}

fn run_ip4_frag_order(order: &[usize]) {
    let ph = handler();
    let udp = udp4_segment(12345, 7, &vec![0x5a; 592]);
    // Five 120-byte fragments of the 600-byte datagram.
    let frags: Vec<Vec<u8>> = (0..5)
        .map(|i| {
            let offset = i * 120;
            let last = i == 4;
            ip4_frame(
                ip_proto::UDP,
                0x4242,
                if last { Ipv4Flags::empty() } else { Ipv4Flags::MF },
                offset,
                &udp[offset..offset + 120],
            )
        })
        .collect();

    for &index in order {
        ph.receive_frame(frags[index].clone());
    }

    let n = order.len() as u32;
    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: n,
            ether__dst_unicast: n,
            ip4__pre_parse: n,
            ip4__dst_unicast: n,
            ip4__frag: n,
            ip4__defrag: 1,
            udp__pre_parse: 1,
            udp__echo_native__respond_udp: 1,
            ..Default::default()
        },
        PacketStatsTx {
            udp__pre_assemble: 1,
            udp__send: 1,
            ip4__pre_assemble: 1,
            ip4__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip4_lookup: 1,
            ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip4) = parse_ip4_reply(frame);
    let reply = UdpHdr::parse(frame, ip4.payload.clone()).unwrap();
    assert_eq!(reply.sport, 7);
    assert_eq!(reply.dport, 12345);
    assert_eq!(&frame[reply.payload.clone()], &[0x5a; 592][..]);
}

#[test]
fn ip4_fragments_in_order() {
    run_ip4_frag_order(&[0, 1, 2, 3, 4]);
}

#[test]
fn ip4_fragments_reversed() {
    run_ip4_frag_order(&[4, 3, 2, 1, 0]);
}

#[test]
fn ip4_fragments_shuffled() {
    run_ip4_frag_order(&[1, 2, 0, 4, 3]);
}

#[test]
fn ip4_fragments_with_duplicates() {
    run_ip4_frag_order(&[1, 2, 0, 2, 1, 0, 3, 3, 4, 1]);
}

#[test]
fn oversized_udp4_echo_is_fragmented_on_transmit() {
    let ph = handler();
    let payload = vec![0x7e; 6992]; // 7000-byte datagram, five fragments out
    let udp = udp4_segment(12345, 7, &payload);
    ph.receive_frame(ip4_frame(ip_proto::UDP, 0x0505, Ipv4Flags::empty(), 0, &udp));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip4__pre_parse: 1,
            ip4__dst_unicast: 1,
            udp__pre_parse: 1,
            udp__echo_native__respond_udp: 1,
            ..Default::default()
        },
        PacketStatsTx {
            udp__pre_assemble: 1,
            udp__send: 1,
            ip4__pre_assemble: 1,
            ip4__mtu_exceed__frag: 1,
            ip4__mtu_exceed__frag__send: 5,
            ether__pre_assemble: 5,
            ether__src_unspec__fill: 5,
            ether__dst_unspec__ip4_lookup: 5,
            ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: 5,
            ..Default::default()
        },
    );

    // The fragments reassemble to the original echo.
    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 5);
    let mut reassembled = Vec::new();
    let mut expected_offset = 0;
    for (index, frame) in frames.iter().enumerate() {
        let (_, ip4) = parse_ip4_reply(frame.as_slice());
        assert_eq!(ip4.frag_offset, expected_offset);
        assert_eq!(ip4.flags.contains(Ipv4Flags::MF), index < 4);
        reassembled.extend_from_slice(&frame.as_slice()[ip4.payload.clone()]);
        expected_offset += ip4.payload.len();
    }
    let reply = UdpHdr::parse(&reassembled, 0..reassembled.len()).unwrap();
    assert_eq!(reply.sport, 7);
    assert_eq!(&reassembled[reply.payload.clone()], &payload[..]);
}

#[test]
fn tcp4_syn_to_closed_port_draws_rst() {
    let ph = handler();
    let syn = tcp4_syn(33333, 9999, 0x0badcafe);
    ph.receive_frame(ip4_frame(ip_proto::TCP, 0x0606, Ipv4Flags::empty(), 0, &syn));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip4__pre_parse: 1,
            ip4__dst_unicast: 1,
            tcp__pre_parse: 1,
            tcp__no_socket_match__respond_rst: 1,
            ..Default::default()
        },
        PacketStatsTx {
            tcp__pre_assemble: 1,
            tcp__flag_rst: 1,
            tcp__flag_ack: 1,
            tcp__send: 1,
            ip4__pre_assemble: 1,
            ip4__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip4_lookup: 1,
            ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip4) = parse_ip4_reply(frame);
    let tcp = TcpHdr::parse(frame, ip4.payload.clone()).unwrap();
    assert!(tcp.flags.rst && tcp.flags.ack);
    assert_eq!(tcp.sport, 9999);
    assert_eq!(tcp.dport, 33333);
    assert_eq!(tcp.seq, 0);
    assert_eq!(tcp.ack, 0x0badcafe + 1);
    assert!(tcp.verify_checksum(
        frame,
        &tapstack::addr::IpAddress::Ip4(stack_ip4()),
        &tapstack::addr::IpAddress::Ip4(peer_ip4())
    ));
}

#[test]
fn arp_request_for_stack_address_is_answered_and_learned() {
    let ph = handler();
    // A fresh cache shows the learning.
    ph.arp_cache.remove_entry(peer_ip4());

    let mut tx = PacketTx::empty(None);
    tapstack::arp::ArpHdr::assemble(
        &mut tx,
        tapstack::arp::arp_op::REQUEST,
        peer_mac(),
        peer_ip4(),
        MacAddress::UNSPECIFIED,
        stack_ip4(),
    );
    EtherHdr::assemble(&mut tx, MacAddress::BROADCAST, peer_mac(), ether_type::ARP);
    ph.receive_frame(tx.as_slice().to_vec());

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_broadcast: 1,
            arp__pre_parse: 1,
            arp__op_request: 1,
            arp__op_request__tpa_stack__respond: 1,
            arp__op_request__update_arp_cache: 1,
            ..Default::default()
        },
        PacketStatsTx {
            arp__pre_assemble: 1,
            arp__op_reply__send: 1,
            ether__pre_assemble: 1,
            ether__src_spec: 1,
            ether__dst_spec__send: 1,
            ..Default::default()
        },
    );

    assert_eq!(ph.arp_cache.find_entry(peer_ip4()), Some(peer_mac()));

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let ether = EtherHdr::parse(frame).unwrap();
    assert_eq!(ether.dst, peer_mac());
    assert_eq!(ether.ethertype, ether_type::ARP);
    let arp = tapstack::arp::ArpHdr::parse(frame, ether.payload.clone()).unwrap();
    assert_eq!(arp.oper, tapstack::arp::arp_op::REPLY);
    assert_eq!(arp.sha, stack_mac());
    assert_eq!(arp.spa, stack_ip4());
    assert_eq!(arp.tha, peer_mac());
    assert_eq!(arp.tpa, peer_ip4());
}

// ICMPv6 / ND builders

fn icmp6_checksummed(mut msg: Vec<u8>, src: &Ip6Address, dst: &Ip6Address) -> Vec<u8> {
    let pseudo = checksum::pseudo_sum_v6(src, dst, ip_proto::ICMP6, msg.len());
    let cksum = checksum::checksum(&msg, pseudo);
    msg[2..4].copy_from_slice(&cksum.to_be_bytes());
    msg
}

fn icmp6_echo_request(id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut msg = vec![icmp6_type::ECHO_REQUEST, 0, 0, 0];
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(data);
    icmp6_checksummed(msg, &peer_ip6(), &stack_ip6())
}

#[test]
fn icmp6_ping_is_answered() {
    let ph = handler();
    let icmp = icmp6_echo_request(0x5678, 3, &[0xcd; 40]);
    ph.receive_frame(ip6_frame(ip_proto::ICMP6, &icmp));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_unicast: 1,
            icmp6__pre_parse: 1,
            icmp6__echo_request__respond_echo_reply: 1,
            ..Default::default()
        },
        PacketStatsTx {
            icmp6__pre_assemble: 1,
            icmp6__echo_reply__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (ether, ip6) = parse_ip6_reply(frame);
    assert_eq!(ether.dst, peer_mac());
    assert_eq!(ip6.src, stack_ip6());
    assert_eq!(ip6.dst, peer_ip6());
    let icmp = &frame[ip6.payload.clone()];
    assert_eq!(icmp[0], icmp6_type::ECHO_REPLY);
    let pseudo = checksum::pseudo_sum_v6(&ip6.src, &ip6.dst, ip_proto::ICMP6, icmp.len());
    assert_eq!(checksum::checksum(icmp, pseudo), 0);
    assert_eq!(&icmp[8..], &[0xcd; 40]);
}

#[test]
fn udp6_to_closed_port_draws_unreachable() {
    let ph = handler();
    let udp = udp6_segment(54321, 9999, b"anyone on six?");
    let inbound = ip6_frame(ip_proto::UDP, &udp);
    ph.receive_frame(inbound.clone());

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_unicast: 1,
            udp__pre_parse: 1,
            udp__no_socket_match__respond_icmp6_unreachable: 1,
            ..Default::default()
        },
        PacketStatsTx {
            icmp6__pre_assemble: 1,
            icmp6__unreachable_port__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip6) = parse_ip6_reply(frame);
    assert_eq!(ip6.next, ip_proto::ICMP6);
    let icmp = &frame[ip6.payload.clone()];
    assert_eq!(icmp[0], icmp6_type::UNREACHABLE);
    assert_eq!(icmp[1], 4); // port
    // The quote is the offending IPv6 packet.
    assert_eq!(&icmp[8..], &inbound[14..]);
}

#[test]
fn udp6_echo_native_bounces_datagram() {
    let ph = handler();
    let udp = udp6_segment(12345, 7, b"six echo");
    ph.receive_frame(ip6_frame(ip_proto::UDP, &udp));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_unicast: 1,
            udp__pre_parse: 1,
            udp__echo_native__respond_udp: 1,
            ..Default::default()
        },
        PacketStatsTx {
            udp__pre_assemble: 1,
            udp__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip6) = parse_ip6_reply(frame);
    let udp = UdpHdr::parse(frame, ip6.payload.clone()).unwrap();
    assert_eq!(udp.sport, 7);
    assert_eq!(udp.dport, 12345);
    assert_eq!(&frame[udp.payload.clone()], b"six echo");
}

fn run_ip6_frag_order(order: &[usize]) {
    let ph = handler();
    let udp = udp6_segment(12345, 7, &vec![0x6b; 592]);
    // Five fragments behind the Fragment extension header.
    let frags: Vec<Vec<u8>> = (0..5)
        .map(|i| {
            let offset = i * 120;
            let more = i < 4;
            let mut tx = PacketTx::new(&udp[offset..offset + 120], None);
            Ipv6FragHdr::assemble(&mut tx, ip_proto::UDP, offset, more, 0xcafe_f00d);
            Ipv6Hdr::assemble(&mut tx, peer_ip6(), stack_ip6(), ip_proto::IP6_FRAG, 64);
            EtherHdr::assemble(&mut tx, stack_mac(), peer_mac(), ether_type::IP6);
            tx.as_slice().to_vec()
        })
        .collect();

    for &index in order {
        ph.receive_frame(frags[index].clone());
    }

    let n = order.len() as u32;
    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: n,
            ether__dst_unicast: n,
            // The reassembled packet runs through the IPv6 parser again.
            ip6__pre_parse: n + 1,
            ip6__dst_unicast: n + 1,
            ip6_ext_frag__pre_parse: n,
            ip6_ext_frag__defrag: 1,
            udp__pre_parse: 1,
            udp__echo_native__respond_udp: 1,
            ..Default::default()
        },
        PacketStatsTx {
            udp__pre_assemble: 1,
            udp__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip6) = parse_ip6_reply(frame);
    let reply = UdpHdr::parse(frame, ip6.payload.clone()).unwrap();
    assert_eq!(reply.sport, 7);
    assert_eq!(&frame[reply.payload.clone()], &[0x6b; 592][..]);
}

#[test]
fn ip6_fragments_in_order() {
    run_ip6_frag_order(&[0, 1, 2, 3, 4]);
}

#[test]
fn ip6_fragments_reversed() {
    run_ip6_frag_order(&[4, 3, 2, 1, 0]);
}

#[test]
fn ip6_fragments_shuffled() {
    run_ip6_frag_order(&[1, 2, 0, 4, 3]);
}

#[test]
fn ip6_fragments_with_duplicates() {
    run_ip6_frag_order(&[1, 2, 0, 2, 1, 0, 3, 3, 4, 1]);
}

#[test]
fn oversized_udp6_echo_is_fragmented_on_transmit() {
    let ph = handler();
    let payload = vec![0x42; 6992];
    let udp = udp6_segment(12345, 7, &payload);
    ph.receive_frame(ip6_frame(ip_proto::UDP, &udp));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_unicast: 1,
            udp__pre_parse: 1,
            udp__echo_native__respond_udp: 1,
            ..Default::default()
        },
        PacketStatsTx {
            udp__pre_assemble: 1,
            udp__send: 1,
            // Once for the oversized packet, once per emitted fragment.
            ip6__pre_assemble: 6,
            ip6__mtu_exceed__frag: 1,
            ip6__mtu_ok__send: 5,
            ip6_ext_frag__pre_assemble: 1,
            ip6_ext_frag__send: 5,
            ether__pre_assemble: 5,
            ether__src_unspec__fill: 5,
            ether__dst_unspec__ip6_lookup: 5,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 5,
            ..Default::default()
        },
    );

    // Fragments carry a shared identifier and reassemble to the original.
    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 5);
    let mut reassembled = Vec::new();
    let mut id = None;
    for (index, frame) in frames.iter().enumerate() {
        let (_, ip6) = parse_ip6_reply(frame.as_slice());
        assert_eq!(ip6.next, ip_proto::IP6_FRAG);
        let frag =
            Ipv6FragHdr::parse(frame.as_slice(), ip6.payload.start, ip6.payload.end).unwrap();
        assert_eq!(frag.next, ip_proto::UDP);
        assert_eq!(frag.more, index < 4);
        match id {
            None => id = Some(frag.id),
            Some(id) => assert_eq!(frag.id, id),
        }
        assert_eq!(frag.offset, reassembled.len());
        reassembled.extend_from_slice(&frame.as_slice()[frag.payload.clone()]);
    }
    let reply = UdpHdr::parse(&reassembled, 0..reassembled.len()).unwrap();
    assert_eq!(reply.sport, 7);
    assert_eq!(&reassembled[reply.payload.clone()], &payload[..]);
}

#[test]
fn tcp6_syn_to_closed_port_draws_rst() {
    let ph = handler();
    let syn = tcp6_syn(33333, 9999, 0x600dcafe);
    ph.receive_frame(ip6_frame(ip_proto::TCP, &syn));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_unicast: 1,
            tcp__pre_parse: 1,
            tcp__no_socket_match__respond_rst: 1,
            ..Default::default()
        },
        PacketStatsTx {
            tcp__pre_assemble: 1,
            tcp__flag_rst: 1,
            tcp__flag_ack: 1,
            tcp__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 1,
            ..Default::default()
        },
    );

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip6) = parse_ip6_reply(frame);
    let tcp = TcpHdr::parse(frame, ip6.payload.clone()).unwrap();
    assert!(tcp.flags.rst && tcp.flags.ack);
    assert_eq!(tcp.seq, 0);
    assert_eq!(tcp.ack, 0x600dcafe + 1);
}

#[test]
fn nd_solicitation_with_slla_is_answered_and_learned() {
    let ph = handler();
    ph.nd_cache.remove_entry(peer_ip6());

    let mut msg = vec![icmp6_type::NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
    msg.extend_from_slice(&stack_ip6().octets());
    msg.extend_from_slice(&[nd_option::SOURCE_LINK_ADDR, 1]);
    msg.extend_from_slice(&peer_mac().octets());
    let msg = icmp6_checksummed(msg, &peer_ip6(), &stack_ip6());
    ph.receive_frame(ip6_frame(ip_proto::ICMP6, &msg));

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_unicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_unicast: 1,
            icmp6__pre_parse: 1,
            icmp6__nd_neighbor_solicitation: 1,
            icmp6__nd_neighbor_solicitation__update_nd_cache: 1,
            icmp6__nd_neighbor_solicitation__target_stack__respond: 1,
            ..Default::default()
        },
        PacketStatsTx {
            icmp6__pre_assemble: 1,
            icmp6__nd_neighbor_advertisement__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: 1,
            ..Default::default()
        },
    );

    assert_eq!(ph.nd_cache.find_entry(peer_ip6()), Some(peer_mac()));

    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (_, ip6) = parse_ip6_reply(frame);
    assert_eq!(ip6.dst, peer_ip6());
    assert_eq!(ip6.hop, 255);
    let icmp = &frame[ip6.payload.clone()];
    assert_eq!(icmp[0], icmp6_type::NEIGHBOR_ADVERTISEMENT);
    assert_eq!(icmp[4] & 0x60, 0x60); // solicited + override
    assert_eq!(&icmp[8..24], &stack_ip6().octets());
}

#[test]
fn nd_dad_solicitation_is_defended() {
    let ph = handler();
    let solicited_node = stack_ip6().solicited_node_multicast();

    let mut msg = vec![icmp6_type::NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0];
    msg.extend_from_slice(&stack_ip6().octets());
    let msg = icmp6_checksummed(msg, &Ip6Address::UNSPECIFIED, &solicited_node);

    let frame = ip6_frame_to(
        MacAddress::from_ip6_multicast(solicited_node),
        solicited_node,
        Ip6Address::UNSPECIFIED,
        ip_proto::ICMP6,
        &msg,
    );
    ph.receive_frame(frame);

    assert_stats(
        &ph,
        PacketStatsRx {
            ether__pre_parse: 1,
            ether__dst_multicast: 1,
            ip6__pre_parse: 1,
            ip6__dst_multicast: 1,
            icmp6__pre_parse: 1,
            icmp6__nd_neighbor_solicitation: 1,
            icmp6__nd_neighbor_solicitation__dad: 1,
            icmp6__nd_neighbor_solicitation__target_stack__respond: 1,
            ..Default::default()
        },
        PacketStatsTx {
            icmp6__pre_assemble: 1,
            icmp6__nd_neighbor_advertisement__send: 1,
            ip6__pre_assemble: 1,
            ip6__mtu_ok__send: 1,
            ether__pre_assemble: 1,
            ether__src_unspec__fill: 1,
            ether__dst_unspec__ip6_lookup: 1,
            ether__dst_unspec__ip6_lookup__multicast__send: 1,
            ..Default::default()
        },
    );

    // The advertisement defends the address on the solicited-node group.
    let frames = ph.tx_ring.drain();
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_slice();
    let (ether, ip6) = parse_ip6_reply(frame);
    assert_eq!(ether.dst, MacAddress::from_ip6_multicast(solicited_node));
    assert_eq!(ip6.dst, solicited_node);
    let icmp = &frame[ip6.payload.clone()];
    assert_eq!(icmp[0], icmp6_type::NEIGHBOR_ADVERTISEMENT);
    assert_eq!(icmp[4] & 0x40, 0); // not solicited
    assert_eq!(&icmp[8..24], &stack_ip6().octets());
}
