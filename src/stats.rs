//! Packet statistics
//!
//! One counter per receive/transmit decision the packet handler can take.
//! The names mirror the decision path through the pipeline (layer, event,
//! action) and are asserted verbatim by the packet-flow tests, so they are
//! part of the crate's contract.

/// Receive-path counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketStatsRx {
    pub ether__pre_parse: u32,
    pub ether__failed_parse: u32,
    pub ether__dst_unicast: u32,
    pub ether__dst_multicast: u32,
    pub ether__dst_broadcast: u32,
    pub ether__dst_unknown_drop: u32,

    pub arp__pre_parse: u32,
    pub arp__failed_parse: u32,
    pub arp__op_request: u32,
    pub arp__op_request__ip_conflict_drop: u32,
    pub arp__op_request__tpa_stack__respond: u32,
    pub arp__op_request__update_arp_cache: u32,
    pub arp__op_request__tpa_unknown_drop: u32,
    pub arp__op_reply: u32,
    pub arp__op_reply__dad_conflict_drop: u32,
    pub arp__op_reply__update_arp_cache: u32,
    pub arp__op_reply__update_arp_cache_gratuitous: u32,
    pub arp__op_unknown_drop: u32,

    pub ip4__pre_parse: u32,
    pub ip4__failed_parse: u32,
    pub ip4__failed_sanity: u32,
    pub ip4__dst_unicast: u32,
    pub ip4__dst_multicast: u32,
    pub ip4__dst_broadcast: u32,
    pub ip4__dst_unknown_drop: u32,
    pub ip4__ttl_exceeded_drop: u32,
    pub ip4__frag: u32,
    pub ip4__defrag: u32,
    pub ip4__proto_unknown_drop: u32,

    pub ip6__pre_parse: u32,
    pub ip6__failed_parse: u32,
    pub ip6__failed_sanity: u32,
    pub ip6__dst_unicast: u32,
    pub ip6__dst_multicast: u32,
    pub ip6__dst_unknown_drop: u32,
    pub ip6__hop_exceeded_drop: u32,
    pub ip6__next_unknown_drop: u32,
    pub ip6_ext_frag__pre_parse: u32,
    pub ip6_ext_frag__failed_parse: u32,
    pub ip6_ext_frag__defrag: u32,

    pub icmp4__pre_parse: u32,
    pub icmp4__failed_parse: u32,
    pub icmp4__echo_request__respond_echo_reply: u32,
    pub icmp4__echo_reply: u32,
    pub icmp4__unreachable: u32,
    pub icmp4__unknown_drop: u32,

    pub icmp6__pre_parse: u32,
    pub icmp6__failed_parse: u32,
    pub icmp6__echo_request__respond_echo_reply: u32,
    pub icmp6__echo_reply: u32,
    pub icmp6__unreachable: u32,
    pub icmp6__nd_neighbor_solicitation: u32,
    pub icmp6__nd_neighbor_solicitation__dad: u32,
    pub icmp6__nd_neighbor_solicitation__update_nd_cache: u32,
    pub icmp6__nd_neighbor_solicitation__target_stack__respond: u32,
    pub icmp6__nd_neighbor_solicitation__target_unknown_drop: u32,
    pub icmp6__nd_neighbor_advertisement: u32,
    pub icmp6__nd_neighbor_advertisement__dad_conflict: u32,
    pub icmp6__nd_neighbor_advertisement__update_nd_cache: u32,
    pub icmp6__nd_router_solicitation_drop: u32,
    pub icmp6__nd_router_advertisement: u32,
    pub icmp6__unknown_drop: u32,

    pub udp__pre_parse: u32,
    pub udp__failed_parse: u32,
    pub udp__failed_sanity: u32,
    pub udp__socket_match: u32,
    pub udp__echo_native__respond_udp: u32,
    pub udp__no_socket_match__respond_icmp4_unreachable: u32,
    pub udp__no_socket_match__respond_icmp6_unreachable: u32,

    pub tcp__pre_parse: u32,
    pub tcp__failed_parse: u32,
    pub tcp__failed_sanity: u32,
    pub tcp__socket_match: u32,
    pub tcp__no_socket_match__respond_rst: u32,
}

/// Transmit-path counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketStatsTx {
    pub ether__pre_assemble: u32,
    pub ether__src_spec: u32,
    pub ether__src_unspec__fill: u32,
    pub ether__dst_spec__send: u32,
    pub ether__dst_unspec__ip4_lookup: u32,
    pub ether__dst_unspec__ip4_lookup__locnet__arp_cache_hit__send: u32,
    pub ether__dst_unspec__ip4_lookup__locnet__arp_cache_miss: u32,
    pub ether__dst_unspec__ip4_lookup__extnet__gw_arp_cache_hit__send: u32,
    pub ether__dst_unspec__ip4_lookup__extnet__gw_arp_cache_miss: u32,
    pub ether__dst_unspec__ip4_lookup__extnet__no_gw_drop: u32,
    pub ether__dst_unspec__ip4_lookup__multicast__send: u32,
    pub ether__dst_unspec__ip4_lookup__broadcast__send: u32,
    pub ether__dst_unspec__ip6_lookup: u32,
    pub ether__dst_unspec__ip6_lookup__locnet__nd_cache_hit__send: u32,
    pub ether__dst_unspec__ip6_lookup__locnet__nd_cache_miss: u32,
    pub ether__dst_unspec__ip6_lookup__extnet__gw_nd_cache_hit__send: u32,
    pub ether__dst_unspec__ip6_lookup__extnet__gw_nd_cache_miss: u32,
    pub ether__dst_unspec__ip6_lookup__extnet__no_gw_drop: u32,
    pub ether__dst_unspec__ip6_lookup__multicast__send: u32,
    pub ether__dst_unspec__drop: u32,
    pub ether__queue_full_drop: u32,

    pub arp__pre_assemble: u32,
    pub arp__op_request__send: u32,
    pub arp__op_reply__send: u32,

    pub ip4__pre_assemble: u32,
    pub ip4__mtu_ok__send: u32,
    pub ip4__mtu_exceed__frag: u32,
    pub ip4__mtu_exceed__frag__send: u32,
    pub ip4__mtu_exceed__df_drop: u32,

    pub ip6__pre_assemble: u32,
    pub ip6__mtu_ok__send: u32,
    pub ip6__mtu_exceed__frag: u32,
    pub ip6_ext_frag__pre_assemble: u32,
    pub ip6_ext_frag__send: u32,

    pub icmp4__pre_assemble: u32,
    pub icmp4__echo_request__send: u32,
    pub icmp4__echo_reply__send: u32,
    pub icmp4__unreachable_port__send: u32,

    pub icmp6__pre_assemble: u32,
    pub icmp6__echo_request__send: u32,
    pub icmp6__echo_reply__send: u32,
    pub icmp6__unreachable_port__send: u32,
    pub icmp6__nd_neighbor_solicitation__send: u32,
    pub icmp6__nd_neighbor_advertisement__send: u32,

    pub udp__pre_assemble: u32,
    pub udp__send: u32,

    pub tcp__pre_assemble: u32,
    pub tcp__flag_syn: u32,
    pub tcp__flag_ack: u32,
    pub tcp__flag_fin: u32,
    pub tcp__flag_rst: u32,
    pub tcp__send: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_all_zero_and_comparable() {
        let a = PacketStatsRx::default();
        let b = PacketStatsRx::default();
        assert_eq!(a, b);
        let mut c = PacketStatsRx::default();
        c.ether__pre_parse = 1;
        assert_ne!(a, c);
    }

    #[test]
    fn bundles_compose_by_field_update() {
        let stats = PacketStatsTx {
            ether__pre_assemble: 5,
            ip4__mtu_exceed__frag: 1,
            ip4__mtu_exceed__frag__send: 5,
            ..Default::default()
        };
        assert_eq!(stats.ether__pre_assemble, 5);
        assert_eq!(PacketStatsTx::default().ether__pre_assemble, 0);
    }
}
