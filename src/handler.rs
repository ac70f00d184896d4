//! The packet handler
//!
//! Owns everything the per-protocol receive and transmit functions need:
//! address assignments, the ARP and ND caches, fragment flows, the TCP
//! session table, the socket table, the TX ring, statistics, and the
//! counters and PRNG that feed packet identifiers. Per-protocol logic lives
//! in the protocol modules as plain functions taking this handler.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::addr::{Ip4Address, Ip4Host, Ip6Address, Ip6Host, MacAddress};
use crate::buffer::{PacketRx, PacketTx, Tracker, TxRing, TX_RING_CAPACITY};
use crate::config::StackConfig;
use crate::fragment::FragmentFlows;
use crate::neighbor::{ArpCache, NdCache};
use crate::rand::Rand;
use crate::socket::SocketTable;
use crate::stats::{PacketStatsRx, PacketStatsTx};
use crate::tcp::TcpSessionTable;
use crate::{arp, current_time_ms, ethernet, icmpv6};

/// Central state of the stack; shared by the receive, transmit, timer and
/// user threads through an `Arc`.
pub struct PacketHandler {
    pub config: Arc<StackConfig>,
    /// The stack's own MAC address.
    pub mac_unicast: MacAddress,
    /// Multicast MAC memberships accepted by the Ethernet filter.
    pub mac_multicast: RwLock<Vec<MacAddress>>,
    /// Claimed IPv4 assignments.
    pub ip4_host: RwLock<Vec<Ip4Host>>,
    /// IPv4 assignments still being probed.
    pub ip4_host_candidate: RwLock<Vec<Ip4Host>>,
    /// Addresses whose ARP probe detected a conflict.
    pub ip4_probe_conflict: RwLock<BTreeSet<Ip4Address>>,
    /// Claimed IPv6 assignments.
    pub ip6_host: RwLock<Vec<Ip6Host>>,
    /// IPv6 assignments still in duplicate address detection.
    pub ip6_host_candidate: RwLock<Vec<Ip6Host>>,
    /// Addresses whose DAD detected a conflict.
    pub ip6_dad_conflict: RwLock<BTreeSet<Ip6Address>>,
    /// IPv6 multicast group memberships.
    pub ip6_multicast: RwLock<Vec<Ip6Address>>,
    pub arp_cache: ArpCache,
    pub nd_cache: NdCache,
    pub ip4_frag_flows: FragmentFlows,
    pub ip6_frag_flows: FragmentFlows,
    pub sessions: TcpSessionTable,
    pub sockets: SocketTable,
    pub tx_ring: TxRing,
    pub stats_rx: RwLock<PacketStatsRx>,
    pub stats_tx: RwLock<PacketStatsTx>,
    /// Raised once by the supervisor; observed by every loop.
    pub shutdown: AtomicBool,
    pub rand: Mutex<Rand>,
    tracker_seq: AtomicU64,
    ip4_id_seq: AtomicU16,
    ip6_frag_id: Mutex<BTreeMap<Ip6Address, u32>>,
}

impl PacketHandler {
    pub fn new(config: StackConfig) -> Arc<PacketHandler> {
        let mac_unicast = config.mac_address;
        Arc::new(PacketHandler {
            config: Arc::new(config),
            mac_unicast,
            mac_multicast: RwLock::new(Vec::new()),
            ip4_host: RwLock::new(Vec::new()),
            ip4_host_candidate: RwLock::new(Vec::new()),
            ip4_probe_conflict: RwLock::new(BTreeSet::new()),
            ip6_host: RwLock::new(Vec::new()),
            ip6_host_candidate: RwLock::new(Vec::new()),
            ip6_dad_conflict: RwLock::new(BTreeSet::new()),
            ip6_multicast: RwLock::new(Vec::new()),
            arp_cache: ArpCache::new(),
            nd_cache: NdCache::new(),
            ip4_frag_flows: FragmentFlows::new(),
            ip6_frag_flows: FragmentFlows::new(),
            sessions: TcpSessionTable::new(),
            sockets: SocketTable::new(),
            tx_ring: TxRing::new(TX_RING_CAPACITY),
            stats_rx: RwLock::new(PacketStatsRx::default()),
            stats_tx: RwLock::new(PacketStatsTx::default()),
            shutdown: AtomicBool::new(false),
            rand: Mutex::new(Rand::from_clock()),
            tracker_seq: AtomicU64::new(0),
            ip4_id_seq: AtomicU16::new(0),
            ip6_frag_id: Mutex::new(BTreeMap::new()),
        })
    }

    /// Run one raw frame through the receive pipeline.
    pub fn receive_frame(&self, frame: Vec<u8>) {
        let tracker = self.next_tracker();
        let mut rx = PacketRx::new(frame, tracker);
        ethernet::phrx_ether(self, &mut rx);
    }

    pub fn next_tracker(&self) -> Tracker {
        Tracker(self.tracker_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Per-stack IPv4 identification counter.
    pub fn next_ip4_id(&self) -> u16 {
        self.ip4_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Per-destination monotonic IPv6 fragment identifier, randomly seeded.
    pub fn next_ip6_frag_id(&self, dst: Ip6Address) -> u32 {
        let mut ids = self.ip6_frag_id.lock();
        let id = ids.entry(dst).or_insert_with(|| self.rand.lock().next_u32());
        let value = *id;
        *id = id.wrapping_add(1);
        value
    }

    /// Pad to the Ethernet minimum and hand the frame to the TX ring. A
    /// saturated ring drops the frame and counts it; the receive path is
    /// never blocked here.
    pub fn enqueue_frame(&self, mut tx: PacketTx) {
        tx.pad_to(ethernet::ETHER_MIN_FRAME);
        if self.tx_ring.enqueue(tx).is_err() {
            self.stats_tx.write().ether__queue_full_drop += 1;
            log::warn!(target: "tx-ring", "ring saturated, dropping frame");
        }
    }

    // IPv4 address bookkeeping

    pub fn assign_ip4_host(&self, host: Ip4Host) {
        log::info!(target: "stack", "claimed IPv4 address {}", host);
        self.ip4_host.write().push(host);
    }

    pub fn add_ip4_candidate(&self, host: Ip4Host) {
        self.ip4_host_candidate.write().push(host);
    }

    /// Move probe survivors into the claimed set; returns them so the
    /// caller can announce, and the conflicted losers for logging.
    pub fn promote_ip4_candidates(&self) -> (Vec<Ip4Host>, Vec<Ip4Host>) {
        let candidates: Vec<Ip4Host> = self.ip4_host_candidate.write().drain(..).collect();
        let conflicts = self.ip4_probe_conflict.read();
        let (clean, conflicted): (Vec<Ip4Host>, Vec<Ip4Host>) = candidates
            .into_iter()
            .partition(|host| !conflicts.contains(&host.address));
        drop(conflicts);
        for host in &clean {
            self.assign_ip4_host(*host);
        }
        (clean, conflicted)
    }

    pub fn record_ip4_conflict(&self, address: Ip4Address) {
        self.ip4_probe_conflict.write().insert(address);
    }

    pub fn ip4_unicast_owned(&self, address: Ip4Address) -> bool {
        self.ip4_host.read().iter().any(|h| h.address == address)
    }

    pub fn ip4_candidate_owned(&self, address: Ip4Address) -> bool {
        self.ip4_host_candidate
            .read()
            .iter()
            .any(|h| h.address == address)
    }

    /// Directed broadcast of any attached subnet.
    pub fn ip4_broadcast_match(&self, address: Ip4Address) -> bool {
        self.ip4_host
            .read()
            .iter()
            .any(|h| h.broadcast() == address)
    }

    pub fn ip4_multicast_owned(&self, address: Ip4Address) -> bool {
        // No IPv4 multicast group management; all-systems only.
        address == Ip4Address::new([224, 0, 0, 1])
    }

    /// Whether `address` is on an attached subnet.
    pub fn ip4_locnet(&self, address: Ip4Address) -> bool {
        self.ip4_host.read().iter().any(|h| h.contains(address))
    }

    pub fn ip4_gateway(&self) -> Option<Ip4Address> {
        self.ip4_host.read().iter().find_map(|h| h.gateway)
    }

    /// Source address to use when talking to `dst`.
    pub fn ip4_src_for(&self, dst: Ip4Address) -> Option<Ip4Address> {
        let hosts = self.ip4_host.read();
        hosts
            .iter()
            .find(|h| h.contains(dst))
            .or_else(|| hosts.first())
            .map(|h| h.address)
    }

    /// Learn an ARP mapping and release any frames parked on it.
    pub fn arp_cache_learn(&self, address: Ip4Address, mac: MacAddress) {
        let pending = self.arp_cache.add_entry(address, mac);
        for mut frame in pending {
            log::debug!(
                target: "arp",
                "sending frame parked for {} ({})",
                address, mac
            );
            frame.patch(0, &mac.octets());
            self.enqueue_frame(frame);
        }
    }

    // IPv6 address bookkeeping

    /// Claim an IPv6 assignment and join its solicited-node group.
    pub fn assign_ip6_host(&self, host: Ip6Host) {
        log::info!(target: "stack", "claimed IPv6 address {}", host);
        self.join_ip6_multicast(host.address.solicited_node_multicast());
        self.ip6_host.write().push(host);
    }

    pub fn add_ip6_candidate(&self, host: Ip6Host) {
        // DAD listens on the solicited-node group of the tentative address.
        self.join_ip6_multicast(host.address.solicited_node_multicast());
        self.ip6_host_candidate.write().push(host);
    }

    /// Move DAD survivors into the claimed set.
    pub fn promote_ip6_candidates(&self) -> (Vec<Ip6Host>, Vec<Ip6Host>) {
        let candidates: Vec<Ip6Host> = self.ip6_host_candidate.write().drain(..).collect();
        let conflicts = self.ip6_dad_conflict.read();
        let (clean, conflicted): (Vec<Ip6Host>, Vec<Ip6Host>) = candidates
            .into_iter()
            .partition(|host| !conflicts.contains(&host.address));
        drop(conflicts);
        for host in &clean {
            self.assign_ip6_host(*host);
        }
        (clean, conflicted)
    }

    pub fn record_ip6_conflict(&self, address: Ip6Address) {
        self.ip6_dad_conflict.write().insert(address);
    }

    pub fn join_ip6_multicast(&self, group: Ip6Address) {
        let mut groups = self.ip6_multicast.write();
        if !groups.contains(&group) {
            log::debug!(target: "stack", "joined IPv6 multicast group {}", group);
            groups.push(group);
            let mac = MacAddress::from_ip6_multicast(group);
            let mut macs = self.mac_multicast.write();
            if !macs.contains(&mac) {
                macs.push(mac);
            }
        }
    }

    pub fn ip6_unicast_owned(&self, address: Ip6Address) -> bool {
        self.ip6_host.read().iter().any(|h| h.address == address)
    }

    pub fn ip6_candidate_owned(&self, address: Ip6Address) -> bool {
        self.ip6_host_candidate
            .read()
            .iter()
            .any(|h| h.address == address)
    }

    pub fn ip6_multicast_owned(&self, address: Ip6Address) -> bool {
        self.ip6_multicast.read().contains(&address)
    }

    /// Whether `address` is on an attached prefix.
    pub fn ip6_locnet(&self, address: Ip6Address) -> bool {
        address.is_link_local() || self.ip6_host.read().iter().any(|h| h.contains(address))
    }

    pub fn ip6_gateway(&self) -> Option<Ip6Address> {
        self.ip6_host.read().iter().find_map(|h| h.gateway)
    }

    /// Source address to use when talking to `dst`: same prefix first,
    /// link-local for link-local peers, then any claimed address.
    pub fn ip6_src_for(&self, dst: Ip6Address) -> Option<Ip6Address> {
        let hosts = self.ip6_host.read();
        if let Some(host) = hosts.iter().find(|h| h.contains(dst)) {
            return Some(host.address);
        }
        if dst.is_link_local() || dst.is_multicast() {
            if let Some(host) = hosts.iter().find(|h| h.address.is_link_local()) {
                return Some(host.address);
            }
        }
        hosts.first().map(|h| h.address)
    }

    /// Learn an ND mapping and release any frames parked on it.
    pub fn nd_cache_learn(&self, address: Ip6Address, mac: MacAddress) {
        let pending = self.nd_cache.add_entry(address, mac);
        for mut frame in pending {
            log::debug!(
                target: "icmp6",
                "sending frame parked for {} ({})",
                address, mac
            );
            frame.patch(0, &mac.octets());
            self.enqueue_frame(frame);
        }
    }

    /// Periodic maintenance: cache aging with probe retransmission,
    /// fragment-flow expiry, and TCP timers.
    pub fn on_timer_tick(&self) {
        let now = current_time_ms();

        let arp_actions = self.arp_cache.maintain(now);
        for address in arp_actions.reprobe {
            arp::phtx_arp_request(self, address);
        }
        for address in arp_actions.abandoned {
            log::debug!(target: "arp", "resolution of {} abandoned", address);
        }

        let nd_actions = self.nd_cache.maintain(now);
        for address in nd_actions.reprobe {
            icmpv6::phtx_nd_neighbor_solicitation(self, address);
        }
        for address in nd_actions.abandoned {
            log::debug!(target: "icmp6", "resolution of {} abandoned", address);
        }

        self.ip4_frag_flows.maintain(now);
        self.ip6_frag_flows.maintain(now);
        self.sessions.maintain(self, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> Arc<PacketHandler> {
        let config = StackConfig::default();
        let ph = PacketHandler::new(config);
        ph.assign_ip4_host("192.168.9.7/24".parse().unwrap());
        ph
    }

    #[test]
    fn address_ownership_checks() {
        let ph = handler();
        assert!(ph.ip4_unicast_owned("192.168.9.7".parse().unwrap()));
        assert!(!ph.ip4_unicast_owned("192.168.9.8".parse().unwrap()));
        assert!(ph.ip4_broadcast_match("192.168.9.255".parse().unwrap()));
        assert!(ph.ip4_locnet("192.168.9.102".parse().unwrap()));
        assert!(!ph.ip4_locnet("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn candidate_promotion_skips_conflicted() {
        let ph = handler();
        ph.add_ip4_candidate("10.0.0.1/24".parse().unwrap());
        ph.add_ip4_candidate("10.0.0.2/24".parse().unwrap());
        ph.record_ip4_conflict("10.0.0.2".parse().unwrap());
        let (clean, conflicted) = ph.promote_ip4_candidates();
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].address, "10.0.0.1".parse().unwrap());
        assert_eq!(conflicted.len(), 1);
        assert!(ph.ip4_unicast_owned("10.0.0.1".parse().unwrap()));
        assert!(!ph.ip4_unicast_owned("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn ip6_assignment_joins_solicited_node_group() {
        let ph = handler();
        let host: Ip6Host = "2603:9000:e307:9f09:0:ff:fe77:7777/64".parse().unwrap();
        ph.assign_ip6_host(host);
        let group: Ip6Address = "ff02::1:ff77:7777".parse().unwrap();
        assert!(ph.ip6_multicast_owned(group));
        assert!(ph
            .mac_multicast
            .read()
            .contains(&MacAddress::from_ip6_multicast(group)));
    }

    #[test]
    fn ip6_frag_ids_are_monotonic_per_destination() {
        let ph = handler();
        let dst: Ip6Address = "2603:9000:e307:9f09::1fa1".parse().unwrap();
        let other: Ip6Address = "2603:9000:e307:9f09::2".parse().unwrap();
        let a = ph.next_ip6_frag_id(dst);
        let b = ph.next_ip6_frag_id(dst);
        assert_eq!(b, a.wrapping_add(1));
        // Independent counter per destination.
        let c = ph.next_ip6_frag_id(other);
        let d = ph.next_ip6_frag_id(other);
        assert_eq!(d, c.wrapping_add(1));
    }

    #[test]
    fn trackers_increase_monotonically() {
        let ph = handler();
        let a = ph.next_tracker();
        let b = ph.next_tracker();
        assert!(b.0 > a.0);
    }
}
