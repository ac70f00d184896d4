//! L3-to-L2 neighbor caches
//!
//! One cache instance per family: `ArpCache` maps IPv4 addresses, `NdCache`
//! maps IPv6 addresses. Entries move Incomplete → Reachable → Stale and are
//! eventually expired; an Incomplete entry holds the frames waiting on the
//! resolution (bounded, oldest dropped) and is retried a fixed number of
//! times before being abandoned.

use std::collections::{BTreeMap, VecDeque};

use spin::Mutex;

use crate::addr::{Ip4Address, Ip6Address, MacAddress};
use crate::buffer::PacketTx;
use crate::current_time_ms;

/// Reachable entries turn Stale after this long without a refresh.
pub const REACHABLE_MS: u64 = 30_000;
/// Stale entries are deleted after this long without a refresh.
pub const EXPIRE_MS: u64 = 90_000;
/// Incomplete entries retry resolution at this interval.
pub const RETRY_MS: u64 = 1_000;
/// Resolution attempts before an Incomplete entry is abandoned.
pub const MAX_PROBES: u32 = 3;
/// Frames parked on one Incomplete entry; oldest dropped beyond this.
pub const PENDING_LIMIT: usize = 5;

/// Entry resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Resolution in flight; no link-layer address yet.
    Incomplete,
    /// Recently confirmed mapping.
    Reachable,
    /// Aged mapping, still usable until expiry.
    Stale,
}

/// One neighbor entry.
#[derive(Debug)]
pub struct NeighborEntry {
    pub mac_address: Option<MacAddress>,
    pub state: EntryState,
    pub created: u64,
    pub updated: u64,
    probes: u32,
    pending: VecDeque<PacketTx>,
}

impl NeighborEntry {
    fn incomplete(now: u64) -> Self {
        NeighborEntry {
            mac_address: None,
            state: EntryState::Incomplete,
            created: now,
            updated: now,
            probes: 1,
            pending: VecDeque::new(),
        }
    }
}

/// Outcome of a transmit-path resolution attempt.
pub enum TxResolution {
    /// Mapping known; the frame is handed back for sending.
    Resolved(MacAddress, PacketTx),
    /// Frame parked on an in-flight resolution. `probe` is true when this
    /// call created the entry and the caller should emit the first probe.
    Queued { probe: bool },
}

/// Maintenance actions the timer thread must perform outside the cache lock.
#[derive(Debug, Default)]
pub struct Maintenance<A> {
    /// Addresses whose resolution probe should be retransmitted.
    pub reprobe: Vec<A>,
    /// Addresses abandoned (pending frames were dropped).
    pub abandoned: Vec<A>,
}

/// Generic neighbor cache keyed by an L3 address type.
pub struct NeighborCache<A: Ord + Copy> {
    entries: Mutex<BTreeMap<A, NeighborEntry>>,
}

/// IPv4 neighbor cache fed by ARP.
pub type ArpCache = NeighborCache<Ip4Address>;
/// IPv6 neighbor cache fed by Neighbor Discovery.
pub type NdCache = NeighborCache<Ip6Address>;

impl<A: Ord + Copy> NeighborCache<A> {
    pub fn new() -> Self {
        NeighborCache {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Plain lookup; `None` covers both Miss and Pending.
    pub fn find_entry(&self, address: A) -> Option<MacAddress> {
        self.entries.lock().get(&address).and_then(|e| e.mac_address)
    }

    /// Transmit-path lookup. On a usable entry the frame is released to the
    /// caller for sending; otherwise it is parked on the (possibly new)
    /// Incomplete entry.
    pub fn resolve_or_park(&self, address: A, frame: PacketTx) -> TxResolution {
        let now = current_time_ms();
        let mut entries = self.entries.lock();
        match entries.get_mut(&address) {
            Some(entry) => match entry.mac_address {
                Some(mac) => TxResolution::Resolved(mac, frame),
                None => {
                    if entry.pending.len() >= PENDING_LIMIT {
                        entry.pending.pop_front();
                    }
                    entry.pending.push_back(frame);
                    TxResolution::Queued { probe: false }
                }
            },
            None => {
                let mut entry = NeighborEntry::incomplete(now);
                entry.pending.push_back(frame);
                entries.insert(address, entry);
                TxResolution::Queued { probe: true }
            }
        }
    }

    /// Insert or refresh a mapping. Returns the frames that were waiting on
    /// this resolution, in arrival order; the caller completes and sends
    /// them outside the lock.
    pub fn add_entry(&self, address: A, mac: MacAddress) -> Vec<PacketTx> {
        let now = current_time_ms();
        let mut entries = self.entries.lock();
        let entry = entries.entry(address).or_insert_with(|| NeighborEntry {
            mac_address: None,
            state: EntryState::Incomplete,
            created: now,
            updated: now,
            probes: 0,
            pending: VecDeque::new(),
        });
        entry.mac_address = Some(mac);
        entry.state = EntryState::Reachable;
        entry.updated = now;
        entry.pending.drain(..).collect()
    }

    pub fn remove_entry(&self, address: A) {
        self.entries.lock().remove(&address);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, address: A) -> Option<EntryState> {
        self.entries.lock().get(&address).map(|e| e.state)
    }

    /// Age entries. Probe retransmission and abandonment are reported back
    /// so the timer thread can act without the cache lock held.
    pub fn maintain(&self, now: u64) -> Maintenance<A> {
        let mut actions = Maintenance {
            reprobe: Vec::new(),
            abandoned: Vec::new(),
        };
        let mut entries = self.entries.lock();
        entries.retain(|address, entry| match entry.state {
            EntryState::Incomplete => {
                if now.saturating_sub(entry.updated) < RETRY_MS {
                    true
                } else if entry.probes < MAX_PROBES {
                    entry.probes += 1;
                    entry.updated = now;
                    actions.reprobe.push(*address);
                    true
                } else {
                    actions.abandoned.push(*address);
                    false
                }
            }
            EntryState::Reachable => {
                if now.saturating_sub(entry.updated) >= REACHABLE_MS {
                    entry.state = EntryState::Stale;
                }
                true
            }
            EntryState::Stale => now.saturating_sub(entry.updated) < EXPIRE_MS,
        });
        actions
    }
}

impl<A: Ord + Copy> Default for NeighborCache<A> {
    fn default() -> Self {
        Self::new()
    }
}
