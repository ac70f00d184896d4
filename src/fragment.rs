//! IP fragment reassembly
//!
//! One engine per IP family. Flows are keyed by (source, destination,
//! protocol, identifier); fragments may arrive in any order and may repeat.
//! Overlapping bytes are overwritten in arrival order (last writer wins).
//! A flow completes when the last-fragment marker has been seen and the
//! byte range [0, total) is contiguously covered; stale flows are discarded
//! silently after a timeout.

use std::collections::BTreeMap;

use spin::Mutex;

use crate::addr::IpAddress;
use crate::current_time_ms;

/// Flows older than this are dropped by the timer thread.
pub const FLOW_TIMEOUT_MS: u64 = 10_000;

/// Hard cap on a reassembled datagram.
const MAX_DATAGRAM: usize = 65_535;

/// Reassembly flow identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowKey {
    pub src: IpAddress,
    pub dst: IpAddress,
    pub proto: u8,
    pub id: u32,
}

#[derive(Debug)]
struct FragmentFlow {
    /// Fragments in arrival order; later arrivals overwrite earlier bytes.
    arrivals: Vec<(usize, Vec<u8>)>,
    /// Fixed once the last fragment (no more-fragments flag) is seen.
    total_len: Option<usize>,
    created: u64,
}

impl FragmentFlow {
    fn is_complete(&self) -> Option<usize> {
        let total = self.total_len?;
        // Merge coverage intervals and check [0, total) is contiguous.
        let mut intervals: Vec<(usize, usize)> = self
            .arrivals
            .iter()
            .map(|(offset, data)| (*offset, offset + data.len()))
            .collect();
        intervals.sort_unstable();
        let mut covered = 0;
        for (start, end) in intervals {
            if start > covered {
                return None;
            }
            covered = covered.max(end);
        }
        (covered >= total).then_some(total)
    }

    fn reassemble(&self, total: usize) -> Vec<u8> {
        let mut datagram = vec![0u8; total];
        for (offset, data) in &self.arrivals {
            let end = (offset + data.len()).min(total);
            datagram[*offset..end].copy_from_slice(&data[..end - offset]);
        }
        datagram
    }
}

/// Fragment flows of one IP family.
pub struct FragmentFlows {
    flows: Mutex<BTreeMap<FlowKey, FragmentFlow>>,
}

impl FragmentFlows {
    pub fn new() -> Self {
        FragmentFlows {
            flows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record one fragment. Returns the reassembled datagram payload when
    /// this fragment completes the flow; the flow is then dropped, so a
    /// datagram is delivered exactly once.
    pub fn add_fragment(
        &self,
        key: FlowKey,
        offset: usize,
        data: &[u8],
        last: bool,
    ) -> Option<Vec<u8>> {
        if offset + data.len() > MAX_DATAGRAM {
            return None;
        }
        let mut flows = self.flows.lock();
        let flow = flows.entry(key).or_insert_with(|| FragmentFlow {
            arrivals: Vec::new(),
            total_len: None,
            created: current_time_ms(),
        });
        flow.arrivals.push((offset, data.to_vec()));
        if last {
            flow.total_len = Some(offset + data.len());
        }
        if let Some(total) = flow.is_complete() {
            let datagram = flow.reassemble(total);
            flows.remove(&key);
            Some(datagram)
        } else {
            None
        }
    }

    /// Discard flows older than the timeout.
    pub fn maintain(&self, now: u64) {
        self.flows
            .lock()
            .retain(|_, flow| now.saturating_sub(flow.created) < FLOW_TIMEOUT_MS);
    }

    pub fn len(&self) -> usize {
        self.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FragmentFlows {
    fn default() -> Self {
        Self::new()
    }
}
