//! TCP protocol processing (RFC 9293)
//!
//! Segment parsing and assembly with option support (MSS, window scale,
//! SACK, timestamps), the full 11-state connection machine, retransmission
//! with RTO estimation and fast retransmit, out-of-order reassembly, and
//! receive-window management with silly-window avoidance.
//!
//! Session processing is serialized by a per-session lock; segment handlers
//! return the segments to emit and the caller transmits them after the lock
//! is released, so the transmit path never runs inside a session critical
//! section.

use core::ops::Range;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::addr::IpAddress;
use crate::buffer::{PacketRx, PacketTx, Tracker};
use crate::checksum;
use crate::config::StackConfig;
use crate::handler::PacketHandler;
use crate::ip_proto;
use crate::{ipv4, ipv6, NetworkError};

/// Header size without options.
pub const TCP_HEADER_LEN: usize = 20;

/// Initial retransmission timeout.
pub const RTO_INITIAL_MS: u64 = 1_000;
/// Retransmission timeout cap.
pub const RTO_MAX_MS: u64 = 60_000;
/// Retransmissions of one segment before the session gives up.
pub const MAX_RETRANSMITS: u32 = 8;
/// 2MSL linger in TimeWait.
pub const TIME_WAIT_MS: u64 = 30_000;
/// Idle time before a keepalive probe on an established session.
pub const KEEPALIVE_IDLE_MS: u64 = 7_200_000;
/// Unanswered keepalive probes before the session times out.
pub const KEEPALIVE_MAX_PROBES: u32 = 5;
/// Duplicate ACKs that trigger fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;
/// Out-of-order segments buffered per session.
const OOO_LIMIT: usize = 64;
/// MSS assumed for a peer that does not advertise one.
const DEFAULT_PEER_MSS: u16 = 536;

// a < b and a <= b in sequence space
fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

fn seq_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// lo <= x < lo + len in sequence space
fn seq_between(x: u32, lo: u32, len: u32) -> bool {
    x.wrapping_sub(lo) < len
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags {
        syn: true,
        ..Self::NONE
    };
    pub const ACK: TcpFlags = TcpFlags {
        ack: true,
        ..Self::NONE
    };
    pub const NONE: TcpFlags = TcpFlags {
        fin: false,
        syn: false,
        rst: false,
        psh: false,
        ack: false,
        urg: false,
    };

    pub fn from_byte(byte: u8) -> Self {
        TcpFlags {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.fin {
            byte |= 0x01;
        }
        if self.syn {
            byte |= 0x02;
        }
        if self.rst {
            byte |= 0x04;
        }
        if self.psh {
            byte |= 0x08;
        }
        if self.ack {
            byte |= 0x10;
        }
        if self.urg {
            byte |= 0x20;
        }
        byte
    }

    fn syn_ack() -> Self {
        TcpFlags {
            syn: true,
            ack: true,
            ..Self::NONE
        }
    }

    fn rst_ack() -> Self {
        TcpFlags {
            rst: true,
            ack: true,
            ..Self::NONE
        }
    }

    fn fin_ack() -> Self {
        TcpFlags {
            fin: true,
            ack: true,
            ..Self::NONE
        }
    }

    fn psh_ack() -> Self {
        TcpFlags {
            psh: true,
            ack: true,
            ..Self::NONE
        }
    }
}

/// Option kinds.
pub mod tcp_option {
    pub const EOL: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WSCALE: u8 = 3;
    pub const SACK_PERMITTED: u8 = 4;
    pub const SACK: u8 = 5;
    pub const TIMESTAMP: u8 = 8;
}

/// Parsed header options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub wscale: Option<u8>,
    pub sack_permitted: bool,
    pub sack: Vec<(u32, u32)>,
    pub timestamp: Option<(u32, u32)>,
}

impl TcpOptions {
    fn parse(data: &[u8]) -> Result<TcpOptions, &'static str> {
        let mut options = TcpOptions::default();
        let mut cursor = 0;
        while cursor < data.len() {
            match data[cursor] {
                tcp_option::EOL => break,
                tcp_option::NOP => {
                    cursor += 1;
                }
                kind => {
                    if cursor + 2 > data.len() {
                        return Err("tcp: option header truncated");
                    }
                    let len = data[cursor + 1] as usize;
                    if len < 2 || cursor + len > data.len() {
                        return Err("tcp: bad option length");
                    }
                    let value = &data[cursor + 2..cursor + len];
                    match kind {
                        tcp_option::MSS if value.len() == 2 => {
                            options.mss = Some(u16::from_be_bytes([value[0], value[1]]));
                        }
                        tcp_option::WSCALE if value.len() == 1 => {
                            options.wscale = Some(value[0]);
                        }
                        tcp_option::SACK_PERMITTED if value.is_empty() => {
                            options.sack_permitted = true;
                        }
                        tcp_option::SACK if value.len() % 8 == 0 => {
                            for block in value.chunks_exact(8) {
                                options.sack.push((
                                    u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
                                    u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
                                ));
                            }
                        }
                        tcp_option::TIMESTAMP if value.len() == 8 => {
                            options.timestamp = Some((
                                u32::from_be_bytes([value[0], value[1], value[2], value[3]]),
                                u32::from_be_bytes([value[4], value[5], value[6], value[7]]),
                            ));
                        }
                        _ => {} // unknown options are skipped by length
                    }
                    cursor += len;
                }
            }
        }
        Ok(options)
    }
}

/// Parsed TCP header view.
#[derive(Debug, Clone)]
pub struct TcpHdr {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub hlen: usize,
    pub flags: TcpFlags,
    pub win: u16,
    pub cksum: u16,
    pub urg: u16,
    pub options: TcpOptions,
    pub payload: Range<usize>,
}

impl TcpHdr {
    /// Parse the header spanning `at` in `frame`.
    pub fn parse(frame: &[u8], at: Range<usize>) -> Result<TcpHdr, &'static str> {
        let data = &frame[at.clone()];
        if data.len() < TCP_HEADER_LEN {
            return Err("tcp: segment shorter than header");
        }
        let hlen = ((data[12] >> 4) as usize) * 4;
        if hlen < TCP_HEADER_LEN || hlen > data.len() {
            return Err("tcp: bad data offset");
        }
        Ok(TcpHdr {
            sport: u16::from_be_bytes([data[0], data[1]]),
            dport: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            hlen,
            flags: TcpFlags::from_byte(data[13]),
            win: u16::from_be_bytes([data[14], data[15]]),
            cksum: u16::from_be_bytes([data[16], data[17]]),
            urg: u16::from_be_bytes([data[18], data[19]]),
            options: TcpOptions::parse(&data[TCP_HEADER_LEN..hlen])?,
            payload: at.start + hlen..at.end,
        })
    }

    /// Verify the pseudo-header checksum over the whole segment.
    pub fn verify_checksum(&self, frame: &[u8], src: &IpAddress, dst: &IpAddress) -> bool {
        let start = self.payload.start - self.hlen;
        let segment = &frame[start..self.payload.end];
        let pseudo = checksum::pseudo_sum(src, dst, ip_proto::TCP, segment.len());
        checksum::checksum(segment, pseudo) == 0
    }
}

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Whether user data may still be queued for transmission.
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Whether inbound payload is still accepted.
    pub fn can_recv(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }
}

/// Session identity: (local ip, local port, remote ip, remote port).
pub type SessionKey = (IpAddress, u16, IpAddress, u16);

/// A segment to transmit, produced under the session lock and sent after
/// it is released.
#[derive(Debug, Clone)]
pub struct TcpOut {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub win: u16,
    pub mss_opt: Option<u16>,
    pub payload: Vec<u8>,
}

/// A sent, not yet acknowledged segment.
#[derive(Debug)]
struct RtxSegment {
    seq: u32,
    syn: bool,
    fin: bool,
    data: Vec<u8>,
    first_sent: u64,
    sent_at: u64,
    retries: u32,
}

impl RtxSegment {
    fn seq_len(&self) -> u32 {
        self.data.len() as u32 + self.syn as u32 + self.fin as u32
    }

    fn flags(&self) -> TcpFlags {
        if self.syn && self.seq_len() == 1 {
            // SYN from a child session carries the ACK of the peer's SYN.
            TcpFlags::syn_ack()
        } else if self.fin {
            TcpFlags::fin_ack()
        } else {
            TcpFlags::psh_ack()
        }
    }
}

/// Connection control block; all fields live under the session lock.
#[derive(Debug)]
pub struct TcpCb {
    pub state: TcpState,
    iss: u32,
    irs: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    snd_wl1: u32,
    snd_wl2: u32,
    rcv_nxt: u32,
    mss: u16,
    rx_buf: VecDeque<u8>,
    rx_buf_cap: usize,
    tx_buf: VecDeque<u8>,
    tx_buf_cap: usize,
    rtx: VecDeque<RtxSegment>,
    ooo: BTreeMap<u32, Vec<u8>>,
    srtt_ms: Option<u64>,
    rttvar_ms: u64,
    rto_ms: u64,
    rto_deadline: Option<u64>,
    dup_acks: u32,
    time_wait_deadline: Option<u64>,
    last_activity: u64,
    keepalive_probes: u32,
    last_adv_wnd: u32,
    fin_rcvd: bool,
    fin_queued: bool,
    fin_sent: bool,
    /// Listen sessions: established children awaiting accept().
    accept_queue: VecDeque<SessionKey>,
    backlog: usize,
    /// Child sessions: the listening endpoint that spawned them.
    parent: Option<(IpAddress, u16)>,
    /// Listen sessions bound to the unspecified address of one family that
    /// also accept the other.
    pub dual: bool,
    pub error: Option<NetworkError>,
    /// Terminal; the timer thread removes the session.
    pub defunct: bool,
}

/// Result of processing one inbound segment.
#[derive(Debug, Default)]
pub struct SegmentOutcome {
    /// The session just reached Established; a child reports to its
    /// listener's accept queue.
    pub newly_established: bool,
}

impl TcpCb {
    fn new(config: &StackConfig, now: u64) -> TcpCb {
        TcpCb {
            state: TcpState::Closed,
            iss: 0,
            irs: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_nxt: 0,
            mss: DEFAULT_PEER_MSS,
            rx_buf: VecDeque::new(),
            rx_buf_cap: config.tcp_rx_buf,
            tx_buf: VecDeque::new(),
            tx_buf_cap: config.tcp_tx_buf,
            rtx: VecDeque::new(),
            ooo: BTreeMap::new(),
            srtt_ms: None,
            rttvar_ms: 0,
            rto_ms: RTO_INITIAL_MS,
            rto_deadline: None,
            dup_acks: 0,
            time_wait_deadline: None,
            last_activity: now,
            keepalive_probes: 0,
            last_adv_wnd: 0,
            fin_rcvd: false,
            fin_queued: false,
            fin_sent: false,
            accept_queue: VecDeque::new(),
            backlog: 0,
            parent: None,
            dual: false,
            error: None,
            defunct: false,
        }
    }

    fn rcv_space(&self) -> u32 {
        (self.rx_buf_cap - self.rx_buf.len()).min(65_535) as u32
    }

    /// Receiver-side silly-window avoidance: a small window is advertised
    /// as zero until it reopens by at least an MSS or half the buffer.
    fn advertised_wnd(&mut self) -> u16 {
        let space = self.rcv_space();
        let threshold = (self.mss as u32).min(self.rx_buf_cap as u32 / 2);
        let wnd = if space < threshold { 0 } else { space };
        self.last_adv_wnd = wnd;
        wnd as u16
    }

    fn make_ack(&mut self) -> TcpOut {
        TcpOut {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::ACK,
            win: self.advertised_wnd(),
            mss_opt: None,
            payload: Vec::new(),
        }
    }

    fn segment_acceptable(&self, seq: u32, seg_len: u32) -> bool {
        let wnd = self.rcv_space();
        match (seg_len, wnd) {
            (0, 0) => seq == self.rcv_nxt,
            (0, _) => seq_between(seq, self.rcv_nxt, wnd),
            (_, 0) => false,
            (_, _) => {
                seq_between(seq, self.rcv_nxt, wnd)
                    || seq_between(seq.wrapping_add(seg_len - 1), self.rcv_nxt, wnd)
            }
        }
    }

    fn rtt_update(&mut self, sample_ms: u64) {
        // RFC 6298 smoothed estimator, alpha 1/8, beta 1/4.
        match self.srtt_ms {
            None => {
                self.srtt_ms = Some(sample_ms);
                self.rttvar_ms = sample_ms / 2;
            }
            Some(srtt) => {
                let delta = srtt.abs_diff(sample_ms);
                self.rttvar_ms = (3 * self.rttvar_ms + delta) / 4;
                self.srtt_ms = Some((7 * srtt + sample_ms) / 8);
            }
        }
        let srtt = self.srtt_ms.unwrap_or(RTO_INITIAL_MS);
        self.rto_ms = (srtt + (4 * self.rttvar_ms).max(10)).clamp(RTO_INITIAL_MS, RTO_MAX_MS);
    }

    fn arm_rto(&mut self, now: u64) {
        if self.rto_deadline.is_none() && !self.rtx.is_empty() {
            self.rto_deadline = Some(now + self.rto_ms);
        }
    }

    /// Queue user data; returns the number of bytes accepted.
    fn enqueue_data(&mut self, data: &[u8]) -> usize {
        let space = self.tx_buf_cap - self.tx_buf.len();
        let n = data.len().min(space);
        self.tx_buf.extend(&data[..n]);
        n
    }

    /// Emit as much queued data as the send window and MSS allow, then a
    /// queued FIN once the buffer drains.
    fn output(&mut self, now: u64, outs: &mut Vec<TcpOut>) {
        if !matches!(
            self.state,
            TcpState::Established
                | TcpState::CloseWait
                | TcpState::FinWait1
                | TcpState::Closing
                | TcpState::LastAck
        ) {
            return;
        }
        while !self.tx_buf.is_empty() {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            if inflight >= self.snd_wnd {
                break;
            }
            let can = (self.snd_wnd - inflight).min(self.mss as u32) as usize;
            if can == 0 {
                break;
            }
            let n = can.min(self.tx_buf.len());
            let data: Vec<u8> = self.tx_buf.drain(..n).collect();
            outs.push(TcpOut {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: TcpFlags::psh_ack(),
                win: self.advertised_wnd(),
                mss_opt: None,
                payload: data.clone(),
            });
            self.rtx.push_back(RtxSegment {
                seq: self.snd_nxt,
                syn: false,
                fin: false,
                data,
                first_sent: now,
                sent_at: now,
                retries: 0,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
            self.arm_rto(now);
        }

        if self.fin_queued && !self.fin_sent && self.tx_buf.is_empty() && self.state.can_send() {
            outs.push(TcpOut {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: TcpFlags::fin_ack(),
                win: self.advertised_wnd(),
                mss_opt: None,
                payload: Vec::new(),
            });
            self.rtx.push_back(RtxSegment {
                seq: self.snd_nxt,
                syn: false,
                fin: true,
                data: Vec::new(),
                first_sent: now,
                sent_at: now,
                retries: 0,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.arm_rto(now);
            self.state = match self.state {
                TcpState::CloseWait => TcpState::LastAck,
                _ => TcpState::FinWait1,
            };
        }
    }

    /// User close: send a FIN after queued data, or tear straight down from
    /// pre-synchronized states.
    fn close(&mut self, now: u64, outs: &mut Vec<TcpOut>) {
        match self.state {
            TcpState::Listen | TcpState::SynSent | TcpState::Closed => {
                self.state = TcpState::Closed;
                self.defunct = true;
            }
            TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait => {
                self.fin_queued = true;
                self.output(now, outs);
            }
            _ => {} // close is already in progress
        }
    }

    fn process_ack(&mut self, hdr: &TcpHdr, payload_len: usize, now: u64, outs: &mut Vec<TcpOut>) {
        let ack = hdr.ack;
        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            self.snd_una = ack;
            self.dup_acks = 0;
            loop {
                let (seg_end, retries, first_sent) = match self.rtx.front() {
                    Some(front) => (
                        front.seq.wrapping_add(front.seq_len()),
                        front.retries,
                        front.first_sent,
                    ),
                    None => break,
                };
                if !seq_le(seg_end, ack) {
                    break;
                }
                if retries == 0 {
                    self.rtt_update(now.saturating_sub(first_sent));
                }
                self.rtx.pop_front();
            }
            // Re-arm from the oldest outstanding segment, or disarm.
            self.rto_deadline = if self.rtx.is_empty() {
                None
            } else {
                Some(now + self.rto_ms)
            };

            match self.state {
                TcpState::FinWait1 if self.fin_sent && self.snd_una == self.snd_nxt => {
                    self.state = TcpState::FinWait2;
                }
                TcpState::Closing if self.fin_sent && self.snd_una == self.snd_nxt => {
                    self.state = TcpState::TimeWait;
                    self.time_wait_deadline = Some(now + TIME_WAIT_MS);
                }
                TcpState::LastAck if self.fin_sent && self.snd_una == self.snd_nxt => {
                    self.state = TcpState::Closed;
                    self.defunct = true;
                }
                _ => {}
            }
        } else if ack == self.snd_una && !self.rtx.is_empty() {
            if payload_len == 0 && hdr.win as u32 == self.snd_wnd {
                self.dup_acks += 1;
                if self.dup_acks == DUP_ACK_THRESHOLD {
                    if let Some(front) = self.rtx.front_mut() {
                        front.sent_at = now;
                        front.retries += 1;
                        outs.push(TcpOut {
                            seq: front.seq,
                            ack: self.rcv_nxt,
                            flags: front.flags(),
                            win: 0, // patched below
                            mss_opt: None,
                            payload: front.data.clone(),
                        });
                        let win = self.advertised_wnd();
                        if let Some(last) = outs.last_mut() {
                            last.win = win;
                        }
                    }
                }
            }
        } else if seq_lt(self.snd_nxt, ack) {
            // ACK of data never sent.
            outs.push(self.make_ack());
        }

        // Window update per the wl1/wl2 rules.
        if seq_lt(self.snd_wl1, hdr.seq)
            || (self.snd_wl1 == hdr.seq && seq_le(self.snd_wl2, ack))
        {
            self.snd_wnd = hdr.win as u32;
            self.snd_wl1 = hdr.seq;
            self.snd_wl2 = ack;
        }
    }

    fn accept_payload(&mut self, data: &[u8]) -> usize {
        let space = self.rx_buf_cap - self.rx_buf.len();
        let n = data.len().min(space);
        self.rx_buf.extend(&data[..n]);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
        n
    }

    fn process_payload(&mut self, seq: u32, payload: &[u8], outs: &mut Vec<TcpOut>) {
        if payload.is_empty() || !self.state.can_recv() {
            return;
        }
        if seq == self.rcv_nxt {
            let taken = self.accept_payload(payload);
            if taken == payload.len() {
                // Pull any out-of-order segments that are now contiguous.
                loop {
                    let seg_seq = match self.ooo.keys().next().copied() {
                        Some(seq) => seq,
                        None => break,
                    };
                    if seq_lt(self.rcv_nxt, seg_seq) {
                        break;
                    }
                    if let Some(data) = self.ooo.remove(&seg_seq) {
                        let skip = self.rcv_nxt.wrapping_sub(seg_seq) as usize;
                        if skip < data.len() {
                            self.accept_payload(&data[skip..]);
                        }
                    }
                }
            }
            outs.push(self.make_ack());
        } else if seq_lt(self.rcv_nxt, seq) {
            if self.ooo.len() < OOO_LIMIT {
                self.ooo.insert(seq, payload.to_vec());
            }
            // Duplicate ACK tells the peer what we are still missing.
            outs.push(self.make_ack());
        } else {
            // Partially old segment; accept the unseen tail.
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            if skip < payload.len() {
                self.accept_payload(&payload[skip..]);
            }
            outs.push(self.make_ack());
        }
    }

    fn process_fin(&mut self, fin_seq: u32, now: u64, outs: &mut Vec<TcpOut>) {
        if fin_seq != self.rcv_nxt {
            // Out of order; the peer will retransmit it.
            return;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.fin_rcvd = true;
        outs.push(self.make_ack());
        match self.state {
            TcpState::Established => self.state = TcpState::CloseWait,
            TcpState::FinWait1 => {
                if self.fin_sent && self.snd_una == self.snd_nxt {
                    self.state = TcpState::TimeWait;
                    self.time_wait_deadline = Some(now + TIME_WAIT_MS);
                } else {
                    self.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => {
                self.state = TcpState::TimeWait;
                self.time_wait_deadline = Some(now + TIME_WAIT_MS);
            }
            TcpState::TimeWait => {
                self.time_wait_deadline = Some(now + TIME_WAIT_MS);
            }
            _ => {}
        }
    }

    /// Process one inbound segment.
    fn on_segment(
        &mut self,
        hdr: &TcpHdr,
        payload: &[u8],
        now: u64,
        outs: &mut Vec<TcpOut>,
    ) -> SegmentOutcome {
        let mut outcome = SegmentOutcome::default();
        self.last_activity = now;
        self.keepalive_probes = 0;

        if self.state == TcpState::SynSent {
            if hdr.flags.ack
                && !(seq_lt(self.snd_una, hdr.ack) && seq_le(hdr.ack, self.snd_nxt))
            {
                if !hdr.flags.rst {
                    outs.push(TcpOut {
                        seq: hdr.ack,
                        ack: 0,
                        flags: TcpFlags {
                            rst: true,
                            ..TcpFlags::NONE
                        },
                        win: 0,
                        mss_opt: None,
                        payload: Vec::new(),
                    });
                }
                return outcome;
            }
            if hdr.flags.rst {
                if hdr.flags.ack {
                    self.error = Some(NetworkError::ConnectionRefused);
                    self.state = TcpState::Closed;
                    self.defunct = true;
                    self.rtx.clear();
                    self.rto_deadline = None;
                }
                return outcome;
            }
            if hdr.flags.syn {
                self.irs = hdr.seq;
                self.rcv_nxt = hdr.seq.wrapping_add(1);
                if let Some(mss) = hdr.options.mss {
                    self.mss = self.mss.min(mss);
                }
                if hdr.flags.ack {
                    self.snd_una = hdr.ack;
                    self.rtx.clear();
                    self.rto_deadline = None;
                    self.snd_wnd = hdr.win as u32;
                    self.snd_wl1 = hdr.seq;
                    self.snd_wl2 = hdr.ack;
                    self.state = TcpState::Established;
                    outcome.newly_established = true;
                    outs.push(self.make_ack());
                    self.output(now, outs);
                } else {
                    // Simultaneous open.
                    self.state = TcpState::SynRcvd;
                    let win = self.advertised_wnd();
                    outs.push(TcpOut {
                        seq: self.iss,
                        ack: self.rcv_nxt,
                        flags: TcpFlags::syn_ack(),
                        win,
                        mss_opt: Some(0), // patched with the local MSS on emit
                        payload: Vec::new(),
                    });
                }
            }
            return outcome;
        }

        // Synchronized states: window check first.
        let seg_len = payload.len() as u32 + hdr.flags.syn as u32 + hdr.flags.fin as u32;
        if !self.segment_acceptable(hdr.seq, seg_len) {
            if !hdr.flags.rst {
                // Challenge ACK resynchronizes the peer without accepting
                // suspect data.
                outs.push(self.make_ack());
            }
            return outcome;
        }

        if hdr.flags.rst {
            match self.state {
                TcpState::SynRcvd => {
                    self.error = Some(NetworkError::ConnectionRefused);
                }
                _ => {
                    self.error = Some(NetworkError::ConnectionReset);
                }
            }
            self.state = TcpState::Closed;
            self.defunct = true;
            self.rtx.clear();
            self.rto_deadline = None;
            return outcome;
        }

        if hdr.flags.syn {
            // SYN on a synchronized connection resets it.
            outs.push(TcpOut {
                seq: self.snd_nxt,
                ack: 0,
                flags: TcpFlags {
                    rst: true,
                    ..TcpFlags::NONE
                },
                win: 0,
                mss_opt: None,
                payload: Vec::new(),
            });
            self.error = Some(NetworkError::ConnectionReset);
            self.state = TcpState::Closed;
            self.defunct = true;
            self.rtx.clear();
            self.rto_deadline = None;
            return outcome;
        }

        if !hdr.flags.ack {
            return outcome;
        }

        if self.state == TcpState::SynRcvd {
            if seq_between(hdr.ack, self.snd_una.wrapping_add(1), self.snd_nxt.wrapping_sub(self.snd_una)) || hdr.ack == self.snd_nxt {
                self.snd_wnd = hdr.win as u32;
                self.snd_wl1 = hdr.seq;
                self.snd_wl2 = hdr.ack;
                self.state = TcpState::Established;
                outcome.newly_established = true;
            } else {
                outs.push(TcpOut {
                    seq: hdr.ack,
                    ack: 0,
                    flags: TcpFlags {
                        rst: true,
                        ..TcpFlags::NONE
                    },
                    win: 0,
                    mss_opt: None,
                    payload: Vec::new(),
                });
                return outcome;
            }
        }

        self.process_ack(hdr, payload.len(), now, outs);
        self.process_payload(hdr.seq, payload, outs);
        if hdr.flags.fin {
            let fin_seq = hdr.seq.wrapping_add(payload.len() as u32);
            self.process_fin(fin_seq, now, outs);
        }
        self.output(now, outs);
        outcome
    }

    /// Listen sessions: take the next established child for accept().
    pub fn pop_accept(&mut self) -> Option<SessionKey> {
        self.accept_queue.pop_front()
    }

    /// Timer tick: retransmission, TimeWait expiry, keepalive probing.
    fn on_timer(&mut self, now: u64, outs: &mut Vec<TcpOut>) {
        if self.state == TcpState::TimeWait {
            if let Some(deadline) = self.time_wait_deadline {
                if now >= deadline {
                    self.state = TcpState::Closed;
                    self.defunct = true;
                }
            }
            return;
        }

        if let Some(deadline) = self.rto_deadline {
            if now >= deadline {
                if let Some(front) = self.rtx.front_mut() {
                    front.retries += 1;
                    front.sent_at = now;
                    if front.retries > MAX_RETRANSMITS {
                        log::warn!(
                            target: "tcp",
                            "retransmission limit reached, giving up on session"
                        );
                        self.error = Some(NetworkError::TimedOut);
                        self.state = TcpState::Closed;
                        self.defunct = true;
                        self.rtx.clear();
                        self.rto_deadline = None;
                        return;
                    }
                    // Exponential backoff up to the cap.
                    self.rto_ms = (self.rto_ms * 2).min(RTO_MAX_MS);
                    self.rto_deadline = Some(now + self.rto_ms);
                    let seg = TcpOut {
                        seq: front.seq,
                        ack: self.rcv_nxt,
                        flags: if front.syn && self.state == TcpState::SynSent {
                            TcpFlags::SYN
                        } else {
                            front.flags()
                        },
                        win: 0,
                        mss_opt: if front.syn {
                            Some(0) // patched by the caller with the real MSS
                        } else {
                            None
                        },
                        payload: front.data.clone(),
                    };
                    outs.push(seg);
                    let win = self.advertised_wnd();
                    if let Some(last) = outs.last_mut() {
                        last.win = win;
                    }
                } else {
                    self.rto_deadline = None;
                }
            }
        }

        if self.state == TcpState::Established
            && self.rtx.is_empty()
            && now.saturating_sub(self.last_activity) >= KEEPALIVE_IDLE_MS
        {
            self.keepalive_probes += 1;
            self.last_activity = now;
            if self.keepalive_probes > KEEPALIVE_MAX_PROBES {
                self.error = Some(NetworkError::TimedOut);
                self.state = TcpState::Closed;
                self.defunct = true;
                return;
            }
            // Probe with a one-below-window ACK to provoke a reply.
            let win = self.advertised_wnd();
            outs.push(TcpOut {
                seq: self.snd_una.wrapping_sub(1),
                ack: self.rcv_nxt,
                flags: TcpFlags::ACK,
                win,
                mss_opt: None,
                payload: Vec::new(),
            });
        }
    }
}

/// One connection; the lock serializes receive processing and user calls,
/// the condvar wakes blocked socket operations.
pub struct TcpSession {
    pub key: SessionKey,
    pub cb: Mutex<TcpCb>,
    pub notify: Condvar,
    /// MSS advertised in our SYN/SYN+ACK.
    local_mss: u16,
}

impl TcpSession {
    fn new(key: SessionKey, config: &StackConfig, now: u64) -> Arc<TcpSession> {
        Arc::new(TcpSession {
            key,
            cb: Mutex::new(TcpCb::new(config, now)),
            notify: Condvar::new(),
            local_mss: config.tcp_mss.min(65_535) as u16,
        })
    }

    /// Fix up MSS-bearing segments with the locally advertised value.
    fn patch_mss(&self, outs: &mut [TcpOut]) {
        for out in outs.iter_mut() {
            if out.mss_opt.is_some() {
                out.mss_opt = Some(self.local_mss);
            }
        }
    }
}

/// The session table: established connections by 4-tuple plus listening
/// endpoints by local (address, port).
pub struct TcpSessionTable {
    established: spin::RwLock<BTreeMap<SessionKey, Arc<TcpSession>>>,
    listening: spin::RwLock<BTreeMap<(IpAddress, u16), Arc<TcpSession>>>,
}

impl TcpSessionTable {
    pub fn new() -> Self {
        TcpSessionTable {
            established: spin::RwLock::new(BTreeMap::new()),
            listening: spin::RwLock::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<TcpSession>> {
        self.established.read().get(key).cloned()
    }

    /// Match a listener: exact local address, then the family wildcard,
    /// then the other family's wildcard when it is dual-bound.
    pub fn lookup_listen(&self, local: &IpAddress, port: u16) -> Option<Arc<TcpSession>> {
        let listening = self.listening.read();
        if let Some(session) = listening.get(&(*local, port)) {
            return Some(session.clone());
        }
        if let Some(session) = listening.get(&(local.unspecified_of_family(), port)) {
            return Some(session.clone());
        }
        let other = match local {
            IpAddress::Ip4(_) => IpAddress::Ip6(crate::addr::Ip6Address::UNSPECIFIED),
            IpAddress::Ip6(_) => IpAddress::Ip4(crate::addr::Ip4Address::UNSPECIFIED),
        };
        listening
            .get(&(other, port))
            .filter(|session| session.cb.lock().unwrap().dual)
            .cloned()
    }

    pub fn insert(&self, session: Arc<TcpSession>) -> Result<(), NetworkError> {
        let mut established = self.established.write();
        if established.contains_key(&session.key) {
            return Err(NetworkError::AddressInUse);
        }
        established.insert(session.key, session);
        Ok(())
    }

    pub fn remove(&self, key: &SessionKey) {
        self.established.write().remove(key);
    }

    pub fn listen_bound(&self, local: &(IpAddress, u16)) -> bool {
        self.listening.read().contains_key(local)
    }

    pub fn insert_listen(
        &self,
        local: (IpAddress, u16),
        session: Arc<TcpSession>,
    ) -> Result<(), NetworkError> {
        let mut listening = self.listening.write();
        if listening.contains_key(&local) {
            return Err(NetworkError::AddressInUse);
        }
        listening.insert(local, session);
        Ok(())
    }

    pub fn remove_listen(&self, local: &(IpAddress, u16)) {
        self.listening.write().remove(local);
    }

    /// Whether any session or listener occupies this local endpoint.
    pub fn port_in_use(&self, local: &IpAddress, port: u16) -> bool {
        if self.listening.read().keys().any(|(_, p)| *p == port) {
            return true;
        }
        self.established
            .read()
            .keys()
            .any(|(ip, p, _, _)| *p == port && (ip == local || local.is_unspecified()))
    }

    fn all_sessions(&self) -> Vec<Arc<TcpSession>> {
        self.established.read().values().cloned().collect()
    }

    /// Timer tick over every session; emits retransmissions and reaps
    /// defunct sessions.
    pub fn maintain(&self, ph: &PacketHandler, now: u64) {
        for session in self.all_sessions() {
            let (mut outs, defunct) = {
                let mut cb = session.cb.lock().unwrap();
                let mut outs = Vec::new();
                cb.on_timer(now, &mut outs);
                (outs, cb.defunct)
            };
            if !outs.is_empty() {
                session.patch_mss(&mut outs);
                transmit(ph, &session.key, &outs, None);
            }
            if defunct {
                self.remove(&session.key);
                session.notify.notify_all();
            }
        }
    }
}

impl Default for TcpSessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a listening session on `local`.
pub fn listen(
    ph: &PacketHandler,
    local: (IpAddress, u16),
    backlog: usize,
    dual: bool,
) -> Result<Arc<TcpSession>, NetworkError> {
    let key = (local.0, local.1, local.0.unspecified_of_family(), 0);
    let session = TcpSession::new(key, &ph.config, crate::current_time_ms());
    {
        let mut cb = session.cb.lock().unwrap();
        cb.state = TcpState::Listen;
        cb.backlog = backlog.max(1);
        cb.dual = dual;
    }
    ph.sessions.insert_listen(local, session.clone())?;
    log::info!(target: "tcp", "listening on {}:{}", local.0, local.1);
    Ok(session)
}

/// Open an active connection; emits the SYN. The caller blocks on the
/// session condvar until Established or an error.
pub fn connect(
    ph: &PacketHandler,
    local: (IpAddress, u16),
    remote: (IpAddress, u16),
) -> Result<Arc<TcpSession>, NetworkError> {
    let now = crate::current_time_ms();
    let key = (local.0, local.1, remote.0, remote.1);
    let session = TcpSession::new(key, &ph.config, now);
    let iss = ph.rand.lock().next_u32();
    let syn = {
        let mut cb = session.cb.lock().unwrap();
        cb.state = TcpState::SynSent;
        cb.iss = iss;
        cb.snd_una = iss;
        cb.snd_nxt = iss.wrapping_add(1);
        cb.mss = ph.config.tcp_mss.min(65_535) as u16;
        cb.rtx.push_back(RtxSegment {
            seq: iss,
            syn: true,
            fin: false,
            data: Vec::new(),
            first_sent: now,
            sent_at: now,
            retries: 0,
        });
        cb.arm_rto(now);
        let win = cb.advertised_wnd();
        TcpOut {
            seq: iss,
            ack: 0,
            flags: TcpFlags::SYN,
            win,
            mss_opt: Some(session.local_mss),
            payload: Vec::new(),
        }
    };
    ph.sessions.insert(session.clone())?;
    log::info!(
        target: "tcp",
        "connecting {}:{} -> {}:{}",
        local.0, local.1, remote.0, remote.1
    );
    transmit(ph, &key, &[syn], None);
    Ok(session)
}

/// Handle an inbound TCP segment carried over IPv4.
pub fn phrx_tcp(ph: &PacketHandler, rx: &mut PacketRx) {
    let at = match rx.ip4.as_ref() {
        Some(ip4) => ip4.payload.clone(),
        None => return,
    };
    phrx_tcp_at(ph, rx, at.start, at.end);
}

/// Handle an inbound TCP segment at `[at, end)` of either family.
pub fn phrx_tcp_at(ph: &PacketHandler, rx: &mut PacketRx, at: usize, end: usize) {
    ph.stats_rx.write().tcp__pre_parse += 1;

    let (src, dst) = match (&rx.ip6, &rx.ip4) {
        (Some(ip6), _) => (IpAddress::Ip6(ip6.src), IpAddress::Ip6(ip6.dst)),
        (None, Some(ip4)) => (IpAddress::Ip4(ip4.src), IpAddress::Ip4(ip4.dst)),
        (None, None) => return,
    };

    let hdr = match TcpHdr::parse(&rx.frame, at..end) {
        Ok(hdr) => hdr,
        Err(reason) => {
            ph.stats_rx.write().tcp__failed_parse += 1;
            rx.parse_failed = Some(reason);
            log::warn!(target: "tcp", "{} - {}", rx.tracker, reason);
            return;
        }
    };

    if ph.config.packet_integrity_check && !hdr.verify_checksum(&rx.frame, &src, &dst) {
        ph.stats_rx.write().tcp__failed_parse += 1;
        rx.parse_failed = Some("tcp: bad checksum");
        log::warn!(target: "tcp", "{} - bad checksum", rx.tracker);
        return;
    }

    if ph.config.packet_sanity_check && (hdr.sport == 0 || hdr.dport == 0) {
        ph.stats_rx.write().tcp__failed_sanity += 1;
        rx.parse_failed = Some("tcp: port zero");
        log::warn!(target: "tcp", "{} - port zero", rx.tracker);
        return;
    }

    log::debug!(
        target: "tcp",
        "{} - {}:{} > {}:{}, seq {}, ack {}, flags 0x{:02x}, len {}",
        rx.tracker, src, hdr.sport, dst, hdr.dport, hdr.seq, hdr.ack,
        hdr.flags.to_byte(), hdr.payload.len()
    );

    let payload = rx.frame[hdr.payload.clone()].to_vec();
    let key: SessionKey = (dst, hdr.dport, src, hdr.sport);
    let now = crate::current_time_ms();

    // Exact 4-tuple match first.
    if let Some(session) = ph.sessions.lookup(&key) {
        ph.stats_rx.write().tcp__socket_match += 1;
        let (mut outs, outcome, defunct) = {
            let mut cb = session.cb.lock().unwrap();
            let mut outs = Vec::new();
            let outcome = cb.on_segment(&hdr, &payload, now, &mut outs);
            (outs, outcome, cb.defunct)
        };
        session.notify.notify_all();
        if outcome.newly_established {
            report_established(ph, &session);
        }
        if defunct {
            ph.sessions.remove(&key);
        }
        session.patch_mss(&mut outs);
        transmit(ph, &key, &outs, Some(rx.tracker));
        rx.tcp = Some(hdr);
        return;
    }

    // No session: a SYN may match a listener.
    if hdr.flags.syn && !hdr.flags.ack && !hdr.flags.rst {
        if let Some(listener) = ph.sessions.lookup_listen(&dst, hdr.dport) {
            ph.stats_rx.write().tcp__socket_match += 1;
            let backlog_full = {
                let cb = listener.cb.lock().unwrap();
                cb.accept_queue.len() >= cb.backlog
            };
            if backlog_full {
                log::debug!(target: "tcp", "{} - backlog full, dropping SYN", rx.tracker);
                rx.tcp = Some(hdr);
                return;
            }

            let child = TcpSession::new(key, &ph.config, now);
            let iss = ph.rand.lock().next_u32();
            let syn_ack = {
                let mut cb = child.cb.lock().unwrap();
                cb.state = TcpState::SynRcvd;
                cb.iss = iss;
                cb.snd_una = iss;
                cb.snd_nxt = iss.wrapping_add(1);
                cb.irs = hdr.seq;
                cb.rcv_nxt = hdr.seq.wrapping_add(1);
                cb.snd_wnd = hdr.win as u32;
                cb.snd_wl1 = hdr.seq;
                cb.snd_wl2 = iss;
                cb.mss = hdr
                    .options
                    .mss
                    .unwrap_or(DEFAULT_PEER_MSS)
                    .min(ph.config.tcp_mss as u16);
                cb.parent = Some((dst, hdr.dport));
                cb.rtx.push_back(RtxSegment {
                    seq: iss,
                    syn: true,
                    fin: false,
                    data: Vec::new(),
                    first_sent: now,
                    sent_at: now,
                    retries: 0,
                });
                cb.arm_rto(now);
                let win = cb.advertised_wnd();
                TcpOut {
                    seq: iss,
                    ack: cb.rcv_nxt,
                    flags: TcpFlags::syn_ack(),
                    win,
                    mss_opt: Some(child.local_mss),
                    payload: Vec::new(),
                }
            };
            if ph.sessions.insert(child).is_ok() {
                log::debug!(
                    target: "tcp",
                    "{} - SYN accepted on {}:{}, child session created",
                    rx.tracker, dst, hdr.dport
                );
                transmit(ph, &key, &[syn_ack], Some(rx.tracker));
            }
            rx.tcp = Some(hdr);
            return;
        }
    }

    // Nothing matched: answer with a reset.
    ph.stats_rx.write().tcp__no_socket_match__respond_rst += 1;
    log::debug!(target: "tcp", "{} - no session, responding with RST", rx.tracker);
    let rst = if hdr.flags.ack {
        TcpOut {
            seq: hdr.ack,
            ack: 0,
            flags: TcpFlags {
                rst: true,
                ..TcpFlags::NONE
            },
            win: 0,
            mss_opt: None,
            payload: Vec::new(),
        }
    } else {
        let seg_len = payload.len() as u32 + hdr.flags.syn as u32 + hdr.flags.fin as u32;
        TcpOut {
            seq: 0,
            ack: hdr.seq.wrapping_add(seg_len),
            flags: TcpFlags::rst_ack(),
            win: 0,
            mss_opt: None,
            payload: Vec::new(),
        }
    };
    transmit(ph, &key, &[rst], Some(rx.tracker));
    rx.tcp = Some(hdr);
}

/// A child session reached Established: queue it on its listener.
fn report_established(ph: &PacketHandler, session: &Arc<TcpSession>) {
    let parent = session.cb.lock().unwrap().parent;
    if let Some((ip, port)) = parent {
        if let Some(listener) = ph.sessions.lookup_listen(&ip, port) {
            listener
                .cb
                .lock()
                .unwrap()
                .accept_queue
                .push_back(session.key);
            listener.notify.notify_all();
        }
    }
}

/// Transmit segments for a session key (local, remote) pair.
pub(crate) fn transmit(ph: &PacketHandler, key: &SessionKey, outs: &[TcpOut], echo: Option<Tracker>) {
    let (local_ip, local_port, remote_ip, remote_port) = *key;
    for out in outs {
        phtx_tcp(ph, local_ip, local_port, remote_ip, remote_port, out, echo);
    }
}

/// Assemble and transmit one TCP segment.
pub fn phtx_tcp(
    ph: &PacketHandler,
    src: IpAddress,
    sport: u16,
    dst: IpAddress,
    dport: u16,
    out: &TcpOut,
    echo_tracker: Option<Tracker>,
) {
    {
        let mut stats = ph.stats_tx.write();
        stats.tcp__pre_assemble += 1;
        if out.flags.syn {
            stats.tcp__flag_syn += 1;
        }
        if out.flags.ack {
            stats.tcp__flag_ack += 1;
        }
        if out.flags.fin {
            stats.tcp__flag_fin += 1;
        }
        if out.flags.rst {
            stats.tcp__flag_rst += 1;
        }
        stats.tcp__send += 1;
    }

    let mut options = Vec::new();
    if let Some(mss) = out.mss_opt {
        options.extend_from_slice(&[tcp_option::MSS, 4]);
        options.extend_from_slice(&mss.to_be_bytes());
    }
    while options.len() % 4 != 0 {
        options.push(tcp_option::NOP);
    }
    let hlen = TCP_HEADER_LEN + options.len();

    let mut tx = PacketTx::new(&out.payload, echo_tracker);
    let header = tx.prepend(hlen);
    header[0..2].copy_from_slice(&sport.to_be_bytes());
    header[2..4].copy_from_slice(&dport.to_be_bytes());
    header[4..8].copy_from_slice(&out.seq.to_be_bytes());
    header[8..12].copy_from_slice(&out.ack.to_be_bytes());
    header[12] = ((hlen / 4) as u8) << 4;
    header[13] = out.flags.to_byte();
    header[14..16].copy_from_slice(&out.win.to_be_bytes());
    header[16] = 0;
    header[17] = 0;
    header[18] = 0;
    header[19] = 0;
    header[TCP_HEADER_LEN..hlen].copy_from_slice(&options);
    let pseudo = checksum::pseudo_sum(&src, &dst, ip_proto::TCP, tx.len());
    let cksum = checksum::checksum(tx.as_slice(), pseudo);
    tx.patch(16, &cksum.to_be_bytes());

    match (src, dst) {
        (IpAddress::Ip4(src), IpAddress::Ip4(dst)) => {
            ipv4::phtx_ip4(ph, tx, src, dst, ip_proto::TCP, false, echo_tracker);
        }
        (IpAddress::Ip6(src), IpAddress::Ip6(dst)) => {
            ipv6::phtx_ip6(
                ph,
                tx,
                src,
                dst,
                ip_proto::TCP,
                ipv6::DEFAULT_HOP_LIMIT,
                echo_tracker,
            );
        }
        _ => {
            log::error!(target: "tcp", "{:?} - mixed address families, dropping", echo_tracker);
        }
    }
}

// Socket-facing session operations; each takes the session lock, mutates,
// and returns the segments to emit so the caller transmits lock-free.

/// Queue bytes for transmission; returns bytes accepted and segments to send.
pub(crate) fn session_send(
    session: &TcpSession,
    data: &[u8],
) -> Result<(usize, Vec<TcpOut>), NetworkError> {
    let now = crate::current_time_ms();
    let mut cb = session.cb.lock().unwrap();
    if let Some(error) = cb.error {
        return Err(error);
    }
    if !cb.state.can_send() {
        return Err(NetworkError::NotConnected);
    }
    let n = cb.enqueue_data(data);
    let mut outs = Vec::new();
    cb.output(now, &mut outs);
    Ok((n, outs))
}

/// Read up to `n` buffered bytes; `Ok(empty)` after the peer's FIN.
pub(crate) fn session_recv(
    session: &TcpSession,
    n: usize,
) -> Result<Option<(Vec<u8>, Vec<TcpOut>)>, NetworkError> {
    let mut cb = session.cb.lock().unwrap();
    if cb.rx_buf.is_empty() {
        if cb.fin_rcvd {
            return Ok(Some((Vec::new(), Vec::new())));
        }
        if let Some(error) = cb.error {
            return Err(error);
        }
        if cb.defunct {
            return Err(NetworkError::Closed);
        }
        return Ok(None); // caller waits on the condvar
    }
    let take = n.min(cb.rx_buf.len());
    let data: Vec<u8> = cb.rx_buf.drain(..take).collect();
    // Window update once a zero or shrunken window reopens enough.
    let mut outs = Vec::new();
    let threshold = (cb.mss as u32).min(cb.rx_buf_cap as u32 / 2);
    if cb.last_adv_wnd == 0 && cb.rcv_space() >= threshold {
        let ack = cb.make_ack();
        outs.push(ack);
    }
    Ok(Some((data, outs)))
}

/// Begin the close sequence.
pub(crate) fn session_close(session: &TcpSession) -> Vec<TcpOut> {
    let now = crate::current_time_ms();
    let mut cb = session.cb.lock().unwrap();
    let mut outs = Vec::new();
    cb.close(now, &mut outs);
    outs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ip4Address;

    fn test_config() -> StackConfig {
        StackConfig::default()
    }

    fn hdr(seq: u32, ack: u32, flags: TcpFlags, win: u16) -> TcpHdr {
        TcpHdr {
            sport: 40000,
            dport: 80,
            seq,
            ack,
            hlen: TCP_HEADER_LEN,
            flags,
            win,
            cksum: 0,
            urg: 0,
            options: TcpOptions::default(),
            payload: 0..0,
        }
    }

    fn established_cb() -> TcpCb {
        let mut cb = TcpCb::new(&test_config(), 0);
        cb.state = TcpState::Established;
        cb.iss = 1000;
        cb.snd_una = 1001;
        cb.snd_nxt = 1001;
        cb.irs = 5000;
        cb.rcv_nxt = 5001;
        cb.snd_wnd = 65_535;
        cb.mss = 1460;
        cb
    }

    #[test]
    fn options_round_trip() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[tcp_option::MSS, 4, 0x05, 0xb4]);
        raw.extend_from_slice(&[tcp_option::NOP, tcp_option::WSCALE, 3, 7]);
        raw.extend_from_slice(&[tcp_option::SACK_PERMITTED, 2]);
        raw.extend_from_slice(&[tcp_option::TIMESTAMP, 10]);
        raw.extend_from_slice(&100u32.to_be_bytes());
        raw.extend_from_slice(&200u32.to_be_bytes());
        let options = TcpOptions::parse(&raw).unwrap();
        assert_eq!(options.mss, Some(1460));
        assert_eq!(options.wscale, Some(7));
        assert!(options.sack_permitted);
        assert_eq!(options.timestamp, Some((100, 200)));
    }

    #[test]
    fn options_reject_bad_length() {
        assert!(TcpOptions::parse(&[tcp_option::MSS, 1]).is_err());
        assert!(TcpOptions::parse(&[tcp_option::MSS, 40, 0]).is_err());
    }

    #[test]
    fn sequence_arithmetic_wraps() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(seq_le(0xffff_fff0, 0x10));
        assert!(!seq_lt(0x10, 0xffff_fff0));
        assert!(seq_between(0x5, 0xffff_fff0, 0x100));
    }

    #[test]
    fn header_parse_and_checksum() {
        let src = IpAddress::Ip4(Ip4Address::new([192, 168, 9, 102]));
        let dst = IpAddress::Ip4(Ip4Address::new([192, 168, 9, 7]));
        let out = TcpOut {
            seq: 0x1234_5678,
            ack: 0,
            flags: TcpFlags::SYN,
            win: 64_240,
            mss_opt: Some(1460),
            payload: Vec::new(),
        };
        // Assemble by hand the way phtx_tcp does.
        let mut segment = vec![0u8; 24];
        segment[0..2].copy_from_slice(&40000u16.to_be_bytes());
        segment[2..4].copy_from_slice(&80u16.to_be_bytes());
        segment[4..8].copy_from_slice(&out.seq.to_be_bytes());
        segment[12] = 6 << 4;
        segment[13] = out.flags.to_byte();
        segment[14..16].copy_from_slice(&out.win.to_be_bytes());
        segment[20..24].copy_from_slice(&[tcp_option::MSS, 4, 0x05, 0xb4]);
        let pseudo = checksum::pseudo_sum(&src, &dst, ip_proto::TCP, segment.len());
        let cksum = checksum::checksum(&segment, pseudo);
        segment[16..18].copy_from_slice(&cksum.to_be_bytes());

        let parsed = TcpHdr::parse(&segment, 0..segment.len()).unwrap();
        assert_eq!(parsed.sport, 40000);
        assert_eq!(parsed.seq, 0x1234_5678);
        assert!(parsed.flags.syn);
        assert!(!parsed.flags.ack);
        assert_eq!(parsed.options.mss, Some(1460));
        assert!(parsed.verify_checksum(&segment, &src, &dst));
    }

    #[test]
    fn listen_syn_handshake_reaches_established() {
        let mut cb = TcpCb::new(&test_config(), 0);
        cb.state = TcpState::SynRcvd;
        cb.iss = 3000;
        cb.snd_una = 3000;
        cb.snd_nxt = 3001;
        cb.irs = 9000;
        cb.rcv_nxt = 9001;

        let mut outs = Vec::new();
        let outcome = cb.on_segment(&hdr(9001, 3001, TcpFlags::ACK, 65_000), &[], 10, &mut outs);
        assert_eq!(cb.state, TcpState::Established);
        assert!(outcome.newly_established);
        assert_eq!(cb.snd_wnd, 65_000);
    }

    #[test]
    fn syn_sent_receives_syn_ack() {
        let mut cb = TcpCb::new(&test_config(), 0);
        cb.state = TcpState::SynSent;
        cb.iss = 100;
        cb.snd_una = 100;
        cb.snd_nxt = 101;
        cb.rtx.push_back(RtxSegment {
            seq: 100,
            syn: true,
            fin: false,
            data: Vec::new(),
            first_sent: 0,
            sent_at: 0,
            retries: 0,
        });

        let mut peer = hdr(7000, 101, TcpFlags::syn_ack(), 32_000);
        peer.options.mss = Some(1400);
        let mut outs = Vec::new();
        let outcome = cb.on_segment(&peer, &[], 5, &mut outs);
        assert_eq!(cb.state, TcpState::Established);
        assert!(outcome.newly_established);
        assert_eq!(cb.rcv_nxt, 7001);
        assert_eq!(cb.mss, 536.min(1400)); // takes the smaller of ours and theirs
        assert_eq!(outs.len(), 1);
        assert!(outs[0].flags.ack && !outs[0].flags.syn);
        assert_eq!(outs[0].ack, 7001);
    }

    #[test]
    fn syn_sent_rst_refuses_connection() {
        let mut cb = TcpCb::new(&test_config(), 0);
        cb.state = TcpState::SynSent;
        cb.iss = 100;
        cb.snd_una = 100;
        cb.snd_nxt = 101;

        let mut outs = Vec::new();
        cb.on_segment(&hdr(0, 101, TcpFlags::rst_ack(), 0), &[], 5, &mut outs);
        assert_eq!(cb.state, TcpState::Closed);
        assert_eq!(cb.error, Some(NetworkError::ConnectionRefused));
        assert!(cb.defunct);
    }

    #[test]
    fn in_order_payload_is_buffered_and_acked() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.on_segment(&hdr(5001, 1001, TcpFlags::psh_ack(), 65_000), b"hello", 10, &mut outs);
        assert_eq!(cb.rcv_nxt, 5006);
        assert_eq!(cb.rx_buf.iter().copied().collect::<Vec<u8>>(), b"hello");
        assert!(outs.iter().any(|o| o.flags.ack && o.ack == 5006));
    }

    #[test]
    fn out_of_order_payload_waits_for_the_gap() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        // Second segment arrives first.
        cb.on_segment(&hdr(5006, 1001, TcpFlags::psh_ack(), 65_000), b"world", 10, &mut outs);
        assert_eq!(cb.rcv_nxt, 5001);
        assert!(cb.rx_buf.is_empty());
        // Duplicate ACK points at the gap.
        assert!(outs.iter().any(|o| o.flags.ack && o.ack == 5001));

        outs.clear();
        cb.on_segment(&hdr(5001, 1001, TcpFlags::psh_ack(), 65_000), b"hello", 11, &mut outs);
        assert_eq!(cb.rcv_nxt, 5011);
        assert_eq!(
            cb.rx_buf.iter().copied().collect::<Vec<u8>>(),
            b"helloworld"
        );
        assert!(outs.iter().any(|o| o.flags.ack && o.ack == 5011));
    }

    #[test]
    fn out_of_window_segment_draws_challenge_ack() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.on_segment(&hdr(9_000_000, 1001, TcpFlags::psh_ack(), 65_000), b"x", 10, &mut outs);
        assert_eq!(cb.rcv_nxt, 5001); // nothing accepted
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].ack, 5001);
        assert!(outs[0].flags.ack);
    }

    #[test]
    fn syn_on_established_resets_session() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.on_segment(&hdr(5001, 1001, TcpFlags::syn_ack(), 65_000), &[], 10, &mut outs);
        assert_eq!(cb.state, TcpState::Closed);
        assert_eq!(cb.error, Some(NetworkError::ConnectionReset));
        assert!(outs.iter().any(|o| o.flags.rst));
    }

    #[test]
    fn rst_in_window_closes_with_error() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        let rst = TcpFlags {
            rst: true,
            ..TcpFlags::NONE
        };
        cb.on_segment(&hdr(5001, 0, rst, 0), &[], 10, &mut outs);
        assert_eq!(cb.state, TcpState::Closed);
        assert_eq!(cb.error, Some(NetworkError::ConnectionReset));
        assert!(outs.is_empty());
    }

    #[test]
    fn fin_moves_established_to_close_wait() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..TcpFlags::NONE
        };
        cb.on_segment(&hdr(5001, 1001, fin, 65_000), &[], 10, &mut outs);
        assert_eq!(cb.state, TcpState::CloseWait);
        assert_eq!(cb.rcv_nxt, 5002);
        assert!(cb.fin_rcvd);
        assert!(outs.iter().any(|o| o.flags.ack && o.ack == 5002));
    }

    #[test]
    fn active_close_walks_fin_wait_states() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.close(10, &mut outs);
        assert_eq!(cb.state, TcpState::FinWait1);
        assert!(cb.fin_sent);
        assert!(outs.iter().any(|o| o.flags.fin));
        assert_eq!(cb.snd_nxt, 1002);

        // Peer ACKs our FIN.
        outs.clear();
        cb.on_segment(&hdr(5001, 1002, TcpFlags::ACK, 65_000), &[], 20, &mut outs);
        assert_eq!(cb.state, TcpState::FinWait2);

        // Peer sends its own FIN.
        outs.clear();
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..TcpFlags::NONE
        };
        cb.on_segment(&hdr(5001, 1002, fin, 65_000), &[], 30, &mut outs);
        assert_eq!(cb.state, TcpState::TimeWait);
        assert!(cb.time_wait_deadline.is_some());
        assert!(outs.iter().any(|o| o.flags.ack && o.ack == 5002));
    }

    #[test]
    fn simultaneous_close_passes_through_closing() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.close(10, &mut outs);
        assert_eq!(cb.state, TcpState::FinWait1);

        // Peer's FIN arrives before the ACK of ours.
        outs.clear();
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..TcpFlags::NONE
        };
        cb.on_segment(&hdr(5001, 1001, fin, 65_000), &[], 20, &mut outs);
        assert_eq!(cb.state, TcpState::Closing);

        // Now the ACK of our FIN.
        outs.clear();
        cb.on_segment(&hdr(5002, 1002, TcpFlags::ACK, 65_000), &[], 30, &mut outs);
        assert_eq!(cb.state, TcpState::TimeWait);
    }

    #[test]
    fn passive_close_last_ack_to_closed() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..TcpFlags::NONE
        };
        cb.on_segment(&hdr(5001, 1001, fin, 65_000), &[], 10, &mut outs);
        assert_eq!(cb.state, TcpState::CloseWait);

        outs.clear();
        cb.close(20, &mut outs);
        assert_eq!(cb.state, TcpState::LastAck);

        outs.clear();
        cb.on_segment(&hdr(5002, 1002, TcpFlags::ACK, 65_000), &[], 30, &mut outs);
        assert_eq!(cb.state, TcpState::Closed);
        assert!(cb.defunct);
    }

    #[test]
    fn time_wait_expires_via_timer() {
        let mut cb = established_cb();
        cb.state = TcpState::TimeWait;
        cb.time_wait_deadline = Some(1_000);
        let mut outs = Vec::new();
        cb.on_timer(999, &mut outs);
        assert_eq!(cb.state, TcpState::TimeWait);
        cb.on_timer(1_000, &mut outs);
        assert_eq!(cb.state, TcpState::Closed);
        assert!(cb.defunct);
    }

    #[test]
    fn retransmission_backs_off_and_gives_up() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.enqueue_data(b"data");
        cb.output(0, &mut outs);
        assert_eq!(outs.len(), 1);
        assert_eq!(cb.rto_deadline, Some(RTO_INITIAL_MS));

        // First expiry doubles the timeout and re-emits.
        outs.clear();
        cb.on_timer(RTO_INITIAL_MS, &mut outs);
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].payload, b"data");
        assert_eq!(cb.rto_ms, 2 * RTO_INITIAL_MS);

        // Exhaust the retry budget.
        let mut now = RTO_INITIAL_MS;
        for _ in 0..MAX_RETRANSMITS + 1 {
            now += cb.rto_ms;
            outs.clear();
            cb.on_timer(now, &mut outs);
        }
        assert_eq!(cb.state, TcpState::Closed);
        assert_eq!(cb.error, Some(NetworkError::TimedOut));
    }

    #[test]
    fn rto_caps_at_maximum() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.enqueue_data(b"x");
        cb.output(0, &mut outs);
        let mut now = 0;
        for _ in 0..MAX_RETRANSMITS {
            now += cb.rto_ms + 1;
            outs.clear();
            cb.on_timer(now, &mut outs);
            if cb.defunct {
                break;
            }
            assert!(cb.rto_ms <= RTO_MAX_MS);
        }
    }

    #[test]
    fn ack_of_new_data_advances_and_disarms() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.enqueue_data(b"abcd");
        cb.output(0, &mut outs);
        assert_eq!(cb.snd_nxt, 1005);

        outs.clear();
        cb.on_segment(&hdr(5001, 1005, TcpFlags::ACK, 65_000), &[], 50, &mut outs);
        assert_eq!(cb.snd_una, 1005);
        assert!(cb.rtx.is_empty());
        assert_eq!(cb.rto_deadline, None);
        // First RTT sample seeds the estimator.
        assert_eq!(cb.srtt_ms, Some(50));
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.enqueue_data(b"payload");
        cb.output(0, &mut outs);

        for _ in 0..2 {
            outs.clear();
            cb.on_segment(&hdr(5001, 1001, TcpFlags::ACK, 65_535), &[], 10, &mut outs);
            assert!(outs.is_empty());
        }
        outs.clear();
        cb.on_segment(&hdr(5001, 1001, TcpFlags::ACK, 65_535), &[], 10, &mut outs);
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].seq, 1001);
        assert_eq!(outs[0].payload, b"payload");
    }

    #[test]
    fn send_respects_peer_window() {
        let mut cb = established_cb();
        cb.snd_wnd = 4;
        let mut outs = Vec::new();
        let n = cb.enqueue_data(b"12345678");
        assert_eq!(n, 8);
        cb.output(0, &mut outs);
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].payload, b"1234");
        assert_eq!(cb.snd_nxt, 1005);
        // Window opens; the rest flows.
        outs.clear();
        cb.on_segment(&hdr(5001, 1005, TcpFlags::ACK, 65_000), &[], 10, &mut outs);
        assert!(outs.iter().any(|o| o.payload == b"5678"));
    }

    #[test]
    fn send_invariant_snd_una_le_snd_nxt() {
        let mut cb = established_cb();
        let mut outs = Vec::new();
        cb.enqueue_data(&[0u8; 4000]);
        cb.output(0, &mut outs);
        assert!(seq_le(cb.snd_una, cb.snd_nxt));
        assert!(seq_le(cb.snd_nxt, cb.snd_una.wrapping_add(cb.snd_wnd)));
    }

    #[test]
    fn zero_window_advertised_when_buffer_nearly_full() {
        let mut cb = established_cb();
        let fill = cb.rx_buf_cap - 100; // less than one MSS left
        cb.rx_buf.extend(std::iter::repeat(0u8).take(fill));
        assert_eq!(cb.advertised_wnd(), 0);
        cb.rx_buf.clear();
        assert!(cb.advertised_wnd() > 0);
    }
}
