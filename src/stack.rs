//! Stack supervisor
//!
//! Owns the packet handler and the device, performs address assignment
//! (ARP probing for IPv4, duplicate address detection for IPv6, EUI-64
//! link-local derivation) and runs the three service threads: receive
//! drain, transmit drain, and the timer driving cache aging, fragment-flow
//! expiry and TCP timers.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::addr::{Ip6Address, Ip6Host};
use crate::arp;
use crate::config::StackConfig;
use crate::device::FrameDevice;
use crate::handler::PacketHandler;
use crate::icmpv6;
use crate::socket::{Socket, SocketFamily, SocketProtocol};
use crate::{NetworkError, NetworkResult};

/// ARP probes / neighbor solicitations sent while claiming an address.
const PROBE_COUNT: usize = 3;
/// Delay between probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(200);
/// Additional settle time before candidates are promoted.
const CLAIM_WAIT: Duration = Duration::from_millis(300);
/// Timer thread tick.
const TIMER_TICK: Duration = Duration::from_millis(100);
/// TX ring dequeue slice, bounding shutdown latency.
const TX_WAIT: Duration = Duration::from_millis(100);

/// The running stack: supervisor over the handler, the device and the
/// service threads.
pub struct TcpIpStack {
    handler: Arc<PacketHandler>,
    device: Arc<dyn FrameDevice>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpIpStack {
    pub fn new(device: Arc<dyn FrameDevice>, config: StackConfig) -> TcpIpStack {
        TcpIpStack {
            handler: PacketHandler::new(config),
            device,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// The shared packet handler; test harnesses drive it directly.
    pub fn handler(&self) -> Arc<PacketHandler> {
        self.handler.clone()
    }

    /// Create a socket bound to this stack.
    pub fn socket(&self, family: SocketFamily, protocol: SocketProtocol) -> Socket {
        Socket::new(self.handler.clone(), family, protocol)
    }

    /// Claim addresses and start the service threads.
    pub fn start(&self) -> NetworkResult<()> {
        let ph = &self.handler;
        log::info!(target: "stack", "starting, MAC {}", ph.mac_unicast);

        // The receive thread must already run during probing so conflict
        // answers are seen.
        self.spawn_rx()?;
        self.spawn_tx()?;

        if ph.config.ip6_support {
            ph.join_ip6_multicast(Ip6Address::ALL_NODES);
            let link_local = Ip6Host::new(Ip6Address::link_local_from_mac(ph.mac_unicast), 64);
            ph.add_ip6_candidate(link_local);
            if let Some(host) = ph.config.ip6_host {
                ph.add_ip6_candidate(host);
            }
        }
        if ph.config.ip4_support {
            if let Some(host) = ph.config.ip4_host {
                ph.add_ip4_candidate(host);
            }
        }

        // Probe each tentative address; a reply arriving meanwhile marks a
        // conflict through the regular receive path.
        for _ in 0..PROBE_COUNT {
            for host in ph.ip4_host_candidate.read().iter() {
                arp::phtx_arp_probe(ph, host.address);
            }
            for host in ph.ip6_host_candidate.read().iter() {
                icmpv6::phtx_nd_dad_solicitation(ph, host.address);
            }
            thread::sleep(PROBE_INTERVAL);
        }
        thread::sleep(CLAIM_WAIT);

        let (claimed4, conflicted4) = ph.promote_ip4_candidates();
        for host in &conflicted4 {
            log::warn!(
                target: "stack",
                "IPv4 address {} is already in use, not claimed",
                host.address
            );
        }
        for host in &claimed4 {
            // Gratuitous announcement so peers refresh their caches.
            arp::phtx_arp_announcement(ph, host.address);
        }

        let (_, conflicted6) = ph.promote_ip6_candidates();
        for host in &conflicted6 {
            log::warn!(
                target: "stack",
                "IPv6 address {} failed duplicate address detection",
                host.address
            );
        }

        self.spawn_timer()?;
        log::info!(target: "stack", "started");
        Ok(())
    }

    /// Raise the shutdown flag and join the service threads. Blocked
    /// socket operations observe the flag and return `Closed`.
    pub fn stop(&self) {
        log::info!(target: "stack", "stopping");
        self.handler.shutdown.store(true, Ordering::SeqCst);
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        log::info!(target: "stack", "stopped");
    }

    fn spawn_rx(&self) -> NetworkResult<()> {
        let ph = self.handler.clone();
        let device = self.device.clone();
        let handle = thread::Builder::new()
            .name("tapstack-rx".into())
            .spawn(move || {
                let mut buf = vec![0u8; 2048 + 64];
                while !ph.shutdown.load(Ordering::SeqCst) {
                    match device.read_frame(&mut buf) {
                        Ok(n) if n > 0 => ph.receive_frame(buf[..n].to_vec()),
                        Ok(_) => {}
                        Err(NetworkError::WouldBlock) => {}
                        Err(error) => {
                            log::error!(target: "rx-ring", "device read failed: {}", error);
                            ph.shutdown.store(true, Ordering::SeqCst);
                        }
                    }
                }
            })
            .map_err(|error| {
                log::error!(target: "stack", "failed to spawn receive thread: {}", error);
                NetworkError::HardwareError
            })?;
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn spawn_tx(&self) -> NetworkResult<()> {
        let ph = self.handler.clone();
        let device = self.device.clone();
        let handle = thread::Builder::new()
            .name("tapstack-tx".into())
            .spawn(move || {
                while !ph.shutdown.load(Ordering::SeqCst) {
                    if let Some(frame) = ph.tx_ring.dequeue_timeout(TX_WAIT) {
                        if let Err(error) = device.write_frame(frame.as_slice()) {
                            log::error!(target: "tx-ring", "device write failed: {}", error);
                            ph.shutdown.store(true, Ordering::SeqCst);
                        }
                    }
                }
            })
            .map_err(|error| {
                log::error!(target: "stack", "failed to spawn transmit thread: {}", error);
                NetworkError::HardwareError
            })?;
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }

    fn spawn_timer(&self) -> NetworkResult<()> {
        let ph = self.handler.clone();
        let handle = thread::Builder::new()
            .name("tapstack-timer".into())
            .spawn(move || {
                while !ph.shutdown.load(Ordering::SeqCst) {
                    thread::sleep(TIMER_TICK);
                    ph.on_timer_tick();
                }
            })
            .map_err(|error| {
                log::error!(target: "stack", "failed to spawn timer thread: {}", error);
                NetworkError::HardwareError
            })?;
        self.threads.lock().unwrap().push(handle);
        Ok(())
    }
}

impl Drop for TcpIpStack {
    fn drop(&mut self) {
        self.stop();
    }
}
