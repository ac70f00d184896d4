//! BSD-style sockets
//!
//! User-facing endpoints multiplexed over the stack: datagram queues for
//! UDP, session handles for TCP. Blocking operations wait on a condition
//! variable and wake on data arrival, connection establishment, accept-queue
//! activity, buffer space, close, or stack shutdown.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::addr::{Ip4Address, Ip6Address, IpAddress};
use crate::handler::PacketHandler;
use crate::tcp::{self, TcpSession, TcpState};
use crate::udp;
use crate::{NetworkError, NetworkResult};

/// Datagrams buffered per UDP socket; oldest dropped beyond this.
pub const UDP_QUEUE_LIMIT: usize = 32;

/// Poll interval for blocking operations so they can observe close and
/// shutdown.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// First ephemeral port (IANA dynamic range).
const EPHEMERAL_BASE: u16 = 49_152;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    Ip4,
    Ip6,
    /// IPv6 endpoint that also accepts IPv4 peers.
    Dual,
}

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    Udp,
    Tcp,
}

/// One received datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub src: IpAddress,
    pub sport: u16,
}

/// Receive side of a bound UDP socket, owned by the socket table so the
/// packet handler can deliver into it.
pub struct UdpEndpoint {
    pub local: (IpAddress, u16),
    pub dual: bool,
    queue: Mutex<VecDeque<Datagram>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl UdpEndpoint {
    fn new(local: (IpAddress, u16), dual: bool) -> Arc<UdpEndpoint> {
        Arc::new(UdpEndpoint {
            local,
            dual,
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver one datagram; a full queue drops the oldest.
    pub fn deliver(&self, data: Vec<u8>, src: IpAddress, sport: u16) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= UDP_QUEUE_LIMIT {
            queue.pop_front();
            log::debug!(target: "socket", "udp queue full, dropping oldest datagram");
        }
        queue.push_back(Datagram { data, src, sport });
        drop(queue);
        self.ready.notify_one();
    }

    fn take(&self) -> Option<Datagram> {
        self.queue.lock().unwrap().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The UDP endpoint table. TCP endpoints live in the session table.
pub struct SocketTable {
    udp: spin::RwLock<BTreeMap<(IpAddress, u16), Arc<UdpEndpoint>>>,
}

impl SocketTable {
    pub fn new() -> Self {
        SocketTable {
            udp: spin::RwLock::new(BTreeMap::new()),
        }
    }

    /// Match a bound endpoint: exact local address, then the family
    /// wildcard, then the other family's wildcard when dual-bound.
    pub fn lookup_udp(&self, dst: &IpAddress, port: u16) -> Option<Arc<UdpEndpoint>> {
        let table = self.udp.read();
        if let Some(endpoint) = table.get(&(*dst, port)) {
            return Some(endpoint.clone());
        }
        if let Some(endpoint) = table.get(&(dst.unspecified_of_family(), port)) {
            return Some(endpoint.clone());
        }
        let other = match dst {
            IpAddress::Ip4(_) => IpAddress::Ip6(Ip6Address::UNSPECIFIED),
            IpAddress::Ip6(_) => IpAddress::Ip4(Ip4Address::UNSPECIFIED),
        };
        table
            .get(&(other, port))
            .filter(|endpoint| endpoint.dual)
            .cloned()
    }

    pub fn bind_udp(
        &self,
        local: (IpAddress, u16),
        dual: bool,
    ) -> NetworkResult<Arc<UdpEndpoint>> {
        let mut table = self.udp.write();
        if table.contains_key(&local) {
            return Err(NetworkError::AddressInUse);
        }
        let endpoint = UdpEndpoint::new(local, dual);
        table.insert(local, endpoint.clone());
        Ok(endpoint)
    }

    pub fn unbind_udp(&self, local: &(IpAddress, u16)) {
        self.udp.write().remove(local);
    }

    pub fn udp_port_in_use(&self, port: u16) -> bool {
        self.udp.read().keys().any(|(_, p)| *p == port)
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

struct SocketInner {
    local: Option<(IpAddress, u16)>,
    remote: Option<(IpAddress, u16)>,
    udp: Option<Arc<UdpEndpoint>>,
    tcp: Option<Arc<TcpSession>>,
    listener: bool,
    closed: bool,
}

/// A user-facing socket.
pub struct Socket {
    ph: Arc<PacketHandler>,
    pub family: SocketFamily,
    pub protocol: SocketProtocol,
    inner: Mutex<SocketInner>,
}

impl Socket {
    pub fn new(ph: Arc<PacketHandler>, family: SocketFamily, protocol: SocketProtocol) -> Socket {
        Socket {
            ph,
            family,
            protocol,
            inner: Mutex::new(SocketInner {
                local: None,
                remote: None,
                udp: None,
                tcp: None,
                listener: false,
                closed: false,
            }),
        }
    }

    fn wildcard(&self) -> IpAddress {
        match self.family {
            SocketFamily::Ip4 => IpAddress::Ip4(Ip4Address::UNSPECIFIED),
            SocketFamily::Ip6 | SocketFamily::Dual => IpAddress::Ip6(Ip6Address::UNSPECIFIED),
        }
    }

    fn family_accepts(&self, address: &IpAddress) -> bool {
        match (self.family, address) {
            (SocketFamily::Ip4, IpAddress::Ip4(_)) => true,
            (SocketFamily::Ip6, IpAddress::Ip6(_)) => true,
            (SocketFamily::Dual, _) => true,
            _ => false,
        }
    }

    fn address_owned(&self, address: &IpAddress) -> bool {
        match address {
            IpAddress::Ip4(a) => self.ph.ip4_unicast_owned(*a),
            IpAddress::Ip6(a) => self.ph.ip6_unicast_owned(*a),
        }
    }

    fn ephemeral_port(&self) -> NetworkResult<u16> {
        let span = u16::MAX - EPHEMERAL_BASE;
        for _ in 0..span {
            let port = EPHEMERAL_BASE + self.ph.rand.lock().next_u16() % span;
            let in_use = match self.protocol {
                SocketProtocol::Udp => self.ph.sockets.udp_port_in_use(port),
                SocketProtocol::Tcp => self.ph.sessions.port_in_use(&self.wildcard(), port),
            };
            if !in_use {
                return Ok(port);
            }
        }
        Err(NetworkError::AddressInUse)
    }

    /// Bind to a local address and port; port zero allocates an ephemeral
    /// port.
    pub fn bind(&self, address: IpAddress, port: u16) -> NetworkResult<()> {
        if !self.family_accepts(&address) {
            return Err(NetworkError::InvalidAddress);
        }
        if !address.is_unspecified() && !self.address_owned(&address) {
            return Err(NetworkError::AddressNotAvailable);
        }
        let port = if port == 0 { self.ephemeral_port()? } else { port };
        let mut inner = self.inner.lock().unwrap();
        if inner.local.is_some() {
            return Err(NetworkError::InvalidState);
        }
        match self.protocol {
            SocketProtocol::Udp => {
                let endpoint = self
                    .ph
                    .sockets
                    .bind_udp((address, port), self.family == SocketFamily::Dual)?;
                inner.udp = Some(endpoint);
            }
            SocketProtocol::Tcp => {
                if self.ph.sessions.listen_bound(&(address, port)) {
                    return Err(NetworkError::AddressInUse);
                }
            }
        }
        inner.local = Some((address, port));
        log::debug!(target: "socket", "bound to {}:{}", address, port);
        Ok(())
    }

    /// Start listening (TCP only).
    pub fn listen(&self, backlog: usize) -> NetworkResult<()> {
        if self.protocol != SocketProtocol::Tcp {
            return Err(NetworkError::NotSupported);
        }
        let mut inner = self.inner.lock().unwrap();
        let local = inner.local.ok_or(NetworkError::NotBound)?;
        let session = tcp::listen(
            &self.ph,
            local,
            backlog,
            self.family == SocketFamily::Dual,
        )?;
        inner.tcp = Some(session);
        inner.listener = true;
        Ok(())
    }

    /// Block until an established connection can be accepted.
    pub fn accept(&self) -> NetworkResult<Socket> {
        let (listener, local) = {
            let inner = self.inner.lock().unwrap();
            if !inner.listener {
                return Err(NetworkError::InvalidState);
            }
            (
                inner.tcp.clone().ok_or(NetworkError::InvalidState)?,
                inner.local.ok_or(NetworkError::NotBound)?,
            )
        };

        let mut cb = listener.cb.lock().unwrap();
        loop {
            if let Some(key) = cb.pop_accept() {
                drop(cb);
                let session = self.ph.sessions.lookup(&key).ok_or(NetworkError::Closed)?;
                let socket = Socket::new(self.ph.clone(), self.family, SocketProtocol::Tcp);
                {
                    let mut inner = socket.inner.lock().unwrap();
                    inner.local = Some((key.0, key.1));
                    inner.remote = Some((key.2, key.3));
                    inner.tcp = Some(session);
                }
                log::info!(
                    target: "socket",
                    "accepted connection from {}:{} on {}:{}",
                    key.2, key.3, local.0, local.1
                );
                return Ok(socket);
            }
            if self.is_closed() || self.ph.shutdown.load(Ordering::SeqCst) {
                return Err(NetworkError::Closed);
            }
            let (woken, _) = listener.notify.wait_timeout(cb, WAIT_SLICE).unwrap();
            cb = woken;
        }
    }

    /// Connect to a remote endpoint. TCP blocks until the handshake
    /// finishes; UDP just records the default destination.
    pub fn connect(&self, address: IpAddress, port: u16) -> NetworkResult<()> {
        if !self.family_accepts(&address) {
            return Err(NetworkError::InvalidAddress);
        }
        let local_ip = match address {
            IpAddress::Ip4(dst) => IpAddress::Ip4(
                self.ph
                    .ip4_src_for(dst)
                    .ok_or(NetworkError::AddressNotAvailable)?,
            ),
            IpAddress::Ip6(dst) => IpAddress::Ip6(
                self.ph
                    .ip6_src_for(dst)
                    .ok_or(NetworkError::AddressNotAvailable)?,
            ),
        };

        match self.protocol {
            SocketProtocol::Udp => {
                {
                    let inner = self.inner.lock().unwrap();
                    if inner.local.is_none() {
                        drop(inner);
                        self.bind(self.wildcard(), 0)?;
                    }
                }
                self.inner.lock().unwrap().remote = Some((address, port));
                Ok(())
            }
            SocketProtocol::Tcp => {
                let local_port = {
                    let inner = self.inner.lock().unwrap();
                    match inner.local {
                        Some((_, port)) => port,
                        None => {
                            drop(inner);
                            self.ephemeral_port()?
                        }
                    }
                };
                let session = tcp::connect(&self.ph, (local_ip, local_port), (address, port))?;
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.local = Some((local_ip, local_port));
                    inner.remote = Some((address, port));
                    inner.tcp = Some(session.clone());
                }

                // Wait for the handshake to finish.
                let mut cb = session.cb.lock().unwrap();
                loop {
                    if cb.state == TcpState::Established {
                        return Ok(());
                    }
                    if let Some(error) = cb.error {
                        return Err(error);
                    }
                    if cb.defunct {
                        return Err(NetworkError::ConnectionRefused);
                    }
                    if self.is_closed() || self.ph.shutdown.load(Ordering::SeqCst) {
                        return Err(NetworkError::Closed);
                    }
                    let (woken, _) = session.notify.wait_timeout(cb, WAIT_SLICE).unwrap();
                    cb = woken;
                }
            }
        }
    }

    /// Send bytes on a connected socket. TCP returns the number of bytes
    /// accepted into the transmit buffer, blocking only while it is full.
    pub fn send(&self, data: &[u8]) -> NetworkResult<usize> {
        match self.protocol {
            SocketProtocol::Udp => {
                let remote = self
                    .inner
                    .lock()
                    .unwrap()
                    .remote
                    .ok_or(NetworkError::NotConnected)?;
                self.sendto(data, remote.0, remote.1)
            }
            SocketProtocol::Tcp => {
                let session = {
                    let inner = self.inner.lock().unwrap();
                    if inner.closed {
                        return Err(NetworkError::Closed);
                    }
                    inner.tcp.clone().ok_or(NetworkError::NotConnected)?
                };
                loop {
                    let (n, outs) = tcp::session_send(&session, data)?;
                    tcp::transmit(&self.ph, &session.key, &outs, None);
                    if n > 0 {
                        return Ok(n);
                    }
                    if self.is_closed() || self.ph.shutdown.load(Ordering::SeqCst) {
                        return Err(NetworkError::Closed);
                    }
                    // Transmit buffer full; wait for ACKs to drain it.
                    let cb = session.cb.lock().unwrap();
                    let _ = session.notify.wait_timeout(cb, WAIT_SLICE).unwrap();
                }
            }
        }
    }

    /// Send one datagram to an explicit destination (UDP only).
    pub fn sendto(&self, data: &[u8], address: IpAddress, port: u16) -> NetworkResult<usize> {
        if self.protocol != SocketProtocol::Udp {
            return Err(NetworkError::NotSupported);
        }
        if !self.family_accepts(&address) {
            return Err(NetworkError::InvalidAddress);
        }
        {
            let inner = self.inner.lock().unwrap();
            if inner.local.is_none() {
                drop(inner);
                self.bind(self.wildcard(), 0)?;
            }
        }
        let (local_ip, local_port) = self.inner.lock().unwrap().local.unwrap();
        let src = if local_ip.is_unspecified() {
            match address {
                IpAddress::Ip4(dst) => IpAddress::Ip4(
                    self.ph
                        .ip4_src_for(dst)
                        .ok_or(NetworkError::AddressNotAvailable)?,
                ),
                IpAddress::Ip6(dst) => IpAddress::Ip6(
                    self.ph
                        .ip6_src_for(dst)
                        .ok_or(NetworkError::AddressNotAvailable)?,
                ),
            }
        } else {
            local_ip
        };
        udp::phtx_udp(&self.ph, data, src, local_port, address, port, None);
        Ok(data.len())
    }

    /// Receive up to `n` bytes from a TCP stream, or the next datagram's
    /// payload from a UDP socket. A TCP stream returns an empty vector at
    /// end of stream.
    pub fn recv(&self, n: usize) -> NetworkResult<Vec<u8>> {
        match self.protocol {
            SocketProtocol::Udp => self.recvfrom().map(|d| d.data),
            SocketProtocol::Tcp => {
                let session = {
                    let inner = self.inner.lock().unwrap();
                    if inner.closed {
                        return Err(NetworkError::Closed);
                    }
                    inner.tcp.clone().ok_or(NetworkError::NotConnected)?
                };
                loop {
                    match tcp::session_recv(&session, n)? {
                        Some((data, outs)) => {
                            tcp::transmit(&self.ph, &session.key, &outs, None);
                            return Ok(data);
                        }
                        None => {
                            if self.is_closed() || self.ph.shutdown.load(Ordering::SeqCst) {
                                return Err(NetworkError::Closed);
                            }
                            let cb = session.cb.lock().unwrap();
                            let _ = session.notify.wait_timeout(cb, WAIT_SLICE).unwrap();
                        }
                    }
                }
            }
        }
    }

    /// Receive the next datagram with its source address (UDP only).
    pub fn recvfrom(&self) -> NetworkResult<Datagram> {
        if self.protocol != SocketProtocol::Udp {
            return Err(NetworkError::NotSupported);
        }
        let endpoint = {
            let inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(NetworkError::Closed);
            }
            inner.udp.clone().ok_or(NetworkError::NotBound)?
        };
        loop {
            if let Some(datagram) = endpoint.take() {
                return Ok(datagram);
            }
            if endpoint.is_closed()
                || self.is_closed()
                || self.ph.shutdown.load(Ordering::SeqCst)
            {
                return Err(NetworkError::Closed);
            }
            let queue = endpoint.queue.lock().unwrap();
            let _ = endpoint.ready.wait_timeout(queue, WAIT_SLICE).unwrap();
        }
    }

    /// Close the socket. A TCP close starts the FIN sequence; the session
    /// finishes on its own timers.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(endpoint) = inner.udp.take() {
            endpoint.close();
            self.ph.sockets.unbind_udp(&endpoint.local);
        }
        if let Some(session) = inner.tcp.take() {
            if inner.listener {
                if let Some(local) = inner.local {
                    self.ph.sessions.remove_listen(&local);
                }
                session.notify.notify_all();
            } else {
                drop(inner);
                let outs = tcp::session_close(&session);
                tcp::transmit(&self.ph, &session.key, &outs, None);
                session.notify.notify_all();
                return;
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Local endpoint, if bound.
    pub fn local_endpoint(&self) -> Option<(IpAddress, u16)> {
        self.inner.lock().unwrap().local
    }

    /// Remote endpoint, if connected.
    pub fn remote_endpoint(&self) -> Option<(IpAddress, u16)> {
        self.inner.lock().unwrap().remote
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}
