use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Largest datagram a transport will hand back.
pub const MAX_DATAGRAM: usize = 65_536;

/// Unreliable datagram delivery. Sends never block and receives return
/// `Ok(None)` once nothing is waiting.
pub trait Transport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn try_receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;

    /// Drains everything currently waiting.
    fn receive_all(&mut self) -> io::Result<Vec<(Vec<u8>, SocketAddr)>> {
        let mut datagrams = Vec::new();
        while let Some(datagram) = self.try_receive()? {
            datagrams.push(datagram);
        }
        Ok(datagrams)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        (**self).send_to(data, addr)
    }

    fn try_receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        (**self).try_receive()
    }

    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }
}

/// Non-blocking UDP socket.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Vec<u8>,
    running: Arc<AtomicBool>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: vec![0u8; MAX_DATAGRAM],
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Transport for NetworkEndpoint {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            // A full send buffer is indistinguishable from loss.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn try_receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => return Ok(Some((self.recv_buffer[..size].to_vec(), addr))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable from an earlier send on some hosts.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type Inboxes = HashMap<SocketAddr, VecDeque<(Vec<u8>, SocketAddr)>>;

/// In-process datagram network for loopback play and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<Inboxes>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inboxes> {
        self.inboxes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attaches a new endpoint at `addr`, replacing any earlier one.
    pub fn bind(&self, addr: SocketAddr) -> MemoryTransport {
        self.lock().insert(addr, VecDeque::new());
        MemoryTransport {
            network: self.clone(),
            local_addr: addr,
        }
    }

    /// Datagrams waiting for `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().get(&addr).map_or(0, VecDeque::len)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        // Nobody bound there: the datagram vanishes like it would on UDP.
        if let Some(inbox) = self.network.lock().get_mut(&addr) {
            inbox.push_back((data.to_vec(), self.local_addr));
        }
        Ok(data.len())
    }

    fn try_receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        Ok(self
            .network
            .lock()
            .get_mut(&self.local_addr)
            .and_then(VecDeque::pop_front))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }

    pub fn delay(&self) -> Duration {
        if !self.enabled || self.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand_percent() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        Duration::from_millis((base + (rand_percent() * range as f32) as u32 + jitter) as u64)
    }
}

fn rand_percent() -> f32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos()),
    );
    (hasher.finish() % 10000) as f32 / 10000.0
}

/// Wraps a transport with simulated loss and latency on the sending side.
pub struct LossyTransport<T> {
    inner: T,
    simulation: PacketLossSimulation,
    delayed: VecDeque<(Instant, Vec<u8>, SocketAddr)>,
    drop_next: usize,
    dropped: u64,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, simulation: PacketLossSimulation) -> Self {
        Self {
            inner,
            simulation,
            delayed: VecDeque::new(),
            drop_next: 0,
            dropped: 0,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn simulation_mut(&mut self) -> &mut PacketLossSimulation {
        &mut self.simulation
    }

    /// Discards the next `count` sends regardless of the simulation.
    pub fn drop_next(&mut self, count: usize) {
        self.drop_next += count;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn flush_due(&mut self) -> io::Result<()> {
        let now = Instant::now();
        while self.delayed.front().is_some_and(|(due, _, _)| *due <= now) {
            if let Some((_, data, addr)) = self.delayed.pop_front() {
                self.inner.send_to(&data, addr)?;
            }
        }
        Ok(())
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.flush_due()?;

        if self.drop_next > 0 || self.simulation.should_drop() {
            self.drop_next = self.drop_next.saturating_sub(1);
            self.dropped += 1;
            log::trace!("Simulated loss of {} bytes to {addr}", data.len());
            return Ok(data.len());
        }

        let delay = self.simulation.delay();
        if delay.is_zero() {
            return self.inner.send_to(data, addr);
        }

        let due = Instant::now() + delay;
        let at = self.delayed.partition_point(|(d, _, _)| *d <= due);
        self.delayed.insert(at, (due, data.to_vec(), addr));
        Ok(data.len())
    }

    fn try_receive(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        self.flush_due()?;
        self.inner.try_receive()
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}
