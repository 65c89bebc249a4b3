use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::channel::{ChannelConfig, NetChannel};
use super::protocol::{PROTOCOL_VERSION, PacketHeader};
use crate::error::ConnectError;

const DEFAULT_TIMEOUT_SECS: u64 = 65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Accepted, still receiving the sign-on data.
    Connecting,
    Connected,
    Disconnecting,
}

pub struct ClientConnection {
    pub client_id: u32,
    pub state: ConnectionState,
    pub channel: NetChannel,
}

impl ClientConnection {
    pub fn new(client_id: u32, addr: SocketAddr, config: ChannelConfig, now: Instant) -> Self {
        Self {
            client_id,
            state: ConnectionState::Connecting,
            channel: NetChannel::new(addr, config, now),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.channel.remote()
    }

    pub fn qport(&self) -> u16 {
        self.channel.qport()
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.channel.is_timed_out(now, timeout)
    }
}

/// Clients keyed by id, routed by address with the qport as a fallback for
/// clients whose port was remapped by a NAT.
pub struct ConnectionManager {
    clients_by_addr: HashMap<SocketAddr, u32>,
    clients: HashMap<u32, ClientConnection>,
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(max_clients: usize, timeout_secs: u64) -> Self {
        Self {
            clients_by_addr: HashMap::new(),
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Handles a `connect` request. A client reconnecting from the same
    /// host with the same qport replaces its old slot.
    pub fn accept(
        &mut self,
        addr: SocketAddr,
        protocol: u32,
        config: ChannelConfig,
        now: Instant,
    ) -> Result<&mut ClientConnection, ConnectError> {
        if protocol != PROTOCOL_VERSION {
            return Err(ConnectError::BadProtocol(protocol));
        }

        if let Some(old) = self.find_by_qport(addr, config.qport) {
            log::info!("Client {old} reconnecting from {addr}");
            self.remove(old);
        }

        if self.clients.len() >= self.max_clients {
            return Err(ConnectError::ServerFull);
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        self.clients_by_addr.insert(addr, client_id);
        let connection = self
            .clients
            .entry(client_id)
            .or_insert_with(|| ClientConnection::new(client_id, addr, config, now));
        Ok(connection)
    }

    fn find_by_qport(&self, addr: SocketAddr, qport: u16) -> Option<u32> {
        self.clients
            .values()
            .find(|c| c.addr().ip() == addr.ip() && c.qport() == qport)
            .map(|c| c.client_id)
    }

    /// Finds the client a sequenced datagram belongs to. A known host
    /// arriving from a new port is matched by qport and its channel
    /// follows the new address.
    pub fn route(&mut self, addr: SocketAddr, data: &[u8]) -> Option<u32> {
        if let Some(&id) = self.clients_by_addr.get(&addr) {
            return Some(id);
        }

        let qport = PacketHeader::peek_qport(data)?;
        let id = self.find_by_qport(addr, qport)?;
        let connection = self.clients.get_mut(&id)?;
        self.clients_by_addr.remove(&connection.addr());
        connection.channel.set_remote(addr);
        self.clients_by_addr.insert(addr, id);
        Some(id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&ClientConnection> {
        self.clients_by_addr
            .get(addr)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientConnection> {
        if let Some(&id) = self.clients_by_addr.get(addr) {
            self.clients.get_mut(&id)
        } else {
            None
        }
    }

    pub fn get(&self, client_id: u32) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: u32) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&client_id)
    }

    pub fn remove(&mut self, client_id: u32) -> Option<ClientConnection> {
        let connection = self.clients.remove(&client_id)?;
        self.clients_by_addr.remove(&connection.addr());
        Some(connection)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.clients.values_mut()
    }

    pub fn cleanup_timed_out(&mut self, now: Instant) -> Vec<u32> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(now, self.timeout))
            .map(|(&id, _)| id)
            .collect();

        for id in &timed_out {
            self.remove(*id);
        }

        timed_out
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn config(qport: u16) -> ChannelConfig {
        ChannelConfig {
            qport,
            ..Default::default()
        }
    }

    fn datagram_with_qport(qport: u16) -> Vec<u8> {
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&qport.to_le_bytes());
        data
    }

    #[test]
    fn test_accept_and_full() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(2);
        let id = manager.accept(addr(1000), PROTOCOL_VERSION, config(1), now).unwrap().client_id;
        assert_eq!(id, 1);
        manager.accept(addr(1001), PROTOCOL_VERSION, config(2), now).unwrap();

        assert!(matches!(
            manager.accept(addr(1002), PROTOCOL_VERSION, config(3), now),
            Err(ConnectError::ServerFull)
        ));
        assert!(matches!(
            manager.accept(addr(1003), 47, config(4), now),
            Err(ConnectError::BadProtocol(47))
        ));
        assert_eq!(manager.total_count(), 2);
        assert_eq!(manager.connected_count(), 0);
    }

    #[test]
    fn test_reconnect_replaces_slot() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(1);
        manager.accept(addr(1000), PROTOCOL_VERSION, config(7), now).unwrap();
        let id = manager.accept(addr(1000), PROTOCOL_VERSION, config(7), now).unwrap().client_id;
        assert_eq!(id, 2);
        assert_eq!(manager.total_count(), 1);
        assert!(manager.get(1).is_none());
    }

    #[test]
    fn test_route_follows_port_change() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(4);
        manager.accept(addr(1000), PROTOCOL_VERSION, config(55), now).unwrap();

        assert_eq!(manager.route(addr(1000), &[]), Some(1));
        assert_eq!(manager.route(addr(2000), &datagram_with_qport(55)), Some(1));
        assert_eq!(manager.get(1).unwrap().addr(), addr(2000));
        assert!(manager.get_by_addr(&addr(1000)).is_none());

        assert_eq!(manager.route(addr(3000), &datagram_with_qport(56)), None);
        let other_host = SocketAddr::from(([10, 0, 0, 2], 4000));
        assert_eq!(manager.route(other_host, &datagram_with_qport(55)), None);
    }

    #[test]
    fn test_cleanup_timed_out() {
        let now = Instant::now();
        let mut manager = ConnectionManager::with_timeout(4, 10);
        manager.accept(addr(1000), PROTOCOL_VERSION, config(1), now).unwrap();
        assert!(manager.cleanup_timed_out(now + Duration::from_secs(5)).is_empty());
        assert_eq!(manager.cleanup_timed_out(now + Duration::from_secs(11)), vec![1]);
        assert_eq!(manager.total_count(), 0);
    }
}
