use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;

use xnet::delta::{MoveVars, write_delta_movevars};
use xnet::net::protocol::MAX_EDICTS;
use xnet::net::{FlowDirection, MAX_PACKET_SIZE, is_out_of_band, svc};
use xnet::session::{
    ClientMessage, EntityRecord, ServerData, read_client_messages, reader, write_packet_entities,
    write_spawn_baseline,
};
use xnet::{
    BitBuffer, ConnectionManager, ConnectionState, DeltaRegistry, LossyTransport, NetworkEndpoint,
    NetworkStats, OutOfBand, PROTOCOL_VERSION, ProtocolError, Received, Transport,
};

use crate::config::ServerConfig;
use crate::encoders::register_game_encoders;
use crate::events::{DisconnectReason, ServerEvent};
use crate::simulation::World;

const LEVEL_NAME: &str = "arena";
const LOW_GRAVITY: f32 = 400.0;

/// Per-client game state kept next to the connection.
struct Player {
    entity: i32,
    /// Baselines the client is known to hold.
    known: HashSet<i32>,
    /// Baselines queued on the reliable stream but not yet acknowledged.
    pending: HashSet<i32>,
    last_drop_count: u32,
}

pub struct GameServer {
    transport: LossyTransport<NetworkEndpoint>,
    connections: ConnectionManager,
    players: HashMap<u32, Player>,
    registry: DeltaRegistry,
    config: ServerConfig,
    world: World,
    movevars_sent: MoveVars,
    tick: u32,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    start_time: Instant,
    pending_events: VecDeque<ServerEvent>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;
        let running = endpoint.running();
        let simulation = config.global_packet_loss.clone().unwrap_or_default();

        let mut registry = match &config.delta_path {
            Some(path) => DeltaRegistry::load(path)?,
            None => DeltaRegistry::builtin()?,
        };
        register_game_encoders(&mut registry);

        let world = World::new(config.max_clients, config.prop_count);
        let movevars_sent = world.movevars().clone();
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);

        Ok(Self {
            transport: LossyTransport::new(endpoint, simulation),
            connections: ConnectionManager::with_timeout(config.max_clients, config.timeout_secs),
            players: HashMap::new(),
            registry,
            world,
            movevars_sent,
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running,
            start_time: Instant::now(),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.pending_events.drain(..) {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn shutdown_connections(&mut self) {
        let client_ids: Vec<u32> = self.connections.iter().map(|c| c.client_id).collect();
        for client_id in client_ids {
            self.drop_client(client_id, DisconnectReason::Shutdown, Instant::now());
        }
    }

    pub fn kick_client(&mut self, client_id: u32) {
        self.drop_client(client_id, DisconnectReason::Kicked, Instant::now());
    }

    /// Switches between normal and low gravity. The change reaches clients
    /// as a movevars delta on the next tick.
    pub fn toggle_gravity(&mut self) -> f32 {
        let standard = MoveVars::standard().gravity;
        let movevars = self.world.movevars_mut();
        movevars.gravity = if movevars.gravity == standard {
            LOW_GRAVITY
        } else {
            standard
        };
        movevars.gravity
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        self.process_network(now);

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        let dt = self.tick_duration.as_secs_f32();
        self.world.simulate(dt);
        self.tick = self.tick.wrapping_add(1);

        self.send_movevars();
        self.update_sign_on();
        self.enforce_limits(now);

        let mut removed = self.world.take_removed();
        // A slot taken again this tick is covered by its new baseline.
        removed.retain(|number| self.world.baseline(*number).is_none());
        for player in self.players.values_mut() {
            for number in &removed {
                player.known.remove(number);
                player.pending.remove(number);
            }
        }

        let client_ids: Vec<u32> = self.connections.iter().map(|c| c.client_id).collect();
        for client_id in client_ids {
            self.send_frame(client_id, &removed, now);
        }
    }

    fn send_movevars(&mut self) {
        if self.world.movevars() == &self.movevars_sent {
            return;
        }

        for client in self.connections.iter_mut() {
            let message = client.channel.message();
            if let Err(e) =
                write_delta_movevars(message, &self.registry, &self.movevars_sent, self.world.movevars())
            {
                log::error!("Client {}: movevars not sent: {e}", client.client_id);
            }
        }
        log::info!("Gravity is now {}", self.world.movevars().gravity);
        self.movevars_sent = self.world.movevars().clone();
    }

    /// Promotes baselines the client acknowledged and finishes sign-on once
    /// its reliable stream is drained.
    fn update_sign_on(&mut self) {
        for client in self.connections.iter_mut() {
            if client.channel.has_pending_reliable() {
                continue;
            }
            let Some(player) = self.players.get_mut(&client.client_id) else {
                continue;
            };
            player.known.extend(player.pending.drain());

            if client.state == ConnectionState::Connecting {
                client.state = ConnectionState::Connected;
                self.pending_events.push_back(ServerEvent::ClientConnected {
                    client_id: client.client_id,
                    addr: client.addr(),
                    entity: player.entity,
                });
            }
        }
    }

    fn enforce_limits(&mut self, now: Instant) {
        let timeout = self.connections.timeout();
        let mut doomed = Vec::new();
        for client in self.connections.iter() {
            if client.is_timed_out(now, timeout) {
                doomed.push((client.client_id, DisconnectReason::Timeout));
            } else if self
                .config
                .drop_limit
                .is_some_and(|limit| client.channel.drop_count() > limit)
            {
                doomed.push((client.client_id, DisconnectReason::TooManyDrops));
            }
        }

        for (client_id, reason) in doomed {
            self.drop_client(client_id, reason, now);
        }
    }

    fn send_frame(&mut self, client_id: u32, removed: &[i32], now: Instant) {
        let Some(client) = self.connections.get_mut(client_id) else {
            return;
        };
        if !client.channel.can_packet(now) {
            client.channel.note_choke();
            return;
        }

        let mut buf = BitBuffer::with_capacity(MAX_PACKET_SIZE);
        if client.state == ConnectionState::Connected {
            if let Some(player) = self.players.get(&client_id) {
                buf.write_byte(svc::TIME);
                buf.write_float(self.world.time());

                let world = &self.world;
                let records: Vec<EntityRecord<'_>> = world
                    .entities()
                    .filter(|e| player.known.contains(&e.number))
                    .filter_map(|e| {
                        Some(EntityRecord {
                            baseline: world.baseline(e.number)?,
                            state: e,
                            player: world.is_player(e.number),
                        })
                    })
                    .collect();

                let start = buf.bits_written();
                if let Err(e) =
                    write_packet_entities(&mut buf, &self.registry, records.into_iter(), removed, world.time())
                {
                    log::error!("Client {client_id}: entity update not written: {e}");
                    buf.seek_to_bit(start);
                }
            }

            let chokes = client.channel.take_choke_count();
            if chokes > 0 {
                buf.write_byte(svc::CHOKECOUNT);
                buf.write_byte(chokes.min(u8::MAX as u32) as u8);
            }
        }

        if let Err(e) = client.channel.transmit(&mut self.transport, buf.written(), now) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Failed to send to client {client_id}: {e}"),
            });
        }
    }

    fn process_network(&mut self, now: Instant) {
        let datagrams = match self.transport.receive_all() {
            Ok(datagrams) => datagrams,
            Err(e) => {
                self.pending_events.push_back(ServerEvent::Error {
                    message: format!("Network error: {e}"),
                });
                return;
            }
        };

        for (data, addr) in datagrams {
            if is_out_of_band(&data) {
                self.handle_out_of_band(&data, addr, now);
                continue;
            }

            let Some(client_id) = self.connections.route(addr, &data) else {
                log::debug!("Sequenced datagram from unknown host {addr}");
                continue;
            };
            let Some(client) = self.connections.get_mut(client_id) else {
                continue;
            };

            match client.channel.process(&data, now) {
                Ok(Some(received)) => {
                    if let Err(e) = self.handle_received(client_id, received) {
                        log::error!("Client {client_id}: {e}");
                        self.drop_client(client_id, DisconnectReason::ProtocolError, now);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Client {client_id}: {e}");
                    self.drop_client(client_id, DisconnectReason::ProtocolError, now);
                }
            }
        }
    }

    fn handle_received(&mut self, client_id: u32, received: Received) -> Result<(), ProtocolError> {
        let mut messages = Vec::new();
        for payload in received.reliable.into_iter().chain([received.unreliable]) {
            messages.extend(read_client_messages(&mut reader(payload), &self.registry)?);
        }

        for message in messages {
            match message {
                ClientMessage::Move(commands) => self.handle_move(client_id, &commands),
                ClientMessage::StringCmd(command) => {
                    if command == "disconnect" {
                        self.drop_client(client_id, DisconnectReason::Graceful, Instant::now());
                        return Ok(());
                    }
                    log::debug!("Client {client_id}: ignoring command '{command}'");
                }
            }
        }
        Ok(())
    }

    /// Runs the newest command plus the backups covering datagrams lost
    /// since the last move.
    fn handle_move(&mut self, client_id: u32, commands: &[xnet::delta::UserCmd]) {
        let Some(client) = self.connections.get(client_id) else {
            return;
        };
        if client.state != ConnectionState::Connected || commands.is_empty() {
            return;
        }
        let Some(player) = self.players.get_mut(&client_id) else {
            return;
        };

        let drop_count = client.channel.drop_count();
        let lost = drop_count.saturating_sub(player.last_drop_count) as usize;
        player.last_drop_count = drop_count;

        let run = (lost.min(commands.len() - 1)) + 1;
        let entity = player.entity;
        for cmd in &commands[commands.len() - run..] {
            self.world.apply_usercmd(entity, cmd);
        }
    }

    fn handle_out_of_band(&mut self, data: &[u8], addr: SocketAddr, now: Instant) {
        let Some(message) = OutOfBand::parse(data) else {
            return;
        };

        match message {
            OutOfBand::Connect { protocol, qport } => self.handle_connect(addr, protocol, qport, now),
            OutOfBand::Info => {
                let text = format!(
                    "{LEVEL_NAME} {}/{} protocol {PROTOCOL_VERSION}",
                    self.connections.connected_count(),
                    self.config.max_clients
                );
                self.send_out_of_band(&OutOfBand::InfoResponse { text }, addr);
            }
            OutOfBand::Disconnect => {
                if let Some(client_id) = self.connections.get_by_addr(&addr).map(|c| c.client_id) {
                    self.drop_client(client_id, DisconnectReason::Graceful, now);
                }
            }
            other => log::debug!("Ignoring connectionless '{}' from {addr}", other.to_text()),
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, protocol: u32, qport: u16, now: Instant) {
        self.pending_events
            .push_back(ServerEvent::ClientConnecting { addr });

        let channel_config = self.config.channel_config(qport);
        let client_id = match self.connections.accept(addr, protocol, channel_config, now) {
            Ok(client) => client.client_id,
            Err(e) => {
                self.deny(addr, e.to_string());
                return;
            }
        };
        self.forget_replaced_players();

        let Some(entity) = self.world.spawn_player() else {
            self.connections.remove(client_id);
            self.deny(addr, "no free player slot".to_string());
            return;
        };

        self.send_out_of_band(&OutOfBand::Accept { client_id }, addr);

        if let Err(e) = self.queue_sign_on(client_id, entity) {
            log::error!("Client {client_id}: sign-on failed: {e}");
            self.drop_client(client_id, DisconnectReason::ProtocolError, now);
            return;
        }
        self.announce_baseline(client_id, entity);
        log::debug!("Client {client_id} accepted from {addr} as entity {entity}");
    }

    fn deny(&mut self, addr: SocketAddr, reason: String) {
        self.send_out_of_band(&OutOfBand::Reject { reason: reason.clone() }, addr);
        self.pending_events
            .push_back(ServerEvent::ConnectionDenied { addr, reason });
    }

    /// A reconnect replaces the old connection inside the manager. Its
    /// player entity goes with it.
    fn forget_replaced_players(&mut self) {
        let stale: Vec<u32> = self
            .players
            .keys()
            .copied()
            .filter(|id| self.connections.get(*id).is_none())
            .collect();
        for client_id in stale {
            if let Some(player) = self.players.remove(&client_id) {
                self.world.despawn(player.entity);
            }
            self.pending_events.push_back(ServerEvent::ClientDisconnected {
                client_id,
                reason: DisconnectReason::Graceful,
            });
        }
    }

    fn queue_sign_on(&mut self, client_id: u32, entity: i32) -> Result<(), ProtocolError> {
        let Some(client) = self.connections.get_mut(client_id) else {
            return Ok(());
        };
        let message = client.channel.message();

        ServerData {
            protocol: PROTOCOL_VERSION,
            client_id,
            max_entities: MAX_EDICTS as u16,
            max_clients: self.config.max_clients.min(u8::MAX as usize) as u8,
            level_name: LEVEL_NAME.to_string(),
        }
        .write(message);

        let definitions = self.registry.write_definitions(message);
        write_delta_movevars(message, &self.registry, &MoveVars::default(), self.world.movevars())?;

        let mut pending = HashSet::new();
        for baseline in self.world.baselines() {
            write_spawn_baseline(message, &self.registry, baseline, self.world.is_player(baseline.number))?;
            pending.insert(baseline.number);
        }

        message.write_byte(svc::SIGNONNUM);
        message.write_byte(1);
        if message.is_overflowed() {
            return Err(ProtocolError::Overflow);
        }

        log::debug!(
            "Client {client_id}: sign-on queued, {definitions} field definitions, {} baselines, {} bytes",
            pending.len(),
            message.bytes_written()
        );
        self.players.insert(
            client_id,
            Player {
                entity,
                known: HashSet::new(),
                pending,
                last_drop_count: 0,
            },
        );
        Ok(())
    }

    /// Sends the new player's baseline to everyone already in the game.
    fn announce_baseline(&mut self, client_id: u32, entity: i32) {
        let Some(baseline) = self.world.baseline(entity) else {
            return;
        };

        for client in self.connections.iter_mut() {
            if client.client_id == client_id {
                continue;
            }
            let Some(player) = self.players.get_mut(&client.client_id) else {
                continue;
            };
            match write_spawn_baseline(client.channel.message(), &self.registry, baseline, true) {
                Ok(()) => {
                    player.known.remove(&entity);
                    player.pending.insert(entity);
                }
                Err(e) => log::error!("Client {}: baseline not sent: {e}", client.client_id),
            }
        }
    }

    /// Tells the client why it is leaving, then forgets it.
    fn drop_client(&mut self, client_id: u32, reason: DisconnectReason, now: Instant) {
        if let Some(client) = self.connections.get_mut(client_id) {
            let mut buf = BitBuffer::with_capacity(64);
            buf.write_byte(svc::DISCONNECT);
            buf.write_string(reason.as_str());
            client.channel.clear_pending();
            if let Err(e) = client.channel.transmit(&mut self.transport, buf.written(), now) {
                log::debug!("Client {client_id}: disconnect not sent: {e}");
            }
        }

        if self.connections.remove(client_id).is_none() {
            return;
        }
        if let Some(player) = self.players.remove(&client_id) {
            self.world.despawn(player.entity);
        }
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { client_id, reason });
    }

    fn send_out_of_band(&mut self, message: &OutOfBand, addr: SocketAddr) {
        if let Err(e) = self.transport.send_to(&message.encode(), addr) {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("Failed to send to {addr}: {e}"),
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        let mut network_stats = NetworkStats::default();
        for client in self.connections.iter() {
            network_stats.merge(&client.channel.stats());
        }

        ServerStats {
            tick: self.tick,
            uptime_secs: self.start_time.elapsed().as_secs(),
            client_count: self.connections.connected_count(),
            max_clients: self.config.max_clients,
            entity_count: self.world.entity_count(),
            gravity: self.world.movevars().gravity,
            simulated_drops: self.transport.dropped(),
            network_stats,
        }
    }

    pub fn client_infos(&self) -> Vec<crate::tui::ClientInfo> {
        let now = Instant::now();
        let mut infos: Vec<_> = self
            .connections
            .iter()
            .map(|c| {
                let stats = c.channel.stats();
                crate::tui::ClientInfo {
                    client_id: c.client_id,
                    addr: c.addr().to_string(),
                    entity: self.players.get(&c.client_id).map(|p| p.entity),
                    state: c.state,
                    connected_secs: now.saturating_duration_since(c.channel.connect_time()).as_secs(),
                    rtt_ms: stats.rtt_ms,
                    drop_count: c.channel.drop_count(),
                    chokes: stats.chokes,
                    kbytes_out: c.channel.flow(FlowDirection::Outgoing).avg_kbytes_per_sec(),
                    kbytes_in: c.channel.flow(FlowDirection::Incoming).avg_kbytes_per_sec(),
                }
            })
            .collect();
        infos.sort_by_key(|c| c.client_id);
        infos
    }
}

pub fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => log::info!("Connection request from {addr}"),
        ServerEvent::ClientConnected {
            client_id,
            addr,
            entity,
        } => log::info!("Client {client_id} connected from {addr} (entity {entity})"),
        ServerEvent::ClientDisconnected { client_id, reason } => {
            log::info!("Client {client_id} {}", reason.as_str())
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("Connection denied to {addr}: {reason}")
        }
        ServerEvent::Error { message } => log::error!("{message}"),
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u32,
    pub uptime_secs: u64,
    pub client_count: usize,
    pub max_clients: usize,
    pub entity_count: usize,
    pub gravity: f32,
    pub simulated_drops: u64,
    pub network_stats: NetworkStats,
}
