use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use xnet::delta::{EntityState, EntityUpdate, MoveVars, UserCmd, read_delta_movevars};
use xnet::net::{MAX_PACKET_SIZE, is_out_of_band, svc};
use xnet::session::{
    MAX_BACKUP_COMMANDS, ServerData, read_packet_entities, read_spawn_baseline, reader, write_move,
    write_string_cmd,
};
use xnet::{
    BitBuffer, ConnectionState, DeltaRegistry, NetChannel, OutOfBand, PROTOCOL_VERSION,
    ProtocolError, Transport,
};

use crate::config::ClientConfig;

pub struct NetworkClient<T: Transport> {
    transport: T,
    server: SocketAddr,
    config: ClientConfig,
    state: ConnectionState,
    channel: Option<NetChannel>,
    registry: DeltaRegistry,
    client_id: Option<u32>,
    server_data: Option<ServerData>,
    signed_on: bool,
    movevars: MoveVars,
    baselines: HashMap<i32, EntityState>,
    entities: BTreeMap<i32, EntityState>,
    server_time: f32,
    server_chokes: u32,
    commands: VecDeque<UserCmd>,
    last_command_time: Option<Instant>,
    connect_sent: Option<Instant>,
    connect_attempts: u32,
    disconnect_reason: Option<String>,
}

impl<T: Transport> NetworkClient<T> {
    pub fn new(transport: T, server: SocketAddr, config: ClientConfig) -> Self {
        Self {
            transport,
            server,
            config,
            state: ConnectionState::Disconnected,
            channel: None,
            registry: DeltaRegistry::new(),
            client_id: None,
            server_data: None,
            signed_on: false,
            movevars: MoveVars::default(),
            baselines: HashMap::new(),
            entities: BTreeMap::new(),
            server_time: 0.0,
            server_chokes: 0,
            commands: VecDeque::new(),
            last_command_time: None,
            connect_sent: None,
            connect_attempts: 0,
            disconnect_reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_signed_on(&self) -> bool {
        self.signed_on
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn server_data(&self) -> Option<&ServerData> {
        self.server_data.as_ref()
    }

    pub fn registry(&self) -> &DeltaRegistry {
        &self.registry
    }

    pub fn movevars(&self) -> &MoveVars {
        &self.movevars
    }

    pub fn entity(&self, number: i32) -> Option<&EntityState> {
        self.entities.get(&number)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    pub fn server_time(&self) -> f32 {
        self.server_time
    }

    pub fn server_chokes(&self) -> u32 {
        self.server_chokes
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    pub fn channel(&self) -> Option<&NetChannel> {
        self.channel.as_ref()
    }

    pub fn connect(&mut self, now: Instant) -> Result<()> {
        log::info!("Connecting to {}", self.server);
        self.reset();
        self.state = ConnectionState::Connecting;
        self.send_connect(now)
    }

    fn send_connect(&mut self, now: Instant) -> Result<()> {
        let request = OutOfBand::Connect {
            protocol: PROTOCOL_VERSION,
            qport: self.config.qport,
        };
        self.transport.send_to(&request.encode(), self.server)?;
        self.connect_sent = Some(now);
        self.connect_attempts += 1;
        Ok(())
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.channel = None;
        self.registry = DeltaRegistry::new();
        self.client_id = None;
        self.server_data = None;
        self.signed_on = false;
        self.movevars = MoveVars::default();
        self.baselines.clear();
        self.entities.clear();
        self.server_time = 0.0;
        self.commands.clear();
        self.last_command_time = None;
        self.connect_sent = None;
        self.connect_attempts = 0;
        self.disconnect_reason = None;
    }

    /// Runs one client frame. `command` is sent once the client is in the
    /// game and the command interval has passed.
    pub fn update(&mut self, now: Instant, command: Option<UserCmd>) -> Result<()> {
        self.process_network(now)?;

        match self.state {
            ConnectionState::Connecting if self.channel.is_none() => self.retry_connect(now)?,
            ConnectionState::Connecting | ConnectionState::Connected => {
                let timeout = Duration::from_secs(self.config.timeout_secs);
                if self.channel.as_ref().is_some_and(|c| c.is_timed_out(now, timeout)) {
                    log::warn!("Server connection lost");
                    self.lose_connection("timed out".to_string());
                    return Ok(());
                }
                self.send_frame(now, command)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn retry_connect(&mut self, now: Instant) -> Result<()> {
        let retry = Duration::from_secs_f32(self.config.connect_retry_secs);
        if self
            .connect_sent
            .is_some_and(|sent| now.saturating_duration_since(sent) < retry)
        {
            return Ok(());
        }
        if self.connect_attempts >= self.config.connect_attempts {
            self.lose_connection("no answer from server".to_string());
            bail!("No answer from {} after {} attempts", self.server, self.connect_attempts);
        }
        log::debug!("Retrying connect to {}", self.server);
        self.send_connect(now)
    }

    fn send_frame(&mut self, now: Instant, command: Option<UserCmd>) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        if !channel.can_packet(now) {
            channel.note_choke();
            return Ok(());
        }

        let mut buf = BitBuffer::with_capacity(MAX_PACKET_SIZE);
        let due = self
            .last_command_time
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.command_interval());

        if self.signed_on && due {
            if let Some(command) = command {
                if self.commands.len() > MAX_BACKUP_COMMANDS {
                    self.commands.pop_front();
                }
                self.commands.push_back(command);
                self.last_command_time = Some(now);
                write_move(&mut buf, &self.registry, self.commands.make_contiguous())?;
            }
        }

        channel.transmit(&mut self.transport, buf.written(), now)?;
        Ok(())
    }

    /// Sends a disconnect command and forgets the session.
    pub fn disconnect(&mut self, now: Instant) -> Result<()> {
        if let Some(channel) = self.channel.as_mut() {
            write_string_cmd(channel.message(), "disconnect");
            channel.transmit(&mut self.transport, &[], now)?;
            log::info!("Disconnected from {}", self.server);
        }
        self.reset();
        Ok(())
    }

    fn lose_connection(&mut self, reason: String) {
        self.reset();
        self.disconnect_reason = Some(reason);
    }

    fn process_network(&mut self, now: Instant) -> Result<()> {
        for (data, addr) in self.transport.receive_all()? {
            if addr != self.server {
                log::debug!("Ignoring datagram from {addr}");
                continue;
            }

            if is_out_of_band(&data) {
                self.handle_out_of_band(&data, now);
                continue;
            }

            let Some(channel) = self.channel.as_mut() else {
                continue;
            };
            let received = match channel.process(&data, now) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Bad datagram from server: {e}");
                    self.lose_connection(e.to_string());
                    return Err(e.into());
                }
            };

            for payload in received.reliable.into_iter().chain([received.unreliable]) {
                if let Err(e) = self.parse_server_messages(payload) {
                    log::error!("Bad message from server: {e}");
                    self.lose_connection(e.to_string());
                    return Err(e.into());
                }
                if self.state == ConnectionState::Disconnected {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn handle_out_of_band(&mut self, data: &[u8], now: Instant) {
        match OutOfBand::parse(data) {
            Some(OutOfBand::Accept { client_id }) if self.state == ConnectionState::Connecting => {
                if self.channel.is_some() {
                    return;
                }
                log::info!("Accepted as client {client_id}");
                self.client_id = Some(client_id);
                self.channel = Some(NetChannel::new(self.server, self.config.channel_config(), now));
            }
            Some(OutOfBand::Reject { reason }) => {
                log::warn!("Connection rejected: {reason}");
                self.lose_connection(reason);
            }
            Some(other) => log::debug!("Ignoring connectionless '{}'", other.to_text()),
            None => {}
        }
    }

    fn parse_server_messages(&mut self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let mut buf = reader(payload);

        while buf.bits_left() >= 8 {
            match buf.read_byte() {
                svc::NOP => {}
                svc::DISCONNECT => {
                    let reason = buf.read_string();
                    log::info!("Server disconnected us: {reason}");
                    self.lose_connection(reason);
                    return Ok(());
                }
                svc::PRINT => log::info!("{}", buf.read_string()),
                svc::SERVERDATA => {
                    let data = ServerData::read(&mut buf)?;
                    if data.protocol != PROTOCOL_VERSION {
                        log::warn!("Server speaks protocol {}", data.protocol);
                    }
                    log::info!("Entering {} as client {}", data.level_name, data.client_id);
                    self.registry = DeltaRegistry::new();
                    self.baselines.clear();
                    self.entities.clear();
                    self.server_data = Some(data);
                }
                svc::DELTATABLE => {
                    if !self.registry.read_definition(&mut buf)? {
                        log::debug!("Ignoring table definition after sign-on");
                    }
                }
                svc::DELTAMOVEVARS => {
                    self.movevars = read_delta_movevars(&mut buf, &self.registry, &self.movevars)?;
                    log::debug!("Gravity {}", self.movevars.gravity);
                }
                svc::SPAWNBASELINE => {
                    let data = self.server_data.as_ref();
                    let baseline = read_spawn_baseline(&mut buf, &self.registry, |n| {
                        data.is_some_and(|d| d.is_player(n))
                    })?;
                    self.entities.insert(baseline.number, baseline.clone());
                    self.baselines.insert(baseline.number, baseline);
                }
                svc::SIGNONNUM => {
                    let stage = buf.read_byte();
                    self.registry.freeze();
                    self.signed_on = true;
                    self.state = ConnectionState::Connected;
                    log::info!(
                        "Signed on (stage {stage}), {} tables, {} baselines",
                        self.registry.initialised_count(),
                        self.baselines.len()
                    );
                }
                svc::TIME => self.server_time = buf.read_float(),
                svc::PACKETENTITIES => {
                    let data = self.server_data.as_ref();
                    let updates = read_packet_entities(
                        &mut buf,
                        &self.registry,
                        &self.baselines,
                        |n| data.is_some_and(|d| d.is_player(n)),
                        self.server_time,
                    )?;
                    self.apply_entities(updates);
                }
                svc::CHOKECOUNT => self.server_chokes += buf.read_byte() as u32,
                other => return Err(ProtocolError::UnknownMessage(other)),
            }
            if buf.is_overflowed() {
                return Err(ProtocolError::Overflow);
            }
        }
        Ok(())
    }

    /// The update lists every entity in the client's view. Entities it
    /// neither lists nor drops are gone.
    fn apply_entities(&mut self, updates: Vec<EntityUpdate>) {
        let mut next = BTreeMap::new();
        for update in updates {
            match update {
                EntityUpdate::Delta(state) => {
                    next.insert(state.number, state);
                }
                EntityUpdate::Dropped(number) => {
                    if let Some(state) = self.entities.remove(&number) {
                        next.insert(number, state);
                    }
                }
                EntityUpdate::Removed(number) => {
                    self.baselines.remove(&number);
                }
            }
        }
        self.entities = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use xnet::delta::write_delta_movevars;
    use xnet::session::{
        ClientMessage, EntityRecord, read_client_messages, write_packet_entities, write_spawn_baseline,
    };
    use xnet::{ChannelConfig, MemoryNetwork, MemoryTransport};

    fn local(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct FakeServer {
        net: MemoryTransport,
        channel: Option<NetChannel>,
        registry: DeltaRegistry,
    }

    impl FakeServer {
        /// Answers a connect and queues the sign-on stream.
        fn accept(&mut self, baseline: &EntityState, now: Instant) {
            let (data, from) = self.net.try_receive().unwrap().unwrap();
            let Some(OutOfBand::Connect { qport, .. }) = OutOfBand::parse(&data) else {
                panic!("expected connect");
            };
            self.net.send_to(&OutOfBand::Accept { client_id: 7 }.encode(), from).unwrap();

            let config = ChannelConfig {
                qport,
                ..Default::default()
            };
            let mut channel = NetChannel::new(from, config, now);
            let message = channel.message();
            ServerData {
                protocol: PROTOCOL_VERSION,
                client_id: 7,
                max_entities: 4096,
                max_clients: 4,
                level_name: "test".into(),
            }
            .write(message);
            self.registry.write_definitions(message);
            write_delta_movevars(message, &self.registry, &MoveVars::default(), &MoveVars::standard())
                .unwrap();
            write_spawn_baseline(message, &self.registry, baseline, false).unwrap();
            message.write_byte(svc::SIGNONNUM);
            message.write_byte(1);
            self.channel = Some(channel);
        }

        fn exchange(&mut self, unreliable: &[u8], now: Instant) -> Vec<ClientMessage> {
            let channel = self.channel.as_mut().unwrap();
            channel.transmit(&mut self.net, unreliable, now).unwrap();
            let mut messages = Vec::new();
            for (data, _) in self.net.receive_all().unwrap() {
                if let Some(received) = channel.process(&data, now).unwrap() {
                    for payload in received.reliable.into_iter().chain([received.unreliable]) {
                        messages.extend(read_client_messages(&mut reader(payload), &self.registry).unwrap());
                    }
                }
            }
            messages
        }
    }

    #[test]
    fn test_sign_on_entities_and_disconnect() {
        let network = MemoryNetwork::new();
        let mut server = FakeServer {
            net: network.bind(local(1)),
            channel: None,
            registry: DeltaRegistry::builtin().unwrap(),
        };
        let config = ClientConfig {
            qport: 99,
            ..Default::default()
        };
        let mut client = NetworkClient::new(network.bind(local(2)), local(1), config);

        let mut now = Instant::now();
        client.connect(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);

        let baseline = EntityState::new(10);
        server.accept(&baseline, now);

        let command = UserCmd {
            msec: 33,
            forwardmove: 200.0,
            ..Default::default()
        };
        let mut moves = Vec::new();
        for _ in 0..20 {
            now += Duration::from_millis(50);
            moves.extend(server.exchange(&[], now));
            client.update(now, Some(command.clone())).unwrap();
        }
        assert!(client.is_signed_on());
        assert_eq!(client.client_id(), Some(7));
        assert_eq!(client.movevars().gravity, 800.0);
        assert!(client.registry().is_frozen());
        assert!(client.entity(10).is_some());

        moves.extend(server.exchange(&[], now));
        assert!(moves.iter().any(|m| matches!(m, ClientMessage::Move(cmds) if cmds.last() == Some(&command))));

        let mut moved = baseline.clone();
        moved.origin = Vec3::new(50.0, 0.0, 10.0);
        let mut frame = BitBuffer::with_capacity(512);
        frame.write_byte(svc::TIME);
        frame.write_float(2.5);
        let records = vec![EntityRecord {
            baseline: &baseline,
            state: &moved,
            player: false,
        }];
        write_packet_entities(&mut frame, &server.registry, records.into_iter(), &[], 2.5).unwrap();

        now += Duration::from_millis(50);
        server.exchange(frame.written(), now);
        client.update(now, None).unwrap();
        assert_eq!(client.server_time(), 2.5);
        assert_eq!(client.entity(10).map(|e| e.origin), Some(moved.origin));

        client.disconnect(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let messages = server.exchange(&[], now);
        assert!(messages.contains(&ClientMessage::StringCmd("disconnect".into())));
    }

    #[test]
    fn test_rejected_connect() {
        let network = MemoryNetwork::new();
        let mut server_net = network.bind(local(1));
        let mut client = NetworkClient::new(network.bind(local(2)), local(1), ClientConfig::default());

        let now = Instant::now();
        client.connect(now).unwrap();
        let (_, from) = server_net.try_receive().unwrap().unwrap();
        let reject = OutOfBand::Reject {
            reason: "server is full".into(),
        };
        server_net.send_to(&reject.encode(), from).unwrap();

        client.update(now, None).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.disconnect_reason(), Some("server is full"));
    }

    #[test]
    fn test_connect_gives_up() {
        let network = MemoryNetwork::new();
        let config = ClientConfig {
            connect_attempts: 2,
            ..Default::default()
        };
        let mut client = NetworkClient::new(network.bind(local(2)), local(1), config);

        let mut now = Instant::now();
        client.connect(now).unwrap();
        now += Duration::from_secs(2);
        client.update(now, None).unwrap();
        now += Duration::from_secs(2);
        assert!(client.update(now, None).is_err());
        assert_eq!(client.disconnect_reason(), Some("no answer from server"));
    }
}
