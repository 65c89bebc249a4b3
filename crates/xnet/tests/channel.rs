use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use xnet::{
    ChannelConfig, ConnectionManager, ConnectionState, LossyTransport, MemoryNetwork,
    NetChannel, NetworkEndpoint, OutOfBand, PROTOCOL_VERSION, PacketLossSimulation, Received,
    Transport,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn wait_for_packet(endpoint: &mut NetworkEndpoint, timeout_ms: u64) -> Option<(Vec<u8>, SocketAddr)> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if let Some(datagram) = endpoint.try_receive().unwrap() {
            return Some(datagram);
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

fn deliver<T: Transport>(channel: &mut NetChannel, transport: &mut T, now: Instant) -> Vec<Received> {
    let mut received = Vec::new();
    for (data, _) in transport.receive_all().unwrap() {
        if let Some(r) = channel.process(&data, now).unwrap() {
            received.push(r);
        }
    }
    received
}

#[test]
fn test_udp_reliable_and_unreliable() {
    let port = next_port();
    let mut server_endpoint = NetworkEndpoint::bind(local(port)).unwrap();
    let mut client_endpoint = NetworkEndpoint::bind(local(port + 1)).unwrap();

    let now = Instant::now();
    let mut client = NetChannel::new(local(port), ChannelConfig::default(), now);
    let mut server = NetChannel::new(local(port + 1), ChannelConfig::default(), now);

    client.queue_reliable(b"name player");
    client.transmit(&mut client_endpoint, b"move", now).unwrap();

    let (data, from) = wait_for_packet(&mut server_endpoint, 500).expect("No packet received");
    assert_eq!(from, local(port + 1));
    let received = server.process(&data, now).unwrap().unwrap();
    assert_eq!(received.reliable.as_deref(), Some(&b"name player"[..]));
    assert_eq!(received.unreliable, b"move");

    server.transmit(&mut server_endpoint, b"snapshot", now).unwrap();
    let (data, _) = wait_for_packet(&mut client_endpoint, 500).expect("No packet received");
    let received = client.process(&data, now).unwrap().unwrap();
    assert_eq!(received.unreliable, b"snapshot");
    assert!(!client.is_awaiting_ack());
}

#[test]
fn test_fragment_chain_resends_lost_piece() {
    let a_addr = local(1);
    let b_addr = local(2);
    let network = MemoryNetwork::new();
    let mut a_net = LossyTransport::new(network.bind(a_addr), PacketLossSimulation::default());
    let mut b_net = network.bind(b_addr);

    let config = ChannelConfig {
        resend_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let mut now = Instant::now();
    let mut a = NetChannel::new(b_addr, config.clone(), now);
    let mut b = NetChannel::new(a_addr, config, now);

    let payload: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
    assert!(a.queue_reliable(&payload));

    for _ in 0..2 {
        now += Duration::from_millis(10);
        a.transmit(&mut a_net, b"", now).unwrap();
        let received = deliver(&mut b, &mut b_net, now);
        assert_eq!(received.len(), 1);
        assert!(received[0].reliable.is_none());

        b.transmit(&mut b_net, b"", now).unwrap();
        deliver(&mut a, &mut a_net, now);
    }
    assert_eq!(a.pending_fragments(), 1);
    assert!(!a.is_awaiting_ack());

    // The third piece never arrives.
    a_net.drop_next(1);
    now += Duration::from_millis(10);
    a.transmit(&mut a_net, b"", now).unwrap();
    assert_eq!(network.pending(b_addr), 0);
    assert!(a.is_awaiting_ack());

    now += Duration::from_millis(10);
    a.transmit(&mut a_net, b"tick", now).unwrap();
    let received = deliver(&mut b, &mut b_net, now);
    assert_eq!(received[0].unreliable, b"tick");
    assert!(received[0].reliable.is_none());
    assert_eq!(b.drop_count(), 1);

    b.transmit(&mut b_net, b"", now).unwrap();
    deliver(&mut a, &mut a_net, now);
    assert!(a.is_awaiting_ack());

    now += Duration::from_millis(10);
    a.transmit(&mut a_net, b"", now).unwrap();
    let received = deliver(&mut b, &mut b_net, now);
    assert_eq!(received[0].reliable.as_deref(), Some(payload.as_slice()));
    assert_eq!(a.stats().reliable_resends, 1);
    assert_eq!(b.stats().fragments_received, 3);

    b.transmit(&mut b_net, b"", now).unwrap();
    deliver(&mut a, &mut a_net, now);
    assert!(!a.has_pending_reliable());
}

#[test]
fn test_duplicate_datagram_is_dropped() {
    let network = MemoryNetwork::new();
    let mut a_net = network.bind(local(1));
    let mut b_net = network.bind(local(2));
    let now = Instant::now();
    let mut a = NetChannel::new(local(2), ChannelConfig::default(), now);
    let mut b = NetChannel::new(local(1), ChannelConfig::default(), now);

    a.queue_reliable(b"once");
    a.transmit(&mut a_net, b"", now).unwrap();
    let (data, _) = b_net.try_receive().unwrap().unwrap();

    let first = b.process(&data, now).unwrap().unwrap();
    assert_eq!(first.reliable.as_deref(), Some(&b"once"[..]));
    assert_eq!(b.process(&data, now).unwrap(), None);
    assert_eq!(b.stats().duplicates, 1);
    assert_eq!(b.good_count(), 1);
}

#[test]
fn test_reliable_stream_survives_loss() {
    let network = MemoryNetwork::new();
    let loss = PacketLossSimulation {
        enabled: true,
        loss_percent: 30.0,
        ..Default::default()
    };
    let mut a_net = LossyTransport::new(network.bind(local(1)), loss.clone());
    let mut b_net = LossyTransport::new(network.bind(local(2)), loss);

    let config = ChannelConfig {
        resend_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let mut now = Instant::now();
    let mut a = NetChannel::new(local(2), config.clone(), now);
    let mut b = NetChannel::new(local(1), config, now);

    let mut expected = Vec::new();
    let mut streamed = Vec::new();
    for tick in 0..2000u32 {
        if tick < 40 {
            let message = [tick as u8; 5];
            assert!(a.queue_reliable(&message));
            expected.extend_from_slice(&message);
        }
        now += Duration::from_millis(10);

        a.transmit(&mut a_net, b"", now).unwrap();
        for received in deliver(&mut b, &mut b_net, now) {
            if let Some(reliable) = received.reliable {
                streamed.extend(reliable);
            }
        }
        b.transmit(&mut b_net, b"", now).unwrap();
        deliver(&mut a, &mut a_net, now);

        if tick >= 40 && streamed.len() == expected.len() {
            break;
        }
    }
    assert_eq!(streamed, expected);
}

#[test]
fn test_out_of_band_connect_then_channel() {
    let port = next_port();
    let mut server_endpoint = NetworkEndpoint::bind(local(port)).unwrap();
    let mut client_endpoint = NetworkEndpoint::bind(local(port + 1)).unwrap();
    let mut connections = ConnectionManager::new(4);
    let qport = 27;

    let request = OutOfBand::Connect {
        protocol: PROTOCOL_VERSION,
        qport,
    };
    client_endpoint.send_to(&request.encode(), local(port)).unwrap();

    let (data, from) = wait_for_packet(&mut server_endpoint, 500).expect("No packet received");
    let now = Instant::now();
    let client_id = match OutOfBand::parse(&data) {
        Some(OutOfBand::Connect { protocol, qport }) => {
            let config = ChannelConfig {
                qport,
                ..Default::default()
            };
            let client = connections.accept(from, protocol, config, now).unwrap();
            client.client_id
        }
        other => panic!("Expected connect, got {other:?}"),
    };
    server_endpoint
        .send_to(&OutOfBand::Accept { client_id }.encode(), from)
        .unwrap();

    let (data, _) = wait_for_packet(&mut client_endpoint, 500).expect("No packet received");
    assert_eq!(OutOfBand::parse(&data), Some(OutOfBand::Accept { client_id }));

    let config = ChannelConfig {
        qport,
        ..Default::default()
    };
    let mut channel = NetChannel::new(local(port), config, now);
    channel.transmit(&mut client_endpoint, b"hello", now).unwrap();

    let (data, from) = wait_for_packet(&mut server_endpoint, 500).expect("No packet received");
    assert!(!xnet::net::is_out_of_band(&data));
    let id = connections.route(from, &data).unwrap();
    assert_eq!(id, client_id);

    let client = connections.get_mut(id).unwrap();
    let received = client.channel.process(&data, now).unwrap().unwrap();
    assert_eq!(received.unreliable, b"hello");
    client.state = ConnectionState::Connected;
    assert_eq!(connections.connected_count(), 1);
}
