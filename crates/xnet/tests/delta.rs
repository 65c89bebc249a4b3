use std::net::SocketAddr;
use std::time::{Duration, Instant};

use glam::Vec3;
use xnet::delta::{
    EntityState, EntityUpdate, UserCmd, read_delta_entity, read_delta_usercmd, write_delta_entity,
    write_delta_usercmd,
};
use xnet::net::svc;
use xnet::{BitBuffer, ChannelConfig, DeltaRegistry, MemoryNetwork, NetChannel, RecordKind, Transport};

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn reader(buf: BitBuffer) -> BitBuffer {
    let bits = buf.bits_written();
    BitBuffer::with_bits(buf.into_inner(), 0, bits)
}

#[test]
fn test_forwardmove_scaled_by_eight() {
    let registry = DeltaRegistry::from_description(
        "usercmd_t none\n{\n\tDEFINE_DELTA( forwardmove, DT_FLOAT | DT_SIGNED, 16, 8.0 )\n}\n",
    )
    .unwrap();
    let from = UserCmd::default();
    let to = UserCmd {
        forwardmove: 12.375,
        ..Default::default()
    };

    let mut buf = BitBuffer::with_capacity(32);
    write_delta_usercmd(&mut buf, &registry, &from, &to).unwrap();
    assert_eq!(buf.bits_written(), 17);

    let mut read = reader(buf);
    let decoded = read_delta_usercmd(&mut read, &registry, &from).unwrap();
    assert_eq!(decoded.forwardmove, 12.375);
    assert_eq!(decoded, to);
}

#[test]
fn test_tables_and_entities_over_channel() {
    let server_registry = DeltaRegistry::builtin().unwrap();
    let network = MemoryNetwork::new();
    let mut server_net = network.bind(local(1));
    let mut client_net = network.bind(local(2));

    let mut now = Instant::now();
    let mut server = NetChannel::new(local(2), ChannelConfig::default(), now);
    let mut client = NetChannel::new(local(1), ChannelConfig::default(), now);

    let written = server_registry.write_definitions(server.message());
    assert!(written > 0);

    let mut client_registry = DeltaRegistry::new();
    let mut stream = Vec::new();
    let mut stream_bits = 0;
    for _ in 0..16 {
        now += Duration::from_millis(10);
        server.transmit(&mut server_net, b"", now).unwrap();
        for (data, _) in client_net.receive_all().unwrap() {
            if let Some(reliable) = client.process(&data, now).unwrap().and_then(|r| r.reliable) {
                stream_bits = reliable.len() * 8;
                stream = reliable;
            }
        }
        client.transmit(&mut client_net, b"", now).unwrap();
        for (data, _) in server_net.receive_all().unwrap() {
            server.process(&data, now).unwrap();
        }
        if !server.has_pending_reliable() {
            break;
        }
    }
    assert!(stream.len() > xnet::net::MAX_RELIABLE_PAYLOAD);

    let mut read = BitBuffer::with_bits(stream, 0, stream_bits);
    let mut applied = 0;
    while read.bits_left() >= 8 {
        assert_eq!(read.read_byte(), svc::DELTATABLE);
        assert!(client_registry.read_definition(&mut read).unwrap());
        applied += 1;
    }
    assert_eq!(applied, written);
    for kind in RecordKind::ALL {
        assert_eq!(
            server_registry.table(kind).fields(),
            client_registry.table(kind).fields()
        );
    }
    client_registry.freeze();

    let baseline = EntityState::new(5);
    let mut moved = baseline.clone();
    moved.origin = Vec3::new(128.5, -64.25, 32.0);
    moved.modelindex = 12;
    moved.frame = 12.25;

    let mut packet = BitBuffer::with_capacity(256);
    assert!(write_delta_entity(&mut packet, &server_registry, &baseline, &moved, false, false, 0.0).unwrap());
    assert!(!write_delta_entity(&mut packet, &server_registry, &moved, &moved, false, false, 0.0).unwrap());

    let mut read = reader(packet);
    let number = read.read_word() as i32;
    let update = read_delta_entity(&mut read, &client_registry, &baseline, number, false, 0.0).unwrap();
    assert_eq!(update, EntityUpdate::Delta(moved));
}
