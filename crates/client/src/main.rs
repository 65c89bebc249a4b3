mod client;
mod config;

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use xnet::delta::UserCmd;
use xnet::net::FlowDirection;
use xnet::net::protocol::DEFAULT_RATE;
use xnet::{ConnectionState, LossyTransport, NetworkEndpoint, PacketLossSimulation, Transport};

use client::NetworkClient;
use config::ClientConfig;

const FRAME_TIME: Duration = Duration::from_millis(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "xnet-client")]
#[command(about = "Headless test client for the xnet protocol")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:27015", help = "Server address to connect to")]
    server: String,

    #[arg(long, help = "Client port id, random if omitted")]
    qport: Option<u16>,

    #[arg(long, default_value_t = 30, help = "Commands sent per second")]
    command_rate: u32,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 200.0, help = "Forward speed of the generated commands")]
    forward: f32,

    #[arg(long, default_value_t = 45.0, help = "Turn rate in degrees per second")]
    turn_rate: f32,

    #[arg(long, default_value_t = DEFAULT_RATE, help = "Bytes per second sent to the server")]
    rate: f32,

    #[arg(long, help = "Huffman-compress datagram bodies, must match the server")]
    compress: bool,

    #[arg(long, help = "Enable packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,
}

fn random_qport() -> u16 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(std::process::id());
    hasher.finish() as u16
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server: SocketAddr = args
        .server
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("No address for {}", args.server))?;

    let config = ClientConfig {
        qport: args.qport.unwrap_or_else(random_qport),
        command_rate: args.command_rate,
        rate: args.rate,
        compress: args.compress,
        ..Default::default()
    };
    let simulation = PacketLossSimulation {
        enabled: args.simulate_packet_loss,
        loss_percent: args.loss_percent,
        ..Default::default()
    };

    let endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
    log::info!("Bound to {}, qport {}", endpoint.local_addr(), config.qport);
    let transport = LossyTransport::new(endpoint, simulation);
    let mut client = NetworkClient::new(transport, server, config);

    let start = Instant::now();
    client.connect(start)?;

    let mut last_frame = start;
    let mut last_status = start;
    let mut yaw = 0.0f32;
    loop {
        std::thread::sleep(FRAME_TIME);
        let now = Instant::now();
        let dt = now.saturating_duration_since(last_frame);
        last_frame = now;

        yaw = (yaw + args.turn_rate * dt.as_secs_f32()).rem_euclid(360.0);
        let mut command = UserCmd {
            msec: dt.as_millis().min(u8::MAX as u128) as u8,
            forwardmove: args.forward,
            ..Default::default()
        };
        command.viewangles.y = yaw;

        client.update(now, Some(command))?;

        if client.state() == ConnectionState::Disconnected {
            log::info!(
                "Session ended: {}",
                client.disconnect_reason().unwrap_or("disconnected")
            );
            break;
        }

        if now.saturating_duration_since(last_status) >= STATUS_INTERVAL {
            last_status = now;
            print_status(&client);
        }

        if args
            .duration
            .is_some_and(|secs| now.saturating_duration_since(start) >= Duration::from_secs(secs))
        {
            client.disconnect(now)?;
            break;
        }
    }

    Ok(())
}

fn print_status<T: Transport>(client: &NetworkClient<T>) {
    let Some(channel) = client.channel() else {
        log::info!("Waiting for the server");
        return;
    };
    let stats = channel.stats();
    let level = client.server_data().map_or("?", |d| d.level_name.as_str());
    log::info!(
        "client {} in {level}: {} tables, time {:.1}s, {} entities, gravity {}, rtt {:.0}ms, loss {:.1}%, in {:.1} KB/s, out {:.1} KB/s, server chokes {}",
        client.client_id().unwrap_or(0),
        client.registry().initialised_count(),
        client.server_time(),
        client.entities().count(),
        client.movevars().gravity,
        stats.rtt_ms,
        stats.packet_loss_percent(),
        channel.flow(FlowDirection::Incoming).avg_kbytes_per_sec(),
        channel.flow(FlowDirection::Outgoing).avg_kbytes_per_sec(),
        client.server_chokes()
    );
}
