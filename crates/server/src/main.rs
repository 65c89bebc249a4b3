mod config;
mod encoders;
mod events;
mod server;
mod simulation;
mod tui;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use config::ServerConfig;
use events::ServerEvent;
use server::GameServer;
use tui::TuiState;
use xnet::PacketLossSimulation;
use xnet::net::protocol::DEFAULT_RATE;

#[derive(Parser)]
#[command(name = "xnet-server")]
#[command(about = "Dedicated server for the xnet protocol")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = xnet::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 20)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long)]
    headless: bool,

    #[arg(long, default_value_t = 65, help = "Seconds of silence before a client is dropped")]
    timeout: u64,

    #[arg(long, help = "Disconnect clients that lose more datagrams than this")]
    drop_limit: Option<u32>,

    #[arg(long, default_value_t = DEFAULT_RATE, help = "Bytes per second sent to each client")]
    rate: f32,

    #[arg(long, help = "Huffman-compress datagram bodies")]
    compress: bool,

    #[arg(long, help = "Delta description file, the built-in one if omitted")]
    delta: Option<PathBuf>,

    #[arg(long, default_value_t = 8, help = "Moving props in the world")]
    props: usize,

    #[arg(long, help = "Enable global packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let global_packet_loss = args.simulate_packet_loss.then(|| PacketLossSimulation {
        enabled: true,
        loss_percent: args.loss_percent,
        min_latency_ms: args.min_latency,
        max_latency_ms: args.max_latency,
        jitter_ms: args.jitter,
    });

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        timeout_secs: args.timeout,
        drop_limit: args.drop_limit,
        rate: args.rate,
        compress: args.compress,
        delta_path: args.delta,
        prop_count: args.props,
        global_packet_loss,
    };

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut server = GameServer::new(&bind_addr, config)?;

    if args.headless {
        log::info!("Server started on {}", server.local_addr());
        server.run();
        log::info!("Server shutting down");
    } else {
        run_with_tui(&mut server)?;
    }

    Ok(())
}

fn run_with_tui(server: &mut GameServer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new();

    tui_state.log_info(format!("Server started on {}", server.local_addr()));

    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            match event {
                ServerEvent::ClientConnecting { addr } => {
                    tui_state.log_info(format!("Connection request from {}", addr));
                }
                ServerEvent::ClientConnected {
                    client_id,
                    addr,
                    entity,
                } => {
                    tui_state.log_info(format!(
                        "Client {} connected from {} (entity {})",
                        client_id, addr, entity
                    ));
                }
                ServerEvent::ClientDisconnected { client_id, reason } => {
                    tui_state.log_info(format!("Client {} {}", client_id, reason.as_str()));
                }
                ServerEvent::ConnectionDenied { addr, reason } => {
                    tui_state.log_warn(format!("Connection denied to {}: {}", addr, reason));
                }
                ServerEvent::Error { message } => {
                    tui_state.log_error(message);
                }
            }
        }

        if let Some(client_id) = tui_state.take_pending_kick() {
            server.kick_client(client_id);
        }

        if event::poll(Duration::from_millis(1))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let clients = server.client_infos();
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            running.store(false, Ordering::SeqCst);
                        }
                        KeyCode::Up => tui_state.select_prev(clients.len()),
                        KeyCode::Down => tui_state.select_next(clients.len()),
                        KeyCode::Char('k') | KeyCode::Char('K') => tui_state.request_kick(&clients),
                        KeyCode::Char('g') | KeyCode::Char('G') => {
                            let gravity = server.toggle_gravity();
                            tui_state.log_info(format!("Gravity set to {}", gravity));
                        }
                        _ => {}
                    }
                }
            }
        }

        let stats = server.stats();
        let clients = server.client_infos();
        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &stats, &clients);
        })?;
    }

    tui_state.log_info("Shutting down...");
    server.shutdown_connections();

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
