mod events;
mod server;

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::time::MissedTickBehavior;

use events::ServerEvent;
use server::{ArenaServer, Inbound};
use tessera::net::MAX_PACKET_SIZE;
use tessera::{LagCompConfig, NetworkEndpoint, Packet, ServerConfig, StoreConfig};

const INBOUND_CAPACITY: usize = 1024;
const STATS_INTERVAL_TICKS: u32 = 600;

#[derive(Parser)]
#[command(name = "tessera-server")]
#[command(about = "Authoritative arena server for the tessera replication core")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tessera::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = tessera::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 8, help = "Server-driven bots orbiting the arena")]
    bots: usize,

    #[arg(long, default_value_t = 64, help = "Committed ticks kept for delta encoding")]
    history_ticks: usize,

    #[arg(long, default_value_t = 15, help = "Furthest hit detection may rewind, in ticks")]
    max_rewind_ticks: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.tick_rate == 0 {
        bail!("tick rate must be positive");
    }
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = ServerConfig {
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        store: StoreConfig {
            history_ticks: args.history_ticks,
        },
        lag_comp: LagCompConfig {
            max_rewind_ticks: args.max_rewind_ticks,
        },
        ..Default::default()
    };

    let endpoint = NetworkEndpoint::bind(&bind_addr)?;
    let socket = UdpSocket::from_std(endpoint.try_clone_socket()?)?;
    let mut server = ArenaServer::new(endpoint, config, args.bots)?;
    info!("Server started on {}", server.local_addr());

    let (tx, mut rx) = mpsc::channel(INBOUND_CAPACITY);
    tokio::spawn(receive_loop(socket, tx));

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / args.tick_rate as f64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                loop {
                    match rx.try_recv() {
                        Ok(inbound) => server.handle(inbound),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => bail!("receive task stopped"),
                    }
                }
                server.tick();
                for event in server.drain_events() {
                    log_event(event);
                }

                let stats = server.stats();
                if stats.tick % STATS_INTERVAL_TICKS == 0 {
                    info!(
                        "tick {}: {} clients, {} entities, {} packets lost",
                        stats.tick, stats.clients, stats.entities, stats.packets_lost
                    );
                }
            }
            _ = &mut shutdown => {
                info!("Server shutting down");
                server.shutdown();
                for event in server.drain_events() {
                    log_event(event);
                }
                break;
            }
        }
    }

    Ok(())
}

/// Reads datagrams off the socket and forwards the decodable ones. A full
/// queue drops the packet rather than stall the socket.
async fn receive_loop(socket: UdpSocket, tx: mpsc::Sender<Inbound>) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut dropped = 0u64;
    loop {
        let (size, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("receive failed: {e}");
                continue;
            }
        };
        let packet = match Packet::deserialize(&buf[..size]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping undecodable packet from {addr}: {e}");
                continue;
            }
        };
        match tx.try_send(Inbound { packet, addr, size }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                warn!("inbound queue full, {dropped} packets dropped so far");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

fn log_event(event: ServerEvent) {
    match event {
        ServerEvent::ClientConnected {
            client,
            addr,
            player,
            avatar,
        } => info!("{client} connected from {addr} as player {player} (avatar {avatar})"),
        ServerEvent::ClientDisconnected { client, reason } => {
            info!("{client} {}", reason.as_str())
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            warn!("Connection denied to {addr}: {reason}")
        }
        ServerEvent::Hit {
            shooter,
            target,
            rewound,
            mitigated,
        } => debug!(
            "{shooter} hit {target} ({rewound} ticks back{})",
            if mitigated { ", mitigated" } else { "" }
        ),
        ServerEvent::Error { message } => error!("{message}"),
    }
}
