mod bot;

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use bot::{BotClient, BotConfig};

#[derive(Parser)]
#[command(name = "tessera-client")]
#[command(about = "Headless bot client for the tessera arena server")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27016",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = 30, help = "Ticks between hitscan shots, 0 to never fire")]
    fire_every: u32,

    #[arg(long, default_value_t = 90, help = "Ticks between thrown projectiles, 0 to never throw")]
    throw_every: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr: SocketAddr = args.server.parse()?;
    let config = BotConfig {
        fire_every: args.fire_every,
        throw_every: args.throw_every,
        ..Default::default()
    };

    let mut client = BotClient::new(config)?;
    client.connect(server_addr)?;

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut last_frame = Instant::now();
    while client.is_running() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::info!("Run time elapsed");
            break;
        }
        let now = Instant::now();
        let dt = (now - last_frame).as_secs_f32();
        last_frame = now;

        client.update(dt)?;
        thread::sleep(Duration::from_millis(1));
    }

    client.disconnect();
    Ok(())
}
