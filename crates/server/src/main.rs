mod config;
mod server;

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use drift::{NetConfig, PacketLossSimulation};
use server::GameServer;

#[derive(Parser)]
#[command(name = "drift-server")]
#[command(about = "Authoritative drift host")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = drift::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = drift::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value_t = 180, help = "Round length in seconds")]
    round_secs: u64,

    #[arg(long, default_value_t = 2, help = "Frames clients should run ahead")]
    frame_lead: u32,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,

    #[arg(long, help = "Enable global packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0.0, help = "Packet duplication percentage (0-100)")]
    duplicate_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let global_packet_loss = args.simulate_packet_loss.then(|| PacketLossSimulation {
        enabled: true,
        loss_percent: args.loss_percent,
        duplicate_percent: args.duplicate_percent,
        min_latency_ms: args.min_latency,
        max_latency_ms: args.max_latency,
        jitter_ms: args.jitter,
    });

    let config = ServerConfig {
        max_clients: args.max_clients,
        net: NetConfig {
            tick_rate: args.tick_rate,
            target_frame_lead: args.frame_lead,
            ..Default::default()
        },
        round_length: Duration::from_secs(args.round_secs),
        global_packet_loss,
        ..Default::default()
    };

    let mut server = GameServer::new(&bind_addr, config)?;
    log::info!("Server started on {}", server.local_addr());
    spawn_console(server.running());

    match args.duration {
        Some(secs) => server.run_for(Duration::from_secs(secs))?,
        None => server.run()?,
    }

    log::info!("Server shutting down");
    Ok(())
}

/// Reads operator commands from stdin; `quit` stops the server, which then
/// kicks every player before exiting.
fn spawn_console(running: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match line.trim() {
                "quit" | "q" => {
                    log::info!("Stopping on operator request");
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                "" => {}
                other => log::warn!("unknown command {:?}, try quit", other),
            }
        }
    });
}
