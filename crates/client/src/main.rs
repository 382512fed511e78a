pub mod net;

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use drift::{NetConfig, PacketLossSimulation};
use net::{ClientConfig, NetworkClient, Pilot, PilotPattern};

#[derive(Parser)]
#[command(name = "drift-client")]
#[command(about = "Headless drift client driven by a scripted pilot")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27015",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(short, long, default_value = "pilot")]
    name: String,

    #[arg(long, value_enum, default_value_t = PilotPattern::Circle)]
    pattern: PilotPattern,

    #[arg(long, default_value_t = 1, help = "Seed for the random pattern")]
    seed: u64,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration: Option<u64>,

    #[arg(long, default_value_t = drift::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(long, help = "Give up after this many lost hellos")]
    max_login_attempts: Option<u32>,

    #[arg(long, help = "Enable packet loss simulation")]
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

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr: SocketAddr = args.server.parse()?;

    let mut net = NetConfig {
        tick_rate: args.tick_rate,
        ..Default::default()
    };
    net.login_backoff.max_attempts = args.max_login_attempts;

    let config = ClientConfig {
        name: args.name,
        net,
        packet_loss: args.simulate_packet_loss.then(|| PacketLossSimulation {
            enabled: true,
            loss_percent: args.loss_percent,
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency,
            jitter_ms: args.jitter,
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut client = NetworkClient::new(config)?;
    client.connect(server_addr);

    let mut pilot = Pilot::new(args.pattern, args.seed);
    client.run(&mut pilot, args.duration.map(Duration::from_secs))?;

    log::info!("Client exiting ({:?})", client.state());
    Ok(())
}
