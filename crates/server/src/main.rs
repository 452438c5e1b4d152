mod config;
mod handlers;
mod signal;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use config::{DEFAULT_PORT, ServerConfig};
use handlers::{LoggingSessionFactory, QueryHandler, StatusReporter};
use skywing::{Network, NetworkInterface, Server, TransportBridge, UdpEngine};

#[derive(Parser)]
#[command(name = "skywing-server")]
#[command(about = "SkyWing network server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value = "SkyWing Net")]
    name: String,

    #[arg(short, long, default_value_t = skywing::server::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 64)]
    max_sessions: usize,

    #[arg(long, default_value_t = 4096, help = "Largest session payload accepted, in bytes")]
    max_payload: usize,

    #[arg(long, default_value_t = skywing::transport::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    #[arg(long, default_value_t = 10, help = "Seconds to wait for the transport to start")]
    startup_timeout: u64,

    #[arg(long, default_value_t = 30, help = "Seconds before a silent peer is dropped")]
    idle_timeout: u64,

    #[arg(long, help = "Log at debug level unless RUST_LOG says otherwise")]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = ServerConfig {
        bind: SocketAddr::new(args.bind, args.port),
        name: args.name,
        tick_rate: args.tick_rate,
        max_sessions: args.max_sessions,
        max_payload: args.max_payload,
        channel_capacity: args.channel_capacity,
        startup_timeout: Duration::from_secs(args.startup_timeout),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        ..Default::default()
    };

    let mut network = Network::new(skywing::Context::system(), config.name.clone());
    network
        .register_raw_packet_handler(Box::new(QueryHandler))
        .context("failed to register query handler")?;

    let bridge = TransportBridge::with_config(
        config.bind.to_string(),
        Box::new(UdpEngine::with_config(config.bind, config.engine())),
        Box::new(LoggingSessionFactory {
            max_payload: config.max_payload,
        }),
        config.bridge(),
    );
    let interfaces: Vec<Box<dyn NetworkInterface>> = vec![Box::new(bridge)];

    let mut server = Server::start(config.tick(), network, interfaces)
        .with_context(|| format!("failed to start server on {}", config.bind))?;
    server.add_subsystem(Box::new(StatusReporter::new(
        u64::from(config.status_interval_secs) * u64::from(config.tick_rate),
    )));

    signal::spawn_shutdown_listener(server.running())?;

    let result = server.run();
    let stats = server.tick_stats();
    log::info!(
        "Average {:.1} TPS, {:.0}% tick usage",
        stats.average_tps(),
        stats.average_usage() * 100.0
    );
    result.context("server crashed")?;

    log::info!("Server shut down");
    Ok(())
}
