use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use skywing::server::DEFAULT_TICK_RATE;
use skywing::transport::DEFAULT_CHANNEL_CAPACITY;
use skywing::{BridgeConfig, TickConfig, UdpEngineConfig};

pub const DEFAULT_PORT: u16 = 19132;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub name: String,
    pub tick_rate: u32,
    pub max_sessions: usize,
    pub max_payload: usize,
    pub channel_capacity: usize,
    pub startup_timeout: Duration,
    pub idle_timeout: Duration,
    pub status_interval_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            name: "SkyWing Net".to_owned(),
            tick_rate: DEFAULT_TICK_RATE,
            max_sessions: 64,
            max_payload: 4096,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            startup_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            status_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn tick(&self) -> TickConfig {
        TickConfig {
            tick_rate: self.tick_rate,
            ..TickConfig::default()
        }
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            channel_capacity: self.channel_capacity,
            startup_timeout: self.startup_timeout,
            ..BridgeConfig::default()
        }
    }

    pub fn engine(&self) -> UdpEngineConfig {
        UdpEngineConfig {
            max_sessions: self.max_sessions,
            idle_timeout: self.idle_timeout,
            ..UdpEngineConfig::default()
        }
    }
}
