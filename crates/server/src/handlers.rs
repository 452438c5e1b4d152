use log::{debug, info};
use skywing::{
    AdvancedNetworkInterface, Network, PacketError, PacketSender, PeerInfo, RawPacketHandler,
    ServerError, SessionFactory, SessionHandler, TickSubsystem,
};

const MAX_QUERY_LEN: usize = 64;

/// Answers `PING` datagrams from server lists with the name the receiving
/// interface currently advertises.
pub struct QueryHandler;

impl RawPacketHandler for QueryHandler {
    fn pattern(&self) -> &str {
        "^PING"
    }

    fn handle(
        &mut self,
        interface: &mut dyn AdvancedNetworkInterface,
        address: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<bool, PacketError> {
        if payload.len() > MAX_QUERY_LEN {
            return Err(PacketError::TooLarge {
                len: payload.len(),
                max: MAX_QUERY_LEN,
            });
        }

        let reply = format!("PONG;{}", interface.advertised_name());
        interface.send_raw_packet(address, port, reply.as_bytes());
        debug!("Answered query from /{}:{}", address, port);
        Ok(true)
    }
}

/// Placeholder game protocol: logs what arrives and echoes it back.
pub struct LoggingSession {
    peer: PeerInfo,
    max_payload: usize,
    received: u64,
}

impl SessionHandler for LoggingSession {
    fn handle_encoded(
        &mut self,
        payload: &[u8],
        sender: &mut dyn PacketSender,
    ) -> Result<(), PacketError> {
        if payload.len() > self.max_payload {
            return Err(PacketError::TooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        self.received += payload.len() as u64;
        debug!(
            "{} bytes from /{}:{}",
            payload.len(),
            self.peer.address,
            self.peer.port
        );
        sender.send(payload, false);
        Ok(())
    }

    fn on_disconnect(&mut self, reason: &str) {
        info!(
            "/{}:{} disconnected after {} bytes: {}",
            self.peer.address, self.peer.port, self.received, reason
        );
    }
}

pub struct LoggingSessionFactory {
    pub max_payload: usize,
}

impl SessionFactory for LoggingSessionFactory {
    fn create(&mut self, peer: &PeerInfo) -> Box<dyn SessionHandler> {
        info!("/{}:{} connected", peer.address, peer.port);
        Box::new(LoggingSession {
            peer: peer.clone(),
            max_payload: self.max_payload,
            received: 0,
        })
    }
}

/// Periodically logs session count and bandwidth.
pub struct StatusReporter {
    every_ticks: u64,
}

impl StatusReporter {
    pub fn new(every_ticks: u64) -> Self {
        Self {
            every_ticks: every_ticks.max(1),
        }
    }
}

impl TickSubsystem for StatusReporter {
    fn name(&self) -> &str {
        "status"
    }

    fn tick(&mut self, tick: u64, network: &mut Network) -> Result<(), ServerError> {
        if tick % self.every_ticks == 0 {
            let bandwidth = network.bandwidth();
            info!(
                "{} sessions, up {} B/s, down {} B/s",
                network.sessions().session_count(),
                bandwidth.send().average_bytes(),
                bandwidth.receive().average_bytes()
            );
        }
        Ok(())
    }
}
