//! Plain UDP engine used when no dedicated reliable-transport engine is plugged in.
//!
//! Every datagram from a known peer is a session packet. Datagrams from
//! unknown peers either match a raw filter, answer a discovery query, or open
//! a new session.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use regex::bytes::Regex;

use super::bridge::TRANSPORT_RESERVED_ID;
use super::engine::{EngineLink, TransportEngine, TransportError};
use super::protocol::{TransportCommand, TransportEvent, TransportSessionId};

/// `[TRANSPORT_RESERVED_ID, DISCOVERY_QUERY]` from anyone is answered with
/// `[TRANSPORT_RESERVED_ID, DISCOVERY_REPLY, server id (8 bytes BE), name...]`.
pub const DISCOVERY_QUERY: u8 = 0x01;
pub const DISCOVERY_REPLY: u8 = 0x02;

const MAX_DATAGRAMS_PER_TICK: usize = 256;

#[derive(Debug, Clone)]
pub struct UdpEngineConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub bandwidth_interval: Duration,
    pub max_datagram: usize,
}

impl Default for UdpEngineConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            bandwidth_interval: Duration::from_secs(1),
            max_datagram: 1492,
        }
    }
}

#[derive(Debug)]
struct Peer {
    session_id: TransportSessionId,
    last_seen: Instant,
}

/// Socket state that only exists between `start` and `shutdown`.
struct Bound {
    socket: UdpSocket,
    link: EngineLink,
    name: String,
    peers: HashMap<SocketAddr, Peer>,
    by_session: HashMap<TransportSessionId, SocketAddr>,
    bans: HashMap<IpAddr, Option<Instant>>,
    filters: Vec<Regex>,
    next_session_id: TransportSessionId,
    bytes_sent: u64,
    bytes_received: u64,
    last_stats: Instant,
    buffer: Vec<u8>,
}

pub struct UdpEngine {
    bind_addr: SocketAddr,
    config: UdpEngineConfig,
    bound: Option<Bound>,
}

impl UdpEngine {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self::with_config(bind_addr, UdpEngineConfig::default())
    }

    pub fn with_config(bind_addr: SocketAddr, config: UdpEngineConfig) -> Self {
        Self {
            bind_addr,
            config,
            bound: None,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

impl TransportEngine for UdpEngine {
    fn start(&mut self, link: EngineLink) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(self.bind_addr).map_err(|source| TransportError::Bind {
            addr: self.bind_addr,
            source,
        })?;
        socket.set_nonblocking(true)?;
        info!("Listening on /{}", socket.local_addr()?);

        self.bound = Some(Bound {
            socket,
            link,
            name: String::new(),
            peers: HashMap::new(),
            by_session: HashMap::new(),
            bans: HashMap::new(),
            filters: Vec::new(),
            next_session_id: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_stats: Instant::now(),
            buffer: vec![0u8; self.config.max_datagram],
        });
        Ok(())
    }

    fn tick(&mut self) -> Result<(), TransportError> {
        let bound = self.bound.as_mut().ok_or(TransportError::NotStarted)?;
        let now = Instant::now();

        while let Some(command) = bound.link.commands.try_recv()? {
            bound.apply(command, now)?;
        }

        let received = bound.receive(&self.config, now)?;
        bound.expire_idle(self.config.idle_timeout, now)?;

        if now.duration_since(bound.last_stats) >= self.config.bandwidth_interval {
            bound.link.events.send(&TransportEvent::BandwidthStats {
                bytes_sent: bound.bytes_sent,
                bytes_received: bound.bytes_received,
            })?;
            bound.bytes_sent = 0;
            bound.bytes_received = 0;
            bound.last_stats = now;
        }

        if received == 0 {
            thread::sleep(self.config.poll_interval);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(bound) = self.bound.take() {
            // Drain whatever the main thread queued before it asked us to stop.
            while let Ok(Some(command)) = bound.link.commands.try_recv() {
                debug!("Discarding {:?} on shutdown", command);
            }
            debug!(
                "Closed /{} with {} peers connected",
                self.bind_addr,
                bound.peers.len()
            );
        }
    }
}

impl Bound {
    fn apply(&mut self, command: TransportCommand, now: Instant) -> Result<(), TransportError> {
        match command {
            TransportCommand::CloseSession { session_id, reason } => {
                if let Some(addr) = self.by_session.remove(&session_id) {
                    self.peers.remove(&addr);
                    debug!("Closed session {} (/{}): {}", session_id, addr, reason);
                }
            }
            TransportCommand::SendEncapsulated {
                session_id,
                payload,
                ..
            } => {
                if let Some(&addr) = self.by_session.get(&session_id) {
                    self.send_to(&payload, addr);
                }
            }
            TransportCommand::SendRaw {
                address,
                port,
                payload,
            } => match address.parse::<IpAddr>() {
                Ok(ip) => self.send_to(&payload, SocketAddr::new(ip, port)),
                Err(_) => warn!("Cannot send raw packet to invalid address {}", address),
            },
            TransportCommand::BlockAddress {
                address,
                timeout_secs,
            } => match address.parse::<IpAddr>() {
                Ok(ip) => {
                    let expiry = u64::try_from(timeout_secs)
                        .ok()
                        .filter(|&secs| secs > 0)
                        .and_then(|secs| now.checked_add(Duration::from_secs(secs)));
                    self.bans.insert(ip, expiry);
                }
                Err(_) => warn!("Cannot block invalid address {}", address),
            },
            TransportCommand::UnblockAddress { address } => {
                if let Ok(ip) = address.parse::<IpAddr>() {
                    self.bans.remove(&ip);
                }
            }
            TransportCommand::SetName { name } => self.name = name,
            TransportCommand::AddRawFilter { pattern } => match Regex::new(&pattern) {
                Ok(regex) => self.filters.push(regex),
                Err(e) => warn!("Ignoring raw filter {}: {}", pattern, e),
            },
            TransportCommand::RemoveRawFilter { pattern } => {
                self.filters.retain(|regex| regex.as_str() != pattern);
            }
        }
        Ok(())
    }

    /// Send failures only concern the one destination, so they are logged and dropped.
    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) {
        match self.socket.send_to(payload, addr) {
            Ok(bytes) => self.bytes_sent += bytes as u64,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Send buffer full, dropped datagram to /{}", addr);
            }
            Err(e) => warn!("Dropped datagram to /{}: {}", addr, e),
        }
    }

    fn is_banned(&mut self, ip: IpAddr, now: Instant) -> bool {
        match self.bans.get(&ip) {
            Some(None) => true,
            Some(Some(expiry)) if now < *expiry => true,
            Some(Some(_)) => {
                self.bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    fn receive(&mut self, config: &UdpEngineConfig, now: Instant) -> Result<usize, TransportError> {
        let mut received = 0;

        while received < MAX_DATAGRAMS_PER_TICK {
            let (size, addr) = match self.socket.recv_from(&mut self.buffer) {
                Ok(datagram) => datagram,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };
            received += 1;
            self.bytes_received += size as u64;

            if size == 0 || self.is_banned(addr.ip(), now) {
                continue;
            }
            let payload = self.buffer[..size].to_vec();
            self.dispatch(addr, payload, config, now)?;
        }

        Ok(received)
    }

    fn dispatch(
        &mut self,
        addr: SocketAddr,
        payload: Vec<u8>,
        config: &UdpEngineConfig,
        now: Instant,
    ) -> Result<(), TransportError> {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_seen = now;
            let session_id = peer.session_id;
            self.link.events.send(&TransportEvent::PacketReceived {
                session_id,
                payload,
            })?;
            return Ok(());
        }

        if self.filters.iter().any(|regex| regex.is_match(&payload)) {
            self.link.events.send(&TransportEvent::RawPacketReceived {
                address: addr.ip().to_string(),
                port: addr.port(),
                payload,
            })?;
            return Ok(());
        }

        if payload == [TRANSPORT_RESERVED_ID, DISCOVERY_QUERY] {
            let mut reply = vec![TRANSPORT_RESERVED_ID, DISCOVERY_REPLY];
            reply.extend_from_slice(&self.link.server_id.to_be_bytes());
            reply.extend_from_slice(self.name.as_bytes());
            self.send_to(&reply, addr);
            return Ok(());
        }

        if self.peers.len() >= config.max_sessions {
            debug!("Session limit reached, ignoring /{}", addr);
            return Ok(());
        }

        self.next_session_id = self.next_session_id.wrapping_add(1);
        let session_id = self.next_session_id;
        self.peers.insert(
            addr,
            Peer {
                session_id,
                last_seen: now,
            },
        );
        self.by_session.insert(session_id, addr);

        self.link.events.send(&TransportEvent::ClientConnected {
            session_id,
            address: addr.ip().to_string(),
            port: addr.port(),
            client_id: 0,
        })?;
        self.link.events.send(&TransportEvent::PacketReceived {
            session_id,
            payload,
        })?;
        Ok(())
    }

    fn expire_idle(&mut self, idle_timeout: Duration, now: Instant) -> Result<(), TransportError> {
        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.duration_since(peer.last_seen) > idle_timeout)
            .map(|(&addr, _)| addr)
            .collect();

        for addr in idle {
            if let Some(peer) = self.peers.remove(&addr) {
                self.by_session.remove(&peer.session_id);
                self.link.events.send(&TransportEvent::ClientDisconnected {
                    session_id: peer.session_id,
                    reason: "timeout".into(),
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU16, Ordering};

    use super::*;
    use crate::transport::protocol::{
        CommandSender, EventReceiver, command_channel, event_channel,
    };

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

    fn next_addr() -> SocketAddr {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn started(config: UdpEngineConfig) -> (UdpEngine, CommandSender, EventReceiver, UdpSocket) {
        let addr = next_addr();
        let (commands, command_rx) = command_channel(64);
        let (event_tx, events) = event_channel(64);
        let mut engine = UdpEngine::with_config(addr, config);
        engine
            .start(EngineLink {
                server_id: 0xABCD,
                commands: command_rx,
                events: event_tx,
            })
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        client.connect(addr).unwrap();
        (engine, commands, events, client)
    }

    fn collect(engine: &mut UdpEngine, events: &EventReceiver, wanted: usize) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        for _ in 0..100 {
            engine.tick().unwrap();
            while let Some(event) = events.try_recv().unwrap() {
                if !matches!(event, TransportEvent::BandwidthStats { .. }) {
                    out.push(event);
                }
            }
            if out.len() >= wanted {
                break;
            }
        }
        out
    }

    #[test]
    fn test_first_datagram_opens_a_session() {
        let (mut engine, _commands, events, client) = started(UdpEngineConfig::default());
        client.send(&[0x84, 1, 2]).unwrap();

        let out = collect(&mut engine, &events, 2);

        assert!(matches!(
            &out[0],
            TransportEvent::ClientConnected { session_id: 1, client_id: 0, .. }
        ));
        assert_eq!(
            out[1],
            TransportEvent::PacketReceived {
                session_id: 1,
                payload: vec![0x84, 1, 2]
            }
        );
    }

    #[test]
    fn test_filtered_datagram_is_raw() {
        let (mut engine, commands, events, client) = started(UdpEngineConfig::default());
        commands
            .send(&TransportCommand::AddRawFilter {
                pattern: "^PING".into(),
            })
            .unwrap();
        engine.tick().unwrap();
        client.send(b"PING 1").unwrap();

        let out = collect(&mut engine, &events, 1);

        assert!(matches!(
            &out[0],
            TransportEvent::RawPacketReceived { payload, .. } if payload == b"PING 1"
        ));
    }

    #[test]
    fn test_banned_source_is_ignored_until_unblocked() {
        let (mut engine, commands, events, client) = started(UdpEngineConfig::default());
        commands
            .send(&TransportCommand::BlockAddress {
                address: "127.0.0.1".into(),
                timeout_secs: 0,
            })
            .unwrap();
        engine.tick().unwrap();

        client.send(&[0x01]).unwrap();
        assert!(collect(&mut engine, &events, 1).is_empty());

        commands
            .send(&TransportCommand::UnblockAddress {
                address: "127.0.0.1".into(),
            })
            .unwrap();
        engine.tick().unwrap();
        client.send(&[0x01]).unwrap();
        assert_eq!(collect(&mut engine, &events, 2).len(), 2);
    }

    #[test]
    fn test_discovery_reply_carries_id_and_name() {
        let (mut engine, commands, _events, client) = started(UdpEngineConfig::default());
        commands
            .send(&TransportCommand::SetName {
                name: "Lobby".into(),
            })
            .unwrap();
        engine.tick().unwrap();

        client.send(&[TRANSPORT_RESERVED_ID, DISCOVERY_QUERY]).unwrap();
        for _ in 0..10 {
            engine.tick().unwrap();
        }

        let mut reply = [0u8; 64];
        let size = client.recv(&mut reply).unwrap();
        assert_eq!(&reply[..2], &[TRANSPORT_RESERVED_ID, DISCOVERY_REPLY]);
        assert_eq!(&reply[2..10], &0xABCDu64.to_be_bytes());
        assert_eq!(&reply[10..size], b"Lobby");
    }

    #[test]
    fn test_idle_peer_times_out() {
        let config = UdpEngineConfig {
            idle_timeout: Duration::from_millis(20),
            ..UdpEngineConfig::default()
        };
        let (mut engine, _commands, events, client) = started(config);
        client.send(&[0x01]).unwrap();
        collect(&mut engine, &events, 2);

        thread::sleep(Duration::from_millis(40));
        let out = collect(&mut engine, &events, 1);

        assert_eq!(
            out,
            vec![TransportEvent::ClientDisconnected {
                session_id: 1,
                reason: "timeout".into()
            }]
        );
    }

    #[test]
    fn test_ban_longer_than_the_clock_can_represent_is_permanent() {
        let (mut engine, commands, events, client) = started(UdpEngineConfig::default());
        commands
            .send(&TransportCommand::BlockAddress {
                address: "127.0.0.1".into(),
                timeout_secs: i64::MAX,
            })
            .unwrap();
        engine.tick().unwrap();

        client.send(&[0x01]).unwrap();
        assert!(collect(&mut engine, &events, 1).is_empty());
    }

    #[test]
    fn test_undeliverable_destinations_do_not_fail_the_tick() {
        let (mut engine, commands, _events, _client) = started(UdpEngineConfig::default());
        for (address, port) in [("127.0.0.1", 0), ("::1", 19132)] {
            commands
                .send(&TransportCommand::SendRaw {
                    address: address.into(),
                    port,
                    payload: b"PONG".to_vec(),
                })
                .unwrap();
        }

        assert!(engine.tick().is_ok());
        assert!(engine.tick().is_ok());
    }

    #[test]
    fn test_bind_conflict_is_a_bind_error() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (_commands, command_rx) = command_channel(4);
        let (event_tx, _events) = event_channel(4);
        let mut engine = UdpEngine::new(taken.local_addr().unwrap());

        let result = engine.start(EngineLink {
            server_id: 1,
            commands: command_rx,
            events: event_tx,
        });

        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }
}
