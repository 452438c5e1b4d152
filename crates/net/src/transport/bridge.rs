use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use log::{debug, error, warn};

use super::channel::{ChannelError, DEFAULT_CHANNEL_CAPACITY};
use super::engine::{EngineLink, TransportEngine};
use super::protocol::{
    CommandSender, EventReceiver, TransportCommand, TransportEvent, TransportSessionId,
    command_channel, event_channel,
};
use super::thread::TransportThread;
use crate::net::{
    AdvancedNetworkInterface, InterfaceIo, NetworkError, NetworkHandle, NetworkInterface,
    PacketSender, PeerInfo, RawPacket, SessionFactory, SessionId,
};

/// First byte of payloads that belong to the transport itself, not the game.
pub const TRANSPORT_RESERVED_ID: u8 = 0xFE;

/// Cooldown for a source whose session payload failed to decode.
pub const MALFORMED_PACKET_BAN_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub channel_capacity: usize,
    pub startup_timeout: Duration,
    /// Upper bound on events drained per tick; the rest wait for the next one.
    pub max_events_per_tick: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            startup_timeout: Duration::from_secs(10),
            max_events_per_tick: 4096,
        }
    }
}

/// Session outbound path: every call becomes a command for the transport thread.
struct BridgeSender {
    label: String,
    session_id: TransportSessionId,
    commands: CommandSender,
}

impl BridgeSender {
    fn submit(&self, command: TransportCommand) {
        if let Err(e) = self.commands.send(&command) {
            error!(
                "Transport {} dropped command for session {}: {}",
                self.label, self.session_id, e
            );
        }
    }
}

impl PacketSender for BridgeSender {
    fn send(&mut self, payload: &[u8], immediate: bool) {
        self.submit(TransportCommand::SendEncapsulated {
            session_id: self.session_id,
            payload: payload.to_vec(),
            immediate,
        });
    }

    fn close(&mut self, reason: &str) {
        self.submit(TransportCommand::CloseSession {
            session_id: self.session_id,
            reason: reason.to_owned(),
        });
    }
}

/// Advanced network interface backed by a transport engine on its own thread.
///
/// The engine is handed over at `start`. From then on the two sides only talk
/// through the command and event channels.
pub struct TransportBridge {
    label: String,
    name: String,
    config: BridgeConfig,
    server_id: u64,
    engine: Option<Box<dyn TransportEngine>>,
    link: Option<EngineLink>,
    commands: CommandSender,
    // Must drop before `thread`: a transport blocked on a full event channel
    // only wakes up once the receiver is gone.
    events: EventReceiver,
    thread: Option<TransportThread>,
    handle: Option<NetworkHandle>,
    factory: Box<dyn SessionFactory>,
    sessions: HashMap<TransportSessionId, SessionId>,
    /// Ban, filter and name updates the command channel had no room for.
    /// Flushed in order before anything else each tick.
    pending_sync: VecDeque<TransportCommand>,
}

impl TransportBridge {
    pub fn new(
        label: impl Into<String>,
        engine: Box<dyn TransportEngine>,
        factory: Box<dyn SessionFactory>,
    ) -> Self {
        Self::with_config(label, engine, factory, BridgeConfig::default())
    }

    pub fn with_config(
        label: impl Into<String>,
        engine: Box<dyn TransportEngine>,
        factory: Box<dyn SessionFactory>,
        config: BridgeConfig,
    ) -> Self {
        let server_id = rand::random::<u64>();
        let (commands, command_rx) = command_channel(config.channel_capacity);
        let (event_tx, events) = event_channel(config.channel_capacity);

        Self {
            label: label.into(),
            name: String::new(),
            config,
            server_id,
            engine: Some(engine),
            link: Some(EngineLink {
                server_id,
                commands: command_rx,
                events: event_tx,
            }),
            commands,
            events,
            thread: None,
            handle: None,
            factory,
            sessions: HashMap::new(),
            pending_sync: VecDeque::new(),
        }
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn handle(&self) -> Option<NetworkHandle> {
        self.handle
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(TransportThread::is_alive)
    }

    /// Transport sessions currently mapped to live sessions.
    pub fn mapped_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn submit(&self, command: TransportCommand) {
        if let Err(e) = self.commands.send(&command) {
            error!("Transport {} dropped command {:?}: {}", self.label, command, e);
        }
    }

    /// Queues state the transport must not miss. Order is kept, so a command
    /// never overtakes one still waiting for room.
    fn submit_sync(&mut self, command: TransportCommand) {
        if !self.pending_sync.is_empty() {
            self.pending_sync.push_back(command);
            return;
        }
        match self.commands.send(&command) {
            Ok(()) => {}
            Err(ChannelError::Full) => {
                warn!("Command channel of {} is full, deferring {:?}", self.label, command);
                self.pending_sync.push_back(command);
            }
            Err(e) => error!("Transport {} dropped command {:?}: {}", self.label, command, e),
        }
    }

    fn flush_sync(&mut self) {
        while let Some(command) = self.pending_sync.front() {
            match self.commands.send(command) {
                Ok(()) => {
                    self.pending_sync.pop_front();
                }
                Err(ChannelError::Full) => break,
                // The thread is gone; `check_thread` reports it if that was not requested.
                Err(e) => {
                    error!(
                        "Transport {} dropped {} queued commands: {}",
                        self.label,
                        self.pending_sync.len(),
                        e
                    );
                    self.pending_sync.clear();
                }
            }
        }
    }

    /// Sync commands still waiting for room in the command channel.
    pub fn pending_sync_commands(&self) -> usize {
        self.pending_sync.len()
    }

    fn check_thread(&self) -> Result<(), NetworkError> {
        let Some(thread) = &self.thread else {
            return Ok(());
        };
        if let Some(crash) = thread.crash_info() {
            return Err(NetworkError::TransportCrash(format!(
                "{}: {}",
                self.label,
                crash.pretty()
            )));
        }
        if !thread.is_alive() && !thread.is_shutdown_requested() {
            return Err(NetworkError::TransportCrash(format!(
                "{} crashed without crash information",
                self.label
            )));
        }
        Ok(())
    }

    fn handle_event(&mut self, event: TransportEvent, io: &mut InterfaceIo<'_>) {
        match event {
            TransportEvent::ClientConnected {
                session_id,
                address,
                port,
                client_id,
            } => {
                let peer = PeerInfo {
                    address,
                    port,
                    client_id,
                };
                if let Some(previous) = self.sessions.remove(&session_id) {
                    if let Some(session) = io.sessions.get_mut(previous) {
                        session.on_client_disconnect("Session replaced");
                    }
                }
                let handler = self.factory.create(&peer);
                let sender = BridgeSender {
                    label: self.label.clone(),
                    session_id,
                    commands: self.commands.clone(),
                };
                debug!(
                    "Session opened for /{}:{} on {}",
                    peer.address, peer.port, self.label
                );
                let id = io.sessions.open(peer, handler, Box::new(sender));
                self.sessions.insert(session_id, id);
            }
            TransportEvent::ClientDisconnected { session_id, reason } => {
                if let Some(id) = self.sessions.remove(&session_id) {
                    if let Some(session) = io.sessions.get_mut(id) {
                        debug!("Session {} closed by client: {}", session.address(), reason);
                        session.on_client_disconnect(&reason);
                    }
                }
            }
            TransportEvent::PacketReceived {
                session_id,
                payload,
            } => self.handle_packet(session_id, &payload, io),
            TransportEvent::RawPacketReceived {
                address,
                port,
                payload,
            } => match self.handle {
                Some(origin) => io.raw_packets.push(RawPacket {
                    origin,
                    address,
                    port,
                    payload,
                }),
                None => debug!(
                    "Raw packet from /{}:{} before {} was attached",
                    address, port, self.label
                ),
            },
            TransportEvent::PacketAck { .. } => {}
            TransportEvent::BandwidthStats {
                bytes_sent,
                bytes_received,
            } => io.bandwidth.add(bytes_sent, bytes_received),
            TransportEvent::PingMeasured {
                session_id,
                ping_ms,
            } => {
                if let Some(session) = self
                    .sessions
                    .get(&session_id)
                    .and_then(|&id| io.sessions.get_mut(id))
                {
                    session.update_ping(ping_ms);
                }
            }
        }
    }

    fn handle_packet(
        &mut self,
        session_id: TransportSessionId,
        payload: &[u8],
        io: &mut InterfaceIo<'_>,
    ) {
        let Some(session) = self
            .sessions
            .get(&session_id)
            .and_then(|&id| io.sessions.get_mut(id))
        else {
            debug!("Packet for unknown transport session {} on {}", session_id, self.label);
            return;
        };

        match payload.first() {
            None => {
                debug!("Dropped empty packet from {}", session.address());
                return;
            }
            Some(&TRANSPORT_RESERVED_ID) => {
                debug!("Dropped transport packet from {}", session.address());
                return;
            }
            Some(_) => {}
        }

        if let Err(e) = session.handle_encoded(&payload[1..]) {
            let error_id = hex::encode_upper(rand::random::<[u8; 6]>());
            let address = session.address().to_owned();
            error!(
                "Packet processing error from {} (Error ID: {}): {}",
                address, error_id, e
            );
            session.disconnect(&format!("Packet processing error (Error ID: {error_id})"));
            self.sessions.remove(&session_id);
            self.submit_sync(TransportCommand::BlockAddress {
                address,
                timeout_secs: MALFORMED_PACKET_BAN_SECS,
            });
        }
    }
}

impl fmt::Debug for TransportBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBridge")
            .field("label", &self.label)
            .field("server_id", &self.server_id)
            .field("handle", &self.handle)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl NetworkInterface for TransportBridge {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn start(&mut self) -> Result<(), NetworkError> {
        let (Some(engine), Some(link)) = (self.engine.take(), self.link.take()) else {
            return Err(NetworkError::StartupFailure(format!(
                "transport {} was already started",
                self.label
            )));
        };

        debug!("Waiting for transport {} to start", self.label);
        let thread = TransportThread::spawn_and_wait(
            format!("transport-{}", self.label),
            engine,
            link,
            self.config.startup_timeout,
        )?;
        debug!("Transport {} booted successfully", self.label);
        self.thread = Some(thread);
        Ok(())
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
        self.submit_sync(TransportCommand::SetName {
            name: name.to_owned(),
        });
    }

    fn tick(&mut self, io: &mut InterfaceIo<'_>) -> Result<(), NetworkError> {
        self.check_thread()?;
        self.flush_sync();

        self.sessions.retain(|_, id| io.sessions.contains(*id));

        for _ in 0..self.config.max_events_per_tick {
            match self.events.try_recv() {
                Ok(Some(event)) => self.handle_event(event, io),
                Ok(None) | Err(ChannelError::Disconnected) => break,
                Err(e) => warn!("Discarded unreadable event from {}: {}", self.label, e),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(thread) = &self.thread {
            thread.request_shutdown();
        }
        self.sessions.clear();
    }

    fn as_advanced(&mut self) -> Option<&mut dyn AdvancedNetworkInterface> {
        Some(self)
    }
}

impl AdvancedNetworkInterface for TransportBridge {
    fn attach(&mut self, handle: NetworkHandle) {
        self.handle = Some(handle);
    }

    fn advertised_name(&self) -> String {
        self.name.clone()
    }

    fn block_address(&mut self, address: &str, timeout_secs: i64) {
        self.submit_sync(TransportCommand::BlockAddress {
            address: address.to_owned(),
            timeout_secs,
        });
    }

    fn unblock_address(&mut self, address: &str) {
        self.submit_sync(TransportCommand::UnblockAddress {
            address: address.to_owned(),
        });
    }

    fn send_raw_packet(&mut self, address: &str, port: u16, payload: &[u8]) {
        self.submit(TransportCommand::SendRaw {
            address: address.to_owned(),
            port,
            payload: payload.to_vec(),
        });
    }

    fn add_raw_packet_filter(&mut self, pattern: &str) {
        self.submit_sync(TransportCommand::AddRawFilter {
            pattern: pattern.to_owned(),
        });
    }

    fn remove_raw_packet_filter(&mut self, pattern: &str) {
        self.submit_sync(TransportCommand::RemoveRawFilter {
            pattern: pattern.to_owned(),
        });
    }
}
