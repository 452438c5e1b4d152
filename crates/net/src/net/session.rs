use std::collections::HashMap;
use std::fmt;

use super::error::PacketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Outbound half of a session, provided by the interface that owns the peer.
pub trait PacketSender {
    fn send(&mut self, payload: &[u8], immediate: bool);

    fn close(&mut self, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Close(String),
}

/// Game protocol logic driving one session.
pub trait SessionHandler {
    fn handle_encoded(
        &mut self,
        payload: &[u8],
        sender: &mut dyn PacketSender,
    ) -> Result<(), PacketError>;

    fn tick(&mut self, _sender: &mut dyn PacketSender) -> SessionStatus {
        SessionStatus::Active
    }

    fn on_disconnect(&mut self, _reason: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub port: u16,
    pub client_id: u64,
}

/// Builds the protocol handler for a freshly connected peer.
pub trait SessionFactory {
    fn create(&mut self, peer: &PeerInfo) -> Box<dyn SessionHandler>;
}

impl<F> SessionFactory for F
where
    F: FnMut(&PeerInfo) -> Box<dyn SessionHandler>,
{
    fn create(&mut self, peer: &PeerInfo) -> Box<dyn SessionHandler> {
        self(peer)
    }
}

pub struct Session {
    id: SessionId,
    peer: PeerInfo,
    connected: bool,
    ping_ms: Option<u64>,
    disconnect_reason: Option<String>,
    handler: Box<dyn SessionHandler>,
    sender: Box<dyn PacketSender>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: PeerInfo,
        handler: Box<dyn SessionHandler>,
        sender: Box<dyn PacketSender>,
    ) -> Self {
        Self {
            id,
            peer,
            connected: true,
            ping_ms: None,
            disconnect_reason: None,
            handler,
            sender,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn address(&self) -> &str {
        &self.peer.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn ping_ms(&self) -> Option<u64> {
        self.ping_ms
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    pub fn tick(&mut self) {
        if !self.connected {
            return;
        }
        if let SessionStatus::Close(reason) = self.handler.tick(self.sender.as_mut()) {
            self.disconnect(&reason);
        }
    }

    pub fn handle_encoded(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        self.handler.handle_encoded(payload, self.sender.as_mut())
    }

    pub fn send(&mut self, payload: &[u8], immediate: bool) {
        if self.connected {
            self.sender.send(payload, immediate);
        }
    }

    /// Server-initiated close. The transport is told to drop the peer.
    pub fn disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.disconnect_reason = Some(reason.to_owned());
        self.sender.close(reason);
        self.handler.on_disconnect(reason);
    }

    /// The transport already lost the peer; nothing is sent back.
    pub fn on_client_disconnect(&mut self, reason: &str) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.disconnect_reason = Some(reason.to_owned());
        self.handler.on_disconnect(reason);
    }

    pub fn update_ping(&mut self, ping_ms: u64) {
        self.ping_ms = Some(ping_ms);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.connected)
            .field("ping_ms", &self.ping_ms)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    next_session_id: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        peer: PeerInfo,
        handler: Box<dyn SessionHandler>,
        sender: Box<dyn PacketSender>,
    ) -> SessionId {
        self.next_session_id += 1;
        let id = SessionId(self.next_session_id);
        self.sessions
            .insert(id, Session::new(id, peer, handler, sender));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Ticks every session, then drops the ones that ended up disconnected.
    /// Returns the removed ids.
    pub fn tick(&mut self) -> Vec<SessionId> {
        for session in self.sessions.values_mut() {
            session.tick();
        }

        let closed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_connected())
            .map(|(&id, _)| id)
            .collect();

        for id in &closed {
            self.sessions.remove(id);
        }

        closed
    }

    /// Disconnects everyone and empties the table.
    pub fn close(&mut self, reason: &str) {
        for session in self.sessions.values_mut() {
            session.disconnect(reason);
        }
        self.sessions.clear();
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
