use std::io;
use std::net::SocketAddr;

use super::channel::ChannelError;
use super::protocol::{CommandReceiver, EventSender};

/// Channel ends handed to an engine when its thread starts.
#[derive(Debug)]
pub struct EngineLink {
    pub server_id: u64,
    pub commands: CommandReceiver,
    pub events: EventSender,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("engine used before start")]
    NotStarted,
}

/// The reliable-transport protocol engine driven by a transport thread.
///
/// `start` and every `tick` run on the transport thread. `tick` is called in a
/// loop until shutdown is requested, so it should wait on I/O for a bounded
/// amount of time rather than spin.
pub trait TransportEngine: Send {
    fn start(&mut self, link: EngineLink) -> Result<(), TransportError>;

    fn tick(&mut self) -> Result<(), TransportError>;

    /// Drain outstanding work and release sockets.
    fn shutdown(&mut self);
}
