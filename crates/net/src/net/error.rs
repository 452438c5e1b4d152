use super::interface::InterfaceId;
use crate::transport::ChannelError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("failed to start network interface: {0}")]
    StartupFailure(String),
    #[error("transport crashed: {0}")]
    TransportCrash(String),
    #[error("interface {0} does not exist on this network")]
    InterfaceNotRegistered(InterfaceId),
    #[error("invalid raw packet pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("transport channel failure: {0}")]
    Channel(#[from] ChannelError),
}

impl NetworkError {
    /// Errors that mean an interface can no longer serve sessions.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NetworkError::TransportCrash(_))
    }
}

/// Failure to make sense of a payload from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unexpected packet {id:#04x}")]
    UnexpectedPacket { id: u8 },
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}
