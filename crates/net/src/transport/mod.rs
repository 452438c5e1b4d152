mod bridge;
mod channel;
mod engine;
mod protocol;
mod thread;
mod udp;

pub use bridge::{BridgeConfig, MALFORMED_PACKET_BAN_SECS, TRANSPORT_RESERVED_ID, TransportBridge};
pub use channel::{
    Backpressure, ChannelError, ChannelReader, ChannelWriter, DEFAULT_CHANNEL_CAPACITY,
    byte_channel,
};
pub use engine::{EngineLink, TransportEngine, TransportError};
pub use protocol::{
    CommandReceiver, CommandSender, EventReceiver, EventSender, TransportCommand, TransportEvent,
    TransportSessionId, command_channel, event_channel,
};
pub use thread::{CrashInfo, CrashPhase, TransportThread};
pub use udp::{DISCOVERY_QUERY, DISCOVERY_REPLY, UdpEngine, UdpEngineConfig};
