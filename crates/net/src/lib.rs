pub mod context;
pub mod net;
pub mod server;
pub mod transport;

pub use context::{Clock, Context, ManualClock, SystemClock};
pub use net::{
    AdvancedNetworkInterface, BanTable, BandwidthStatsTracker, BidirectionalBandwidthTracker,
    InterfaceId, InterfaceIo, Network, NetworkError, NetworkHandle, NetworkInterface,
    PacketError, PacketSender, PeerInfo, RawDispatch, RawHandlerId, RawPacket, RawPacketHandler,
    Session, SessionFactory, SessionHandler, SessionId, SessionManager, SessionStatus,
};
pub use server::{Server, ServerError, ServerState, TickConfig, TickStats, TickSubsystem};
pub use transport::{
    BridgeConfig, ChannelError, CrashInfo, TransportBridge, TransportEngine, TransportError,
    UdpEngine, UdpEngineConfig,
};
