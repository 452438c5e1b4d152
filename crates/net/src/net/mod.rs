mod ban;
mod bandwidth;
mod error;
mod interface;
mod network;
mod raw;
mod session;

pub use ban::{BanTable, DEFAULT_BAN_SECS, PERMANENT};
pub use bandwidth::{BandwidthStatsTracker, BidirectionalBandwidthTracker, DEFAULT_HISTORY_SIZE};
pub use error::{NetworkError, PacketError};
pub use interface::{
    AdvancedNetworkInterface, InterfaceId, InterfaceIo, NetworkHandle, NetworkInterface, RawPacket,
};
pub use network::{Network, RAW_ABUSE_BAN_SECS};
pub use raw::{RawDispatch, RawHandlerId, RawPacketHandler};
pub use session::{
    PacketSender, PeerInfo, Session, SessionFactory, SessionHandler, SessionId, SessionManager,
    SessionStatus,
};
