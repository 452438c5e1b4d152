use std::fmt;

use super::bandwidth::BidirectionalBandwidthTracker;
use super::error::NetworkError;
use super::session::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Non-owning link from an interface back to the network that registered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHandle {
    pub network: u64,
    pub interface: InterfaceId,
}

/// Raw datagram picked up by an interface outside any session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub origin: NetworkHandle,
    pub address: String,
    pub port: u16,
    pub payload: Vec<u8>,
}

/// The parts of the network an interface may touch while it ticks.
pub struct InterfaceIo<'a> {
    pub sessions: &'a mut SessionManager,
    pub bandwidth: &'a mut BidirectionalBandwidthTracker,
    pub raw_packets: &'a mut Vec<RawPacket>,
}

pub trait NetworkInterface {
    /// Human readable description for logs, e.g. the bound address.
    fn describe(&self) -> String;

    fn start(&mut self) -> Result<(), NetworkError>;

    fn set_name(&mut self, name: &str);

    fn tick(&mut self, io: &mut InterfaceIo<'_>) -> Result<(), NetworkError>;

    fn shutdown(&mut self);

    fn as_advanced(&mut self) -> Option<&mut dyn AdvancedNetworkInterface> {
        None
    }
}

/// Interfaces that can also ban peers, inject raw datagrams and filter raw traffic.
pub trait AdvancedNetworkInterface: NetworkInterface {
    fn attach(&mut self, handle: NetworkHandle);

    /// Last name the network assigned, as advertised to clients.
    fn advertised_name(&self) -> String;

    /// `timeout_secs <= 0` bans permanently.
    fn block_address(&mut self, address: &str, timeout_secs: i64);

    fn unblock_address(&mut self, address: &str);

    fn send_raw_packet(&mut self, address: &str, port: u16, payload: &[u8]);

    fn add_raw_packet_filter(&mut self, pattern: &str);

    fn remove_raw_packet_filter(&mut self, pattern: &str);
}
