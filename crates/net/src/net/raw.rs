use std::fmt;

use regex::bytes::Regex;

use super::error::{NetworkError, PacketError};
use super::interface::AdvancedNetworkInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawHandlerId(pub u32);

impl fmt::Display for RawHandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raw-handler-{}", self.0)
    }
}

/// Handles datagrams that arrive outside an established session
/// (server discovery, query pings and similar).
pub trait RawPacketHandler {
    /// Regular expression matched against the raw payload bytes.
    fn pattern(&self) -> &str;

    /// `Ok(true)` claims the packet. An error marks the sender as abusive.
    fn handle(
        &mut self,
        interface: &mut dyn AdvancedNetworkInterface,
        address: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<bool, PacketError>;
}

pub(crate) struct RegisteredHandler {
    pub matcher: Regex,
    pub handler: Box<dyn RawPacketHandler>,
}

impl RegisteredHandler {
    pub fn compile(handler: Box<dyn RawPacketHandler>) -> Result<Self, NetworkError> {
        let matcher = Regex::new(handler.pattern()).map_err(|source| NetworkError::InvalidPattern {
            pattern: handler.pattern().to_owned(),
            source,
        })?;
        Ok(Self { matcher, handler })
    }

    pub fn pattern(&self) -> &str {
        self.handler.pattern()
    }
}

/// What `Network::process_raw_packet` did with a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawDispatch {
    /// Sender is banned; no handler ran.
    Dropped,
    Handled,
    Unhandled,
}
