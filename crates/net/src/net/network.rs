use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, warn};

use super::ban::BanTable;
use super::bandwidth::{BidirectionalBandwidthTracker, DEFAULT_HISTORY_SIZE};
use super::error::NetworkError;
use super::interface::{
    AdvancedNetworkInterface, InterfaceId, InterfaceIo, NetworkHandle, NetworkInterface,
};
use super::raw::{RawDispatch, RawHandlerId, RawPacketHandler, RegisteredHandler};
use super::session::SessionManager;
use crate::context::Context;

/// Cooldown applied to senders whose raw packets make a handler fail.
pub const RAW_ABUSE_BAN_SECS: i64 = 600;

static NEXT_NETWORK_ID: AtomicU64 = AtomicU64::new(1);

/// Owns every interface, the session table, bans and raw packet handlers.
///
/// All state that interfaces mirror (bans, filter patterns, the network name)
/// is changed here and fanned out, so every advanced interface sees the same set.
pub struct Network {
    id: u64,
    ctx: Context,
    name: String,
    interfaces: BTreeMap<InterfaceId, Box<dyn NetworkInterface>>,
    advanced: BTreeSet<InterfaceId>,
    raw_handlers: BTreeMap<RawHandlerId, RegisteredHandler>,
    bans: BanTable,
    sessions: SessionManager,
    bandwidth: BidirectionalBandwidthTracker,
    next_interface_id: u32,
    next_handler_id: u32,
}

impl Network {
    pub fn new(ctx: Context, name: impl Into<String>) -> Self {
        Self::with_history_size(ctx, name, DEFAULT_HISTORY_SIZE)
    }

    pub fn with_history_size(ctx: Context, name: impl Into<String>, history_size: usize) -> Self {
        Self {
            id: NEXT_NETWORK_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            name: name.into(),
            interfaces: BTreeMap::new(),
            advanced: BTreeSet::new(),
            raw_handlers: BTreeMap::new(),
            bans: BanTable::new(),
            sessions: SessionManager::new(),
            bandwidth: BidirectionalBandwidthTracker::new(history_size),
            next_interface_id: 0,
            next_handler_id: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }

    pub fn bandwidth(&self) -> &BidirectionalBandwidthTracker {
        &self.bandwidth
    }

    pub fn bandwidth_mut(&mut self) -> &mut BidirectionalBandwidthTracker {
        &mut self.bandwidth
    }

    pub fn bans(&self) -> &BanTable {
        &self.bans
    }

    pub fn is_banned(&self, address: &str) -> bool {
        self.bans.is_banned(address, self.ctx.now_secs())
    }

    pub fn interface_ids(&self) -> Vec<InterfaceId> {
        self.interfaces.keys().copied().collect()
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn advanced_interface_count(&self) -> usize {
        self.advanced.len()
    }

    pub fn raw_handler_count(&self) -> usize {
        self.raw_handlers.len()
    }

    pub fn describe_interface(&self, id: InterfaceId) -> Option<String> {
        self.interfaces.get(&id).map(|i| i.describe())
    }

    pub fn tick(&mut self) -> Result<(), NetworkError> {
        let ids: Vec<InterfaceId> = self.interfaces.keys().copied().collect();
        let mut raw_packets = Vec::new();

        for id in ids {
            if let Some(interface) = self.interfaces.get_mut(&id) {
                let mut io = InterfaceIo {
                    sessions: &mut self.sessions,
                    bandwidth: &mut self.bandwidth,
                    raw_packets: &mut raw_packets,
                };
                interface.tick(&mut io)?;
            }

            for packet in raw_packets.drain(..) {
                if packet.origin.network != self.id {
                    warn!(
                        "Raw packet from /{}:{} carries a handle for network {}, ignoring",
                        packet.address, packet.port, packet.origin.network
                    );
                    continue;
                }
                self.process_raw_packet(
                    packet.origin.interface,
                    &packet.address,
                    packet.port,
                    &packet.payload,
                );
            }
        }

        self.sessions.tick();
        self.bans.purge_expired(self.ctx.now_secs());
        Ok(())
    }

    /// Starts the interface and brings it in line with the current bans,
    /// raw filters and name. A startup error leaves the network untouched.
    pub fn register_interface(
        &mut self,
        mut interface: Box<dyn NetworkInterface>,
    ) -> Result<InterfaceId, NetworkError> {
        interface.start()?;

        self.next_interface_id += 1;
        let id = InterfaceId(self.next_interface_id);
        let now = self.ctx.now_secs();

        if let Some(advanced) = interface.as_advanced() {
            advanced.attach(NetworkHandle {
                network: self.id,
                interface: id,
            });
            for (address, timeout) in self.bans.active(now) {
                advanced.block_address(address, timeout);
            }
            for pattern in distinct_patterns(&self.raw_handlers) {
                advanced.add_raw_packet_filter(pattern);
            }
            self.advanced.insert(id);
        }

        interface.set_name(&self.name);
        debug!("Registered network interface {} ({})", id, interface.describe());
        self.interfaces.insert(id, interface);
        Ok(id)
    }

    /// Removes the interface and shuts it down. The interface is handed back
    /// so the caller controls when its resources are released.
    pub fn unregister_interface(
        &mut self,
        id: InterfaceId,
    ) -> Result<Box<dyn NetworkInterface>, NetworkError> {
        let mut interface = self
            .interfaces
            .remove(&id)
            .ok_or(NetworkError::InterfaceNotRegistered(id))?;
        self.advanced.remove(&id);
        interface.shutdown();
        debug!("Unregistered network interface {} ({})", id, interface.describe());
        Ok(interface)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        for interface in self.interfaces.values_mut() {
            interface.set_name(&self.name);
        }
    }

    /// Broadcasts a raw datagram through every advanced interface.
    pub fn send_packet(&mut self, address: &str, port: u16, payload: &[u8]) {
        self.for_each_advanced(|interface| interface.send_raw_packet(address, port, payload));
    }

    pub fn block_address(&mut self, address: &str, timeout_secs: i64) {
        let now = self.ctx.now_secs();
        self.bans.block(address, timeout_secs, now);
        if timeout_secs > 0 {
            debug!("Blocked {} for {}s", address, timeout_secs);
        } else {
            info!("Blocked {} permanently", address);
        }
        self.for_each_advanced(|interface| interface.block_address(address, timeout_secs));
    }

    pub fn unblock_address(&mut self, address: &str) {
        self.bans.unblock(address);
        debug!("Unblocked {}", address);
        self.for_each_advanced(|interface| interface.unblock_address(address));
    }

    pub fn register_raw_packet_handler(
        &mut self,
        handler: Box<dyn RawPacketHandler>,
    ) -> Result<RawHandlerId, NetworkError> {
        let registered = RegisteredHandler::compile(handler)?;
        let pattern = registered.pattern().to_owned();
        let is_new_pattern = !self
            .raw_handlers
            .values()
            .any(|existing| existing.pattern() == pattern);

        self.next_handler_id += 1;
        let id = RawHandlerId(self.next_handler_id);
        self.raw_handlers.insert(id, registered);

        if is_new_pattern {
            self.for_each_advanced(|interface| interface.add_raw_packet_filter(&pattern));
        }
        Ok(id)
    }

    pub fn unregister_raw_packet_handler(
        &mut self,
        id: RawHandlerId,
    ) -> Option<Box<dyn RawPacketHandler>> {
        let removed = self.raw_handlers.remove(&id)?;
        let pattern = removed.pattern().to_owned();
        let still_used = self
            .raw_handlers
            .values()
            .any(|existing| existing.pattern() == pattern);

        if !still_used {
            self.for_each_advanced(|interface| interface.remove_raw_packet_filter(&pattern));
        }
        Some(removed.handler)
    }

    /// Entry point for traffic that does not belong to a session.
    ///
    /// Every handler whose pattern matches runs, in registration order. The
    /// packet counts as handled if any of them claimed it or failed on it.
    pub fn process_raw_packet(
        &mut self,
        source: InterfaceId,
        address: &str,
        port: u16,
        payload: &[u8],
    ) -> RawDispatch {
        if self.bans.is_banned(address, self.ctx.now_secs()) {
            debug!("Dropped raw packet from banned address {}:{}", address, port);
            return RawDispatch::Dropped;
        }

        let Some(interface) = self
            .interfaces
            .get_mut(&source)
            .and_then(|interface| interface.as_advanced())
        else {
            debug!(
                "Raw packet from /{}:{} arrived on unknown interface {}",
                address, port, source
            );
            return RawDispatch::Unhandled;
        };

        let mut handled = false;
        let mut abusive = false;
        for registered in self.raw_handlers.values_mut() {
            if !registered.matcher.is_match(payload) {
                continue;
            }
            match registered.handler.handle(&mut *interface, address, port, payload) {
                Ok(claimed) => handled |= claimed,
                Err(e) => {
                    handled = true;
                    abusive = true;
                    error!("Bad raw packet from /{}:{}: {}", address, port, e);
                }
            }
        }

        if abusive {
            self.block_address(address, RAW_ABUSE_BAN_SECS);
        }

        if handled {
            RawDispatch::Handled
        } else {
            debug!("Unhandled raw packet from /{}:{}", address, port);
            RawDispatch::Unhandled
        }
    }

    fn for_each_advanced(&mut self, mut f: impl FnMut(&mut dyn AdvancedNetworkInterface)) {
        for id in &self.advanced {
            if let Some(interface) = self
                .interfaces
                .get_mut(id)
                .and_then(|interface| interface.as_advanced())
            {
                f(interface);
            }
        }
    }
}

fn distinct_patterns(handlers: &BTreeMap<RawHandlerId, RegisteredHandler>) -> Vec<&str> {
    let mut seen = BTreeSet::new();
    handlers
        .values()
        .map(|registered| registered.pattern())
        .filter(|pattern| seen.insert(*pattern))
        .collect()
}
