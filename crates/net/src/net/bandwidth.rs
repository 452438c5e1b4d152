pub const DEFAULT_HISTORY_SIZE: usize = 5;

/// Rolling histogram of bytes moved in one direction.
///
/// `add` only accumulates; `rotate_history` is expected to be called once per
/// sampling interval and snapshots the pending bytes into the ring.
#[derive(Debug, Clone)]
pub struct BandwidthStatsTracker {
    history: Vec<u64>,
    next_index: usize,
    bytes_since_last: u64,
    total_bytes: u64,
}

impl BandwidthStatsTracker {
    /// A history size of zero is treated as one.
    pub fn new(history_size: usize) -> Self {
        Self {
            history: vec![0; history_size.max(1)],
            next_index: 0,
            bytes_since_last: 0,
            total_bytes: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        self.bytes_since_last = self.bytes_since_last.saturating_add(bytes);
    }

    pub fn rotate_history(&mut self) {
        self.history[self.next_index] = self.bytes_since_last;
        self.bytes_since_last = 0;
        self.next_index = (self.next_index + 1) % self.history.len();
    }

    /// Trailing mean over the last `history_size` sampling intervals.
    pub fn average_bytes(&self) -> u64 {
        self.history.iter().sum::<u64>() / self.history.len() as u64
    }

    pub fn reset_history(&mut self) {
        self.history.fill(0);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn pending_bytes(&self) -> u64 {
        self.bytes_since_last
    }

    pub fn history_size(&self) -> usize {
        self.history.len()
    }
}

impl Default for BandwidthStatsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BidirectionalBandwidthTracker {
    send: BandwidthStatsTracker,
    receive: BandwidthStatsTracker,
}

impl BidirectionalBandwidthTracker {
    pub fn new(history_size: usize) -> Self {
        Self {
            send: BandwidthStatsTracker::new(history_size),
            receive: BandwidthStatsTracker::new(history_size),
        }
    }

    pub fn add(&mut self, sent_bytes: u64, received_bytes: u64) {
        self.send.add(sent_bytes);
        self.receive.add(received_bytes);
    }

    pub fn rotate_history(&mut self) {
        self.send.rotate_history();
        self.receive.rotate_history();
    }

    pub fn reset_history(&mut self) {
        self.send.reset_history();
        self.receive.reset_history();
    }

    pub fn send(&self) -> &BandwidthStatsTracker {
        &self.send
    }

    pub fn receive(&self) -> &BandwidthStatsTracker {
        &self.receive
    }
}
