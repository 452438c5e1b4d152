use std::collections::HashMap;

/// Expiry used for bans that never lift.
pub const PERMANENT: i64 = i64::MAX;

pub const DEFAULT_BAN_SECS: i64 = 300;

/// Address → absolute expiry (epoch seconds).
#[derive(Debug, Default, Clone)]
pub struct BanTable {
    entries: HashMap<String, i64>,
}

impl BanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A timeout of zero or less bans permanently. Any previous entry is replaced.
    pub fn block(&mut self, address: &str, timeout_secs: i64, now: i64) -> i64 {
        let expiry = if timeout_secs > 0 {
            now.saturating_add(timeout_secs)
        } else {
            PERMANENT
        };
        self.entries.insert(address.to_owned(), expiry);
        expiry
    }

    pub fn unblock(&mut self, address: &str) -> bool {
        self.entries.remove(address).is_some()
    }

    pub fn is_banned(&self, address: &str, now: i64) -> bool {
        self.entries
            .get(address)
            .is_some_and(|&expiry| now < expiry)
    }

    pub fn expiry(&self, address: &str) -> Option<i64> {
        self.entries.get(address).copied()
    }

    /// Bans still in force, with the timeout an interface should apply
    /// (0 for permanent, remaining seconds otherwise).
    pub fn active(&self, now: i64) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.entries.iter().filter_map(move |(address, &expiry)| {
            if expiry == PERMANENT {
                Some((address.as_str(), 0))
            } else if now < expiry {
                Some((address.as_str(), expiry - now))
            } else {
                None
            }
        })
    }

    pub fn purge_expired(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, &mut expiry| now < expiry);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
