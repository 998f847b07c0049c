//! Listener ban list: exact addresses and CIDR blocks, permanent or
//! expiring. Expired entries are evicted opportunistically during
//! lookups.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::policy::fxp::PeerPattern;

struct Inner {
    exact: HashMap<IpAddr, Option<Instant>>,
    blocks: Vec<(PeerPattern, Option<Instant>)>,
}

/// The two ban stores consulted on every accept.
pub struct BanList {
    inner: Mutex<Inner>,
}

impl Default for BanList {
    fn default() -> Self {
        BanList::new()
    }
}

impl BanList {
    pub fn new() -> Self {
        BanList { inner: Mutex::new(Inner { exact: HashMap::new(), blocks: Vec::new() }) }
    }

    /// Bans a single address. `duration` of `None` is permanent.
    pub fn ban_ip(&self, ip: IpAddr, duration: Option<Duration>) {
        let expiry = duration.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        inner.exact.insert(ip, expiry);
        info!(%ip, permanent = duration.is_none(), "IP banned");
    }

    /// Bans a CIDR block given in `addr/bits` form. Returns false when
    /// the block does not parse.
    pub fn ban_cidr(&self, cidr: &str, duration: Option<Duration>) -> bool {
        let Ok(pattern) = cidr.parse::<PeerPattern>() else { return false };
        if !matches!(pattern, PeerPattern::CidrV4(..) | PeerPattern::CidrV6(..)) {
            return false;
        }
        let expiry = duration.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        inner.blocks.push((pattern, expiry));
        info!(%cidr, permanent = duration.is_none(), "CIDR block banned");
        true
    }

    pub fn unban_ip(&self, ip: &IpAddr) -> bool {
        self.inner.lock().expect("ban list lock poisoned").exact.remove(ip).is_some()
    }

    /// Scans both stores, evicting expired entries as it goes.
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        inner.exact.retain(|_, expiry| expiry.map(|e| e > now).unwrap_or(true));
        inner.blocks.retain(|(_, expiry)| expiry.map(|e| e > now).unwrap_or(true));
        if inner.exact.contains_key(ip) {
            return true;
        }
        inner.blocks.iter().any(|(pattern, _)| pattern.matches(ip, None))
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("ban list lock poisoned");
        inner.exact.len() + inner.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
